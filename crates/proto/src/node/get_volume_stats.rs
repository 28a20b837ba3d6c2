use super::{VolumeCondition, VolumeUsage};
use crate::proto;
use std::{
  convert::{TryFrom, TryInto},
  path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug)]
pub struct NodeGetVolumeStatsRequest {
  volume_id: String,
  volume_path: PathBuf,
  staging_target_path: Option<PathBuf>,
}

impl NodeGetVolumeStatsRequest {
  /// The ID of the volume. This field is REQUIRED.
  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  /// Any path where the volume was previously staged or published.
  /// This is a REQUIRED field.
  #[inline]
  pub fn volume_path(&self) -> &Path {
    &self.volume_path
  }

  #[inline]
  pub fn staging_target_path(&self) -> Option<&Path> {
    self.staging_target_path.as_deref()
  }
}

impl TryFrom<proto::NodeGetVolumeStatsRequest> for NodeGetVolumeStatsRequest {
  type Error = tonic::Status;

  fn try_from(value: proto::NodeGetVolumeStatsRequest) -> Result<Self, Self::Error> {
    let volume_id = match value.volume_id {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "NodeGetVolumeStatsRequest.volume_id is empty",
        ))
      }
      v => v,
    };

    let volume_path = match value.volume_path {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "NodeGetVolumeStatsRequest.volume_path is empty",
        ))
      }
      v => match PathBuf::from(v) {
        v if !v.is_absolute() => {
          return Err(tonic::Status::invalid_argument(
            "NodeGetVolumeStatsRequest.volume_path is not absolute",
          ))
        }
        v => v,
      },
    };

    let staging_target_path = match value.staging_target_path {
      v if v.is_empty() => None,
      v => match PathBuf::from(v) {
        v if !v.is_absolute() => {
          return Err(tonic::Status::invalid_argument(
            "NodeGetVolumeStatsRequest.staging_target_path is not absolute",
          ))
        }
        v => Some(v),
      },
    };

    Ok(NodeGetVolumeStatsRequest {
      volume_id,
      volume_path,
      staging_target_path,
    })
  }
}

#[derive(Debug)]
pub struct NodeGetVolumeStatsResponse {
  usage: Vec<VolumeUsage>,

  /// Information about the current condition of the volume. MUST be
  /// specified if the VOLUME_CONDITION node capability is supported.
  volume_condition: Option<VolumeCondition>,
}

impl NodeGetVolumeStatsResponse {
  pub fn new(usage: Vec<VolumeUsage>) -> Self {
    NodeGetVolumeStatsResponse {
      usage,
      volume_condition: None,
    }
  }

  pub fn with_volume_condition(mut self, volume_condition: VolumeCondition) -> Self {
    self.volume_condition = Some(volume_condition);
    self
  }

  #[inline]
  pub fn usage(&self) -> &[VolumeUsage] {
    &self.usage
  }

  #[inline]
  pub fn volume_condition(&self) -> Option<&VolumeCondition> {
    self.volume_condition.as_ref()
  }
}

impl TryFrom<NodeGetVolumeStatsResponse> for proto::NodeGetVolumeStatsResponse {
  type Error = tonic::Status;

  fn try_from(value: NodeGetVolumeStatsResponse) -> Result<Self, Self::Error> {
    let usage = value
      .usage
      .into_iter()
      .map(TryInto::try_into)
      .collect::<Result<_, _>>()?;

    Ok(proto::NodeGetVolumeStatsResponse {
      usage,
      volume_condition: value.volume_condition.map(Into::into),
    })
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum NodeGetVolumeStatsError {
  /// Indicates that a volume corresponding to the specified `volume_id` does not exist
  /// at the given `volume_path`.
  #[error("Volume does not exist: {0}")]
  VolumeNotFound(String),

  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<NodeGetVolumeStatsError> for tonic::Status {
  fn from(value: NodeGetVolumeStatsError) -> Self {
    use tonic::{Code, Status};

    match value {
      NodeGetVolumeStatsError::VolumeNotFound(v) => Status::new(Code::NotFound, v),
      NodeGetVolumeStatsError::Other(v) => v,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn usage_and_condition() {
    let response = NodeGetVolumeStatsResponse::new(vec![VolumeUsage::bytes(512)])
      .with_volume_condition(VolumeCondition::healthy("healthy"));
    let response = proto::NodeGetVolumeStatsResponse::try_from(response).unwrap();

    assert_eq!(response.usage.len(), 1);
    assert_eq!(response.usage[0].used, 512);
    assert_eq!(
      response.usage[0].unit,
      proto::volume_usage::Unit::Bytes as i32
    );
    let condition = response.volume_condition.unwrap();
    assert!(!condition.abnormal);
    assert_eq!(condition.message, "healthy");
  }

  #[test]
  fn volume_path_is_required() {
    let err = NodeGetVolumeStatsRequest::try_from(proto::NodeGetVolumeStatsRequest {
      volume_id: "vol".into(),
      ..Default::default()
    })
    .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
  }
}
