use super::{CapacityRange, VolumeCapability};
use crate::{proto, volume::capacity_range};
use std::{
  convert::{TryFrom, TryInto},
  path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug)]
pub struct NodeExpandVolumeRequest {
  volume_id: String,
  volume_path: Option<PathBuf>,
  capacity_range: CapacityRange,
  staging_target_path: Option<PathBuf>,
  volume_capability: Option<VolumeCapability>,
}

impl NodeExpandVolumeRequest {
  /// The ID of the volume. This field is REQUIRED.
  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  /// The path on which volume is available.
  #[inline]
  pub fn volume_path(&self) -> Option<&Path> {
    self.volume_path.as_deref()
  }

  /// The capacity requirements of the volume after expansion.
  #[inline]
  pub fn capacity_range(&self) -> CapacityRange {
    self.capacity_range
  }

  #[inline]
  pub fn staging_target_path(&self) -> Option<&Path> {
    self.staging_target_path.as_deref()
  }

  /// Volume capability describing how the CO intends to use this volume.
  /// This is an OPTIONAL field.
  #[inline]
  pub fn volume_capability(&self) -> Option<&VolumeCapability> {
    self.volume_capability.as_ref()
  }
}

fn absolute_path(value: String, error: &'static str) -> Result<Option<PathBuf>, tonic::Status> {
  match value {
    v if v.is_empty() => Ok(None),
    v => match PathBuf::from(v) {
      v if !v.is_absolute() => Err(tonic::Status::invalid_argument(error)),
      v => Ok(Some(v)),
    },
  }
}

impl TryFrom<proto::NodeExpandVolumeRequest> for NodeExpandVolumeRequest {
  type Error = tonic::Status;

  fn try_from(value: proto::NodeExpandVolumeRequest) -> Result<Self, Self::Error> {
    let volume_id = match value.volume_id {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "NodeExpandVolumeRequest.volume_id is empty",
        ))
      }
      v => v,
    };

    let volume_path = absolute_path(
      value.volume_path,
      "NodeExpandVolumeRequest.volume_path is not absolute",
    )?;
    let staging_target_path = absolute_path(
      value.staging_target_path,
      "NodeExpandVolumeRequest.staging_target_path is not absolute",
    )?;

    let capacity_range = match capacity_range(value.capacity_range)? {
      None => {
        return Err(tonic::Status::invalid_argument(
          "NodeExpandVolumeRequest.capacity_range missing",
        ))
      }
      Some(v) => v,
    };

    let volume_capability = value.volume_capability.map(TryInto::try_into).transpose()?;

    Ok(NodeExpandVolumeRequest {
      volume_id,
      volume_path,
      capacity_range,
      staging_target_path,
      volume_capability,
    })
  }
}

#[derive(Debug)]
pub struct NodeExpandVolumeResponse {
  /// The capacity of the volume in bytes.
  capacity_bytes: u64,
}

impl NodeExpandVolumeResponse {
  pub fn new(capacity_bytes: u64) -> Self {
    NodeExpandVolumeResponse { capacity_bytes }
  }

  #[inline]
  pub fn capacity_bytes(&self) -> u64 {
    self.capacity_bytes
  }
}

impl TryFrom<NodeExpandVolumeResponse> for proto::NodeExpandVolumeResponse {
  type Error = tonic::Status;

  fn try_from(value: NodeExpandVolumeResponse) -> Result<Self, Self::Error> {
    let capacity_bytes = i64::try_from(value.capacity_bytes).map_err(|_| {
      tonic::Status::out_of_range("NodeExpandVolumeResponse.capacity_bytes overflows int64")
    })?;

    Ok(proto::NodeExpandVolumeResponse { capacity_bytes })
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum NodeExpandVolumeError {
  /// Indicates that CO has specified capabilities not supported by the volume.
  #[error("Exceeds capabilities: {0}")]
  ExceedsCapabilities(String),

  /// Indicates that a volume corresponding to the specified volume_id does not exist.
  #[error("Volume does not exist: {0}")]
  VolumeNotFound(String),

  /// Indicates that the capacity range is not allowed by the Plugin.
  #[error("Unsupported capacity_range: {0}")]
  UnsupportedCapacityRange(String),

  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<NodeExpandVolumeError> for tonic::Status {
  fn from(value: NodeExpandVolumeError) -> Self {
    use tonic::{Code, Status};

    match value {
      NodeExpandVolumeError::ExceedsCapabilities(v) => Status::new(Code::InvalidArgument, v),
      NodeExpandVolumeError::VolumeNotFound(v) => Status::new(Code::NotFound, v),
      NodeExpandVolumeError::UnsupportedCapacityRange(v) => Status::new(Code::OutOfRange, v),
      NodeExpandVolumeError::Other(v) => v,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn volume_path_is_optional() {
    let request = NodeExpandVolumeRequest::try_from(proto::NodeExpandVolumeRequest {
      volume_id: "vol".into(),
      capacity_range: Some(proto::CapacityRange {
        required_bytes: 1 << 30,
        limit_bytes: 0,
      }),
      ..Default::default()
    })
    .unwrap();

    assert_eq!(request.volume_path(), None);
    assert_eq!(request.capacity_range().required_bytes(), Some(1 << 30));
  }

  #[test]
  fn relative_volume_path_is_rejected() {
    let err = NodeExpandVolumeRequest::try_from(proto::NodeExpandVolumeRequest {
      volume_id: "vol".into(),
      volume_path: "mnt".into(),
      capacity_range: Some(proto::CapacityRange {
        required_bytes: 1,
        limit_bytes: 0,
      }),
      ..Default::default()
    })
    .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
  }

  #[test]
  fn capacity_range_is_required() {
    let err = NodeExpandVolumeRequest::try_from(proto::NodeExpandVolumeRequest {
      volume_id: "vol".into(),
      ..Default::default()
    })
    .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
  }
}
