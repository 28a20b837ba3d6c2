use crate::proto;
use std::{
  convert::TryFrom,
  path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug)]
pub struct NodeUnpublishVolumeRequest {
  volume_id: String,
  target_path: PathBuf,
}

impl NodeUnpublishVolumeRequest {
  /// The ID of the volume. This field is REQUIRED.
  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  /// The path at which the volume was published. It MUST be an absolute
  /// path in the root filesystem of the process serving this request.
  /// The SP MUST delete the file or directory it created at this path.
  #[inline]
  pub fn target_path(&self) -> &Path {
    &self.target_path
  }
}

impl TryFrom<proto::NodeUnpublishVolumeRequest> for NodeUnpublishVolumeRequest {
  type Error = tonic::Status;

  fn try_from(value: proto::NodeUnpublishVolumeRequest) -> Result<Self, Self::Error> {
    let volume_id = match value.volume_id {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "NodeUnpublishVolumeRequest.volume_id is empty",
        ))
      }
      v => v,
    };

    let target_path = match value.target_path {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "NodeUnpublishVolumeRequest.target_path is empty",
        ))
      }
      v => match PathBuf::from(v) {
        v if !v.is_absolute() => {
          return Err(tonic::Status::invalid_argument(
            "NodeUnpublishVolumeRequest.target_path is not absolute",
          ))
        }
        v => v,
      },
    };

    Ok(NodeUnpublishVolumeRequest {
      volume_id,
      target_path,
    })
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum NodeUnpublishVolumeError {
  /// Indicates that a volume corresponding to the specified `volume_id` does not exist.
  #[error("Volume does not exist: {0}")]
  VolumeNotFound(String),

  /// Another operation on the same volume is still running.
  #[error("Operation pending for volume: {0}")]
  OperationPending(String),

  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<NodeUnpublishVolumeError> for tonic::Status {
  fn from(value: NodeUnpublishVolumeError) -> Self {
    use tonic::{Code, Status};

    match value {
      NodeUnpublishVolumeError::VolumeNotFound(v) => Status::new(Code::NotFound, v),
      NodeUnpublishVolumeError::OperationPending(v) => Status::new(Code::Aborted, v),
      NodeUnpublishVolumeError::Other(v) => v,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn valid_request() {
    let request = NodeUnpublishVolumeRequest::try_from(proto::NodeUnpublishVolumeRequest {
      volume_id: "vol".into(),
      target_path: "/mnt/target".into(),
    })
    .unwrap();

    assert_eq!(request.volume_id(), "vol");
    assert_eq!(request.target_path(), Path::new("/mnt/target"));
  }

  #[test]
  fn volume_id_is_required() {
    let err = NodeUnpublishVolumeRequest::try_from(proto::NodeUnpublishVolumeRequest {
      volume_id: String::new(),
      target_path: "/mnt/target".into(),
    })
    .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
  }
}
