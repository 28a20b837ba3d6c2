use crate::{context::Interrupted, rc::RcError, volume::Conflict};
use csi_mount_utils::MountError;
use std::io;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures reported by the volume and mount orchestrators.
#[derive(Debug, Error)]
pub enum Error {
  /// A required field is missing or malformed.
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  #[error("{0} not found")]
  NotFound(String),

  /// The remote is not configured in rclone.
  #[error("remote {0:?} not found: didn't find section in config file")]
  RemoteNotFound(String),

  /// Stored metadata carries a different id than the name derives to.
  #[error("volume {requested} already exists: different id found in metadata file ({stored})")]
  IdentityConflict { stored: String, requested: String },

  #[error(
    "volume {id} already exists: different capacity found in metadata file \
     (stored {stored}, requested {requested})"
  )]
  CapacityConflict {
    id: String,
    stored: u64,
    requested: u64,
  },

  #[error("an operation with the given Volume ID {0} already exists")]
  OperationInProgress(String),

  #[error("operation was cancelled")]
  Cancelled,

  #[error("deadline exceeded")]
  DeadlineExceeded,

  #[error("{0}")]
  Internal(String),
}

impl Error {
  pub(crate) fn internal(context: &str, err: impl std::fmt::Display) -> Self {
    Error::Internal(format!("{}: {}", context, err))
  }

  pub(crate) fn conflict(id: &str, conflict: Conflict) -> Self {
    match conflict {
      Conflict::Identity { stored, requested } => Error::IdentityConflict { stored, requested },
      Conflict::Capacity { stored, requested } => Error::CapacityConflict {
        id: id.to_owned(),
        stored,
        requested,
      },
    }
  }

  /// Whether the caller's request clashes with an existing volume.
  pub fn is_conflict(&self) -> bool {
    matches!(
      self,
      Error::IdentityConflict { .. } | Error::CapacityConflict { .. }
    )
  }
}

impl From<Interrupted> for Error {
  fn from(value: Interrupted) -> Self {
    match value {
      Interrupted::Cancelled => Error::Cancelled,
      Interrupted::DeadlineExceeded => Error::DeadlineExceeded,
    }
  }
}

impl From<RcError> for Error {
  fn from(value: RcError) -> Self {
    match value {
      RcError::NotFound => Error::NotFound("object".into()),
      RcError::RemoteNotFound => Error::RemoteNotFound(String::new()),
      RcError::Interrupted(i) => i.into(),
      other => Error::internal("remote control", other),
    }
  }
}

impl From<MountError> for Error {
  fn from(value: MountError) -> Self {
    Error::internal("mount", value)
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    Error::internal("io", value)
  }
}

impl From<Error> for tonic::Status {
  fn from(value: Error) -> Self {
    use tonic::{Code, Status};

    let code = match &value {
      Error::InvalidRequest(_) => Code::InvalidArgument,
      Error::NotFound(_) => Code::NotFound,
      Error::RemoteNotFound(_) => Code::FailedPrecondition,
      Error::IdentityConflict { .. } | Error::CapacityConflict { .. } => Code::AlreadyExists,
      Error::OperationInProgress(_) => Code::Aborted,
      Error::Cancelled => Code::Cancelled,
      Error::DeadlineExceeded => Code::DeadlineExceeded,
      Error::Internal(_) => Code::Internal,
    };

    Status::new(code, value.to_string())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;
  use tonic::Code;

  #[test_case(Error::InvalidRequest("x".into()), Code::InvalidArgument)]
  #[test_case(Error::NotFound("x".into()), Code::NotFound)]
  #[test_case(Error::RemoteNotFound("r".into()), Code::FailedPrecondition)]
  #[test_case(Error::IdentityConflict { stored: "a".into(), requested: "b".into() }, Code::AlreadyExists ; "identity conflict")]
  #[test_case(Error::CapacityConflict { id: "a".into(), stored: 1, requested: 2 }, Code::AlreadyExists ; "capacity conflict")]
  #[test_case(Error::OperationInProgress("a".into()), Code::Aborted)]
  #[test_case(Error::Cancelled, Code::Cancelled)]
  #[test_case(Error::DeadlineExceeded, Code::DeadlineExceeded)]
  #[test_case(Error::Internal("x".into()), Code::Internal)]
  fn status_codes(err: Error, code: Code) {
    assert_eq!(tonic::Status::from(err).code(), code);
  }

  #[test]
  fn remote_errors() {
    assert!(matches!(Error::from(RcError::NotFound), Error::NotFound(_)));
    assert!(matches!(
      Error::from(RcError::Interrupted(Interrupted::DeadlineExceeded)),
      Error::DeadlineExceeded
    ));
    assert!(matches!(
      Error::from(RcError::Failed {
        method: "operations/purge".into(),
        message: "boom".into()
      }),
      Error::Internal(_)
    ));
  }

  #[test]
  fn in_progress_message() {
    assert_eq!(
      Error::OperationInProgress("abc".into()).to_string(),
      "an operation with the given Volume ID abc already exists"
    );
  }
}
