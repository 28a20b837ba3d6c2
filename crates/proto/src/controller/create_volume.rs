use super::{CapacityRange, VolumeCapability, VolumeContentSource};
use crate::{
  proto,
  secrets::Secrets,
  volume::{capacity_range, volume_capabilities},
};
use std::{
  collections::HashMap,
  convert::{TryFrom, TryInto},
};
use thiserror::Error;

#[derive(Debug)]
pub struct CreateVolumeRequest {
  name: String,
  capacity_range: Option<CapacityRange>,
  volume_capabilities: Vec<VolumeCapability>,
  parameters: HashMap<String, String>,
  secrets: Secrets,
  volume_content_source: Option<VolumeContentSource>,
}

impl CreateVolumeRequest {
  /// The suggested name for the storage space. This field is REQUIRED.
  /// It serves two purposes:
  /// 1) Idempotency - This name is generated by the CO to achieve
  ///    idempotency. The Plugin SHOULD ensure that multiple
  ///    `CreateVolume` calls for the same name do not result in more
  ///    than one piece of storage provisioned corresponding to that
  ///    name.
  /// 2) Suggested name - Some storage systems allow callers to specify
  ///    an identifier by which to refer to the newly provisioned
  ///    storage. If a storage system supports this, it can optionally
  ///    use this name as the identifier for the new volume.
  #[inline]
  pub fn name(&self) -> &str {
    &self.name
  }

  /// This field is OPTIONAL. This allows the CO to specify the capacity
  /// requirement of the volume to be provisioned.
  #[inline]
  pub fn capacity_range(&self) -> Option<CapacityRange> {
    self.capacity_range
  }

  /// The capabilities that the provisioned volume MUST have. This field
  /// is REQUIRED, and never empty.
  #[inline]
  pub fn volume_capabilities(&self) -> &[VolumeCapability] {
    &self.volume_capabilities
  }

  /// Plugin specific parameters passed in as opaque key-value pairs.
  /// This field is OPTIONAL.
  #[inline]
  pub fn parameters(&self) -> &HashMap<String, String> {
    &self.parameters
  }

  #[inline]
  pub fn secrets(&self) -> &HashMap<String, String> {
    self.secrets.as_ref()
  }

  /// If specified, the new volume will be pre-populated with data from
  /// this source. This field is OPTIONAL.
  #[inline]
  pub fn volume_content_source(&self) -> Option<&VolumeContentSource> {
    self.volume_content_source.as_ref()
  }
}

impl TryFrom<proto::CreateVolumeRequest> for CreateVolumeRequest {
  type Error = tonic::Status;

  fn try_from(value: proto::CreateVolumeRequest) -> Result<Self, Self::Error> {
    let name = match value.name {
      v if v.is_empty() => {
        return Err(tonic::Status::invalid_argument(
          "CreateVolumeRequest.name is empty",
        ))
      }
      v => v,
    };

    let capacity_range = capacity_range(value.capacity_range)?;
    let volume_capabilities = volume_capabilities(
      "CreateVolumeRequest.volume_capabilities",
      value.volume_capabilities,
    )?;

    let volume_content_source = match value.volume_content_source {
      None => None,
      Some(v) => v.try_into()?,
    };

    Ok(CreateVolumeRequest {
      name,
      capacity_range,
      volume_capabilities,
      parameters: value.parameters,
      secrets: value.secrets.into(),
      volume_content_source,
    })
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CreateVolumeError {
  /// Indicates that a volume corresponding to the specified volume `name` already
  /// exists but is incompatible with the specified `capacity_range`,
  /// `volume_capabilities` or `parameters`.
  #[error("Volume already exists but is incompatible: {0}")]
  IncompatibleVolumeExists(String),

  /// Indicates that the specified volume source is not supported, or could not be found.
  #[error("Unsupported volume source: {0}")]
  UnsupportedVolumeSource(String),

  /// Indicates that the capacity range is not allowed by the Plugin.
  #[error("Unsupported capacity_range: {0}")]
  UnsupportedCapacityRange(String),

  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<CreateVolumeError> for tonic::Status {
  fn from(value: CreateVolumeError) -> Self {
    use tonic::{Code, Status};

    match value {
      CreateVolumeError::Other(v) => v,
      value => {
        let code = match &value {
          CreateVolumeError::IncompatibleVolumeExists(_) => Code::AlreadyExists,
          CreateVolumeError::UnsupportedVolumeSource(_) => Code::InvalidArgument,
          CreateVolumeError::UnsupportedCapacityRange(_) => Code::OutOfRange,
          CreateVolumeError::Other(_) => Code::Unknown,
        };

        Status::new(code, value.to_string())
      }
    }
  }
}
