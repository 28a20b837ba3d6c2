use std::{
  collections::HashMap,
  convert::{TryFrom, TryInto},
  fmt,
  num::NonZeroU64,
};

use crate::proto;

pub type Topology = HashMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeContentSource {
  Snapshot(String),
  Volume(String),
}

impl TryFrom<proto::VolumeContentSource> for Option<VolumeContentSource> {
  type Error = tonic::Status;

  fn try_from(value: proto::VolumeContentSource) -> Result<Self, Self::Error> {
    #[inline]
    fn fail_if_empty(v: String, error: &'static str) -> Result<String, tonic::Status> {
      if v.is_empty() {
        Err(tonic::Status::invalid_argument(error))
      } else {
        Ok(v)
      }
    }

    Ok(match value.r#type {
      None => None,
      Some(proto::volume_content_source::Type::Volume(v)) => Some(VolumeContentSource::Volume(
        fail_if_empty(v.volume_id, "VolumeContentSource volume_id cannot be empty")?,
      )),
      Some(proto::volume_content_source::Type::Snapshot(v)) => {
        Some(VolumeContentSource::Snapshot(fail_if_empty(
          v.snapshot_id,
          "VolumeContentSource snapshot_id cannot be empty",
        )?))
      }
    })
  }
}

/// A provisioned volume, as reported back to the CO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
  capacity_bytes: Option<NonZeroU64>,
  volume_id: String,
  volume_context: HashMap<String, String>,
}

impl Volume {
  pub fn new(volume_id: impl Into<String>) -> Self {
    Volume {
      capacity_bytes: None,
      volume_id: volume_id.into(),
      volume_context: HashMap::new(),
    }
  }

  /// Set the reported capacity. Zero means "unknown", and lets the CO fall
  /// back to the size it requested.
  pub fn with_capacity_bytes(mut self, capacity_bytes: u64) -> Self {
    self.capacity_bytes = NonZeroU64::new(capacity_bytes);
    self
  }

  pub fn with_volume_context(mut self, volume_context: HashMap<String, String>) -> Self {
    self.volume_context = volume_context;
    self
  }

  #[inline]
  pub fn volume_id(&self) -> &str {
    &self.volume_id
  }

  #[inline]
  pub fn capacity_bytes(&self) -> u64 {
    self.capacity_bytes.map(NonZeroU64::get).unwrap_or(0)
  }

  /// Opaque attributes passed back by the CO on every later call that
  /// references this volume.
  #[inline]
  pub fn volume_context(&self) -> &HashMap<String, String> {
    &self.volume_context
  }
}

impl TryFrom<Volume> for proto::Volume {
  type Error = tonic::Status;

  fn try_from(value: Volume) -> Result<Self, Self::Error> {
    let capacity_bytes = match value.capacity_bytes {
      None => 0,
      Some(v) => i64::try_from(v.get())
        .map_err(|_| tonic::Status::out_of_range("Volume.capacity_bytes overflows int64"))?,
    };

    Ok(proto::Volume {
      capacity_bytes,
      volume_id: value.volume_id,
      volume_context: value.volume_context,
      content_source: None,
      accessible_topology: Vec::new(),
    })
  }
}

impl TryFrom<Volume> for proto::CreateVolumeResponse {
  type Error = tonic::Status;

  fn try_from(value: Volume) -> Result<Self, Self::Error> {
    let volume = Some(value.try_into()?);

    Ok(proto::CreateVolumeResponse { volume })
  }
}

#[derive(Debug, Clone)]
pub struct VolumeCapability {
  access_mode: AccessMode,
  access_type: AccessType,
}

impl VolumeCapability {
  #[inline]
  pub fn access_mode(&self) -> AccessMode {
    self.access_mode
  }

  #[inline]
  pub fn access_type(&self) -> &AccessType {
    &self.access_type
  }

  /// Whether the CO asks for a raw block device rather than a filesystem.
  #[inline]
  pub fn is_block(&self) -> bool {
    matches!(self.access_type, AccessType::Block)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AccessMode {
  Unknown,
  /// Can only be published once as read/write on a single node, at
  /// any given time.
  SingleNodeWriter,
  /// Can only be published once as readonly on a single node, at
  /// any given time.
  SingleNodeReaderOnly,
  /// Can be published as readonly at multiple nodes simultaneously.
  MultiNodeReaderOnly,
  /// Can be published at multiple nodes simultaneously. Only one of
  /// the node can be used as read/write. The rest will be readonly.
  MultiNodeSingleWriter,
  /// Can be published as read/write at multiple nodes
  /// simultaneously.
  MultiNodeMultiWriter,
}

impl From<proto::volume_capability::AccessMode> for AccessMode {
  fn from(value: proto::volume_capability::AccessMode) -> Self {
    use proto::volume_capability::access_mode::Mode;

    match Mode::from_i32(value.mode) {
      Some(Mode::SingleNodeWriter) => AccessMode::SingleNodeWriter,
      Some(Mode::SingleNodeReaderOnly) => AccessMode::SingleNodeReaderOnly,
      Some(Mode::MultiNodeReaderOnly) => AccessMode::MultiNodeReaderOnly,
      Some(Mode::MultiNodeSingleWriter) => AccessMode::MultiNodeSingleWriter,
      Some(Mode::MultiNodeMultiWriter) => AccessMode::MultiNodeMultiWriter,
      Some(Mode::Unknown) | None => AccessMode::Unknown,
    }
  }
}

impl From<AccessMode> for proto::volume_capability::AccessMode {
  fn from(value: AccessMode) -> Self {
    use proto::volume_capability::access_mode::Mode;

    let mode = match value {
      AccessMode::Unknown => Mode::Unknown,
      AccessMode::SingleNodeWriter => Mode::SingleNodeWriter,
      AccessMode::SingleNodeReaderOnly => Mode::SingleNodeReaderOnly,
      AccessMode::MultiNodeReaderOnly => Mode::MultiNodeReaderOnly,
      AccessMode::MultiNodeSingleWriter => Mode::MultiNodeSingleWriter,
      AccessMode::MultiNodeMultiWriter => Mode::MultiNodeMultiWriter,
    };

    proto::volume_capability::AccessMode { mode: mode as i32 }
  }
}

#[derive(Debug, Clone)]
pub enum AccessType {
  /// Indicate that the volume will be accessed via the block device API.
  Block,

  /// Indicate that the volume will be accessed via the filesystem API.
  Mount(MountVolume),
}

impl From<proto::volume_capability::AccessType> for AccessType {
  fn from(value: proto::volume_capability::AccessType) -> Self {
    match value {
      proto::volume_capability::AccessType::Block(_) => AccessType::Block,
      proto::volume_capability::AccessType::Mount(v) => AccessType::Mount(v.into()),
    }
  }
}

impl From<AccessType> for proto::volume_capability::AccessType {
  fn from(value: AccessType) -> Self {
    match value {
      AccessType::Block => {
        proto::volume_capability::AccessType::Block(proto::volume_capability::BlockVolume {})
      }
      AccessType::Mount(v) => proto::volume_capability::AccessType::Mount(v.into()),
    }
  }
}

#[derive(Clone)]
pub struct MountVolume {
  fs_type: Option<String>,
  mount_flags: Vec<String>,
}

impl MountVolume {
  /// The filesystem type.
  #[inline]
  pub fn fs_type(&self) -> Option<&str> {
    self.fs_type.as_deref()
  }

  /// The mount options that can be used for the volume. This field is
  /// OPTIONAL. `mount_flags` MAY contain sensitive information.
  /// Therefore, the CO and the Plugin MUST NOT leak this information
  /// to untrusted entities.
  pub fn mount_flags(&self) -> impl Iterator<Item = &str> + ExactSizeIterator {
    self.mount_flags.iter().map(|v| &**v)
  }
}

impl From<proto::volume_capability::MountVolume> for MountVolume {
  fn from(value: proto::volume_capability::MountVolume) -> Self {
    let fs_type = match value.fs_type {
      v if v.is_empty() => None,
      v => Some(v),
    };

    MountVolume {
      fs_type,
      mount_flags: value.mount_flags,
    }
  }
}

impl From<MountVolume> for proto::volume_capability::MountVolume {
  fn from(value: MountVolume) -> Self {
    proto::volume_capability::MountVolume {
      fs_type: value.fs_type.unwrap_or_default(),
      mount_flags: value.mount_flags,
    }
  }
}

impl fmt::Debug for MountVolume {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MountVolume")
      .field("fs_type", &self.fs_type)
      .field(
        "mount_flags",
        &format!("REDACTED ({} items)", self.mount_flags.len()),
      )
      .finish()
  }
}

impl TryFrom<proto::VolumeCapability> for VolumeCapability {
  type Error = tonic::Status;

  fn try_from(value: proto::VolumeCapability) -> Result<Self, Self::Error> {
    let access_mode = value
      .access_mode
      .ok_or_else(|| tonic::Status::invalid_argument("Missing access_mode for VolumeCapability"))?
      .into();

    let access_type = value
      .access_type
      .ok_or_else(|| tonic::Status::invalid_argument("Missing access_type for VolumeCapability"))?
      .into();

    Ok(VolumeCapability {
      access_mode,
      access_type,
    })
  }
}

impl From<VolumeCapability> for proto::VolumeCapability {
  fn from(value: VolumeCapability) -> Self {
    proto::VolumeCapability {
      access_mode: Some(value.access_mode.into()),
      access_type: Some(value.access_type.into()),
    }
  }
}

pub(crate) fn volume_capabilities(
  field: &'static str,
  values: Vec<proto::VolumeCapability>,
) -> Result<Vec<VolumeCapability>, tonic::Status> {
  if values.is_empty() {
    return Err(tonic::Status::invalid_argument(format!(
      "{} is empty",
      field
    )));
  }

  values.into_iter().map(TryInto::try_into).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeCondition {
  /// Normal volumes are available for use and operating optimally.
  /// An abnormal volume does not meet these criteria.
  abnormal: bool,
  /// The message describing the condition of the volume.
  message: String,
}

impl VolumeCondition {
  pub fn healthy(message: impl Into<String>) -> Self {
    VolumeCondition {
      abnormal: false,
      message: message.into(),
    }
  }

  pub fn abnormal(message: impl Into<String>) -> Self {
    VolumeCondition {
      abnormal: true,
      message: message.into(),
    }
  }

  #[inline]
  pub fn is_abnormal(&self) -> bool {
    self.abnormal
  }

  #[inline]
  pub fn message(&self) -> &str {
    &self.message
  }
}

impl From<VolumeCondition> for proto::VolumeCondition {
  fn from(value: VolumeCondition) -> Self {
    proto::VolumeCondition {
      abnormal: value.abnormal,
      message: value.message,
    }
  }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeUsageUnit {
  Bytes,
  Inodes,
}

impl From<VolumeUsageUnit> for proto::volume_usage::Unit {
  fn from(value: VolumeUsageUnit) -> Self {
    match value {
      VolumeUsageUnit::Bytes => proto::volume_usage::Unit::Bytes,
      VolumeUsageUnit::Inodes => proto::volume_usage::Unit::Inodes,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeUsage {
  /// The available capacity in specified Unit.
  available: Option<u64>,

  /// The total capacity in specified Unit.
  total: Option<u64>,

  /// The used capacity in specified Unit.
  used: Option<u64>,

  unit: VolumeUsageUnit,
}

impl VolumeUsage {
  /// Usage measured in bytes, with only the used amount known.
  pub fn bytes(used: u64) -> Self {
    VolumeUsage {
      available: None,
      total: None,
      used: Some(used),
      unit: VolumeUsageUnit::Bytes,
    }
  }

  pub fn with_total(mut self, total: u64) -> Self {
    self.total = Some(total);
    self
  }

  pub fn with_available(mut self, available: u64) -> Self {
    self.available = Some(available);
    self
  }

  #[inline]
  pub fn used(&self) -> Option<u64> {
    self.used
  }

  #[inline]
  pub fn unit(&self) -> VolumeUsageUnit {
    self.unit
  }
}

impl TryFrom<VolumeUsage> for proto::VolumeUsage {
  type Error = tonic::Status;

  fn try_from(value: VolumeUsage) -> Result<Self, Self::Error> {
    fn to_i64(v: Option<u64>, field: &'static str) -> Result<i64, tonic::Status> {
      v.map(i64::try_from)
        .transpose()
        .map(Option::unwrap_or_default)
        .map_err(|_| tonic::Status::out_of_range(format!("VolumeUsage.{} overflows int64", field)))
    }

    Ok(proto::VolumeUsage {
      available: to_i64(value.available, "available")?,
      total: to_i64(value.total, "total")?,
      used: to_i64(value.used, "used")?,
      unit: proto::volume_usage::Unit::from(value.unit) as i32,
    })
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityRange {
  AtLeast(NonZeroU64),
  AtMost(NonZeroU64),
  /// Effectively AtLeast(.0) & AtMost(.1)
  Between(NonZeroU64, NonZeroU64),
}

impl CapacityRange {
  /// Volume MUST be at least this big.
  #[inline]
  pub fn required_bytes(&self) -> Option<u64> {
    match self {
      CapacityRange::AtLeast(r) | CapacityRange::Between(r, _) => Some(r.get()),
      CapacityRange::AtMost(_) => None,
    }
  }

  /// Volume MUST not be bigger than this.
  #[inline]
  pub fn limit_bytes(&self) -> Option<u64> {
    match self {
      CapacityRange::AtMost(l) | CapacityRange::Between(_, l) => Some(l.get()),
      CapacityRange::AtLeast(_) => None,
    }
  }
}

/// A range with both bounds left at zero is "unspecified" and converts to `None`.
impl TryFrom<proto::CapacityRange> for Option<CapacityRange> {
  type Error = tonic::Status;

  fn try_from(value: proto::CapacityRange) -> Result<Self, Self::Error> {
    let (required, limit) = match (value.required_bytes, value.limit_bytes) {
      (r, _) if r < 0 => {
        return Err(tonic::Status::invalid_argument(
          "CapacityRange.required_bytes cannot be negative",
        ))
      }
      (_, l) if l < 0 => {
        return Err(tonic::Status::invalid_argument(
          "CapacityRange.limit_bytes cannot be negative",
        ))
      }
      (r, l) => (NonZeroU64::new(r as u64), NonZeroU64::new(l as u64)),
    };

    Ok(match (required, limit) {
      (None, None) => None,
      (Some(r), None) => Some(CapacityRange::AtLeast(r)),
      (None, Some(l)) => Some(CapacityRange::AtMost(l)),
      (Some(r), Some(l)) if l < r => {
        return Err(tonic::Status::invalid_argument(
          "CapacityRange.limit_bytes is smaller than required_bytes",
        ))
      }
      (Some(r), Some(l)) => Some(CapacityRange::Between(r, l)),
    })
  }
}

pub(crate) fn capacity_range(
  value: Option<proto::CapacityRange>,
) -> Result<Option<CapacityRange>, tonic::Status> {
  match value {
    None => Ok(None),
    Some(v) => v.try_into(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  fn range(required_bytes: i64, limit_bytes: i64) -> proto::CapacityRange {
    proto::CapacityRange {
      required_bytes,
      limit_bytes,
    }
  }

  #[test_case(0, 0, None, None ; "unspecified")]
  #[test_case(10, 0, Some(10), None ; "at least")]
  #[test_case(0, 20, None, Some(20) ; "at most")]
  #[test_case(10, 20, Some(10), Some(20) ; "between")]
  #[test_case(10, 10, Some(10), Some(10) ; "exact")]
  fn capacity_range_bounds(
    required: i64,
    limit: i64,
    expected_required: Option<u64>,
    expected_limit: Option<u64>,
  ) {
    let parsed: Option<CapacityRange> = range(required, limit).try_into().unwrap();
    assert_eq!(parsed.and_then(|r| r.required_bytes()), expected_required);
    assert_eq!(parsed.and_then(|r| r.limit_bytes()), expected_limit);
    assert_eq!(parsed.is_none(), expected_required.is_none() && expected_limit.is_none());
  }

  #[test_case(-1, 0 ; "negative required")]
  #[test_case(0, -1 ; "negative limit")]
  #[test_case(20, 10 ; "inverted")]
  fn capacity_range_invalid(required: i64, limit: i64) {
    let err = Option::<CapacityRange>::try_from(range(required, limit)).unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
  }

  fn mount_capability() -> proto::VolumeCapability {
    proto::VolumeCapability {
      access_type: Some(proto::volume_capability::AccessType::Mount(
        proto::volume_capability::MountVolume {
          fs_type: String::new(),
          mount_flags: vec!["secret=1".into()],
        },
      )),
      access_mode: Some(proto::volume_capability::AccessMode {
        mode: proto::volume_capability::access_mode::Mode::MultiNodeMultiWriter as i32,
      }),
    }
  }

  #[test]
  fn capability_requires_access_mode() {
    let mut capability = mount_capability();
    capability.access_mode = None;

    let err = VolumeCapability::try_from(capability).unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
  }

  #[test]
  fn capability_accessors() {
    let capability = VolumeCapability::try_from(mount_capability()).unwrap();
    assert!(!capability.is_block());
    assert_eq!(capability.access_mode(), AccessMode::MultiNodeMultiWriter);
    match capability.access_type() {
      AccessType::Mount(m) => {
        assert_eq!(m.fs_type(), None);
        assert_eq!(m.mount_flags().len(), 1);
      }
      AccessType::Block => panic!("expected mount access type"),
    }

    let printed = format!("{:?}", capability);
    assert!(!printed.contains("secret=1"));
  }

  #[test]
  fn volume_capacity_zero_is_unknown() {
    let volume: proto::Volume = Volume::new("vol").with_capacity_bytes(0).try_into().unwrap();
    assert_eq!(volume.capacity_bytes, 0);
    assert_eq!(volume.volume_id, "vol");

    let volume: proto::Volume = Volume::new("vol").with_capacity_bytes(42).try_into().unwrap();
    assert_eq!(volume.capacity_bytes, 42);
  }
}
