use crate::{
  config::DriverOptions,
  context::Context,
  error::Error,
  locks::KeyedLockRegistry,
  metadata::MetadataStore,
  mounts::MountOrchestrator,
  rc::{RemoteControl, Transport},
  volumes::{Created, VolumeOrchestrator},
};
use async_trait::async_trait;
use csi_mount_utils::Mounter;
use csi_proto::{
  controller::{
    self, ControllerCapabilities, ControllerExpandVolumeError, ControllerExpandVolumeRequest,
    ControllerExpandVolumeResponse, CreateVolumeError, CreateVolumeRequest, DeleteVolumeError,
    DeleteVolumeRequest, ValidateVolumeCapabilitiesError, ValidateVolumeCapabilitiesRequest,
    ValidateVolumeCapabilitiesResponse,
  },
  node::{
    NodeCapabilities, NodeExpandVolumeError, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
    NodeGetInfoError, NodeGetInfoResponse, NodeGetVolumeStatsError, NodeGetVolumeStatsRequest,
    NodeGetVolumeStatsResponse, NodePublishVolumeError, NodePublishVolumeRequest,
    NodeUnpublishVolumeError, NodeUnpublishVolumeRequest,
  },
  volume::{CapacityRange, VolumeCapability, VolumeCondition, VolumeUsage},
  ControllerService, IdentityService, NodeService, VolumeExpansionSupport,
};
use std::{io, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BLOCK_UNSUPPORTED: &str = "block access is not supported";

/// The rclone CSI driver: identity, controller and node services over one
/// remote.
pub struct RcloneDriver<T: Transport, M: Mounter> {
  name: String,
  version: String,
  node_id: String,
  volumes: VolumeOrchestrator<T>,
  mounts: MountOrchestrator<T, M>,
  root: Context,
  rc_timeout: Option<Duration>,
}

impl<T: Transport, M: Mounter> RcloneDriver<T, M> {
  /// Build a driver from validated options. Every request context is a
  /// child of `shutdown`, so cancelling it interrupts all calls in flight.
  pub fn new(
    options: &DriverOptions,
    transport: T,
    mounter: M,
    shutdown: CancellationToken,
  ) -> crate::error::Result<Self> {
    let defaults = options
      .mount_options()
      .map_err(|e| Error::internal("encoding mount options", e))?;

    let rc = Arc::new(RemoteControl::new(transport));
    let locks = KeyedLockRegistry::new();
    let store = MetadataStore::new(rc.clone(), options.remote.clone(), options.work_dir());

    Ok(RcloneDriver {
      name: options.driver_name.clone(),
      version: env!("CARGO_PKG_VERSION").to_owned(),
      node_id: options.node_id.clone(),
      volumes: VolumeOrchestrator::new(store, locks.clone()),
      mounts: MountOrchestrator::new(rc, mounter, locks, options.remote.clone(), defaults),
      root: Context::new(shutdown),
      rc_timeout: options.rc_timeout,
    })
  }

  fn context(&self) -> Context {
    let ctx = self.root.child();
    match self.rc_timeout {
      Some(timeout) => ctx.with_timeout(timeout),
      None => ctx,
    }
  }
}

fn has_block(capabilities: &[VolumeCapability]) -> bool {
  capabilities.iter().any(VolumeCapability::is_block)
}

fn requested_bytes(range: CapacityRange) -> u64 {
  range
    .required_bytes()
    .or_else(|| range.limit_bytes())
    .unwrap_or(0)
}

impl<T: Transport, M: Mounter> IdentityService for RcloneDriver<T, M> {
  #[inline]
  fn name(&self) -> &str {
    &self.name
  }

  #[inline]
  fn version(&self) -> &str {
    &self.version
  }

  #[inline]
  fn volume_expansion_support(&self) -> VolumeExpansionSupport {
    VolumeExpansionSupport::Online
  }
}

#[async_trait]
impl<T: Transport, M: Mounter> ControllerService for RcloneDriver<T, M> {
  fn capabilities(&self) -> ControllerCapabilities {
    ControllerCapabilities::CREATE_DELETE_VOLUME | ControllerCapabilities::EXPAND_VOLUME
  }

  async fn create_volume(
    &self,
    request: CreateVolumeRequest,
  ) -> Result<controller::Volume, CreateVolumeError> {
    if has_block(request.volume_capabilities()) {
      return Err(tonic::Status::invalid_argument(BLOCK_UNSUPPORTED).into());
    }

    if let Some(source) = request.volume_content_source() {
      return Err(CreateVolumeError::UnsupportedVolumeSource(format!(
        "{:?}",
        source
      )));
    }

    let capacity = request
      .capacity_range()
      .and_then(|range| range.required_bytes())
      .unwrap_or(0);

    let created = self
      .volumes
      .create(&self.context(), request.name(), capacity)
      .await
      .map_err(|e| match e {
        e if e.is_conflict() => CreateVolumeError::IncompatibleVolumeExists(e.to_string()),
        e => CreateVolumeError::Other(e.into()),
      })?;

    // The provisioner sizes new claims itself; only existing volumes report
    // what was stored.
    let capacity = match &created {
      Created::New(_) => 0,
      Created::Existing(volume) => volume.capacity(),
    };

    Ok(
      controller::Volume::new(created.volume().id())
        .with_capacity_bytes(capacity)
        .with_volume_context(request.parameters().clone()),
    )
  }

  async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<(), DeleteVolumeError> {
    self
      .volumes
      .delete(&self.context(), request.volume_id())
      .await
      .map_err(|e| DeleteVolumeError::Other(e.into()))
  }

  async fn validate_volume_capabilities(
    &self,
    request: ValidateVolumeCapabilitiesRequest,
  ) -> Result<ValidateVolumeCapabilitiesResponse, ValidateVolumeCapabilitiesError> {
    let exists = self
      .volumes
      .exists(&self.context(), request.volume_id())
      .await
      .map_err(|e| ValidateVolumeCapabilitiesError::Other(e.into()))?;

    if !exists {
      return Err(ValidateVolumeCapabilitiesError::VolumeNotFound(
        request.volume_id().to_owned(),
      ));
    }

    if has_block(request.volume_capabilities()) {
      return Ok(ValidateVolumeCapabilitiesResponse::Message(
        BLOCK_UNSUPPORTED.to_owned(),
      ));
    }

    Ok(ValidateVolumeCapabilitiesResponse::Confirmed(
      controller::Confirmed::new(request.volume_capabilities().to_vec())
        .with_volume_context(request.volume_context().clone())
        .with_parameters(request.parameters().clone()),
    ))
  }

  async fn controller_expand_volume(
    &self,
    request: ControllerExpandVolumeRequest,
  ) -> Result<ControllerExpandVolumeResponse, ControllerExpandVolumeError> {
    let capacity = self
      .volumes
      .expand(
        &self.context(),
        request.volume_id(),
        requested_bytes(request.capacity_range()),
      )
      .await
      .map_err(|e| match e {
        Error::NotFound(_) => ControllerExpandVolumeError::VolumeNotFound(e.to_string()),
        e => ControllerExpandVolumeError::Other(e.into()),
      })?;

    Ok(ControllerExpandVolumeResponse::new(capacity, false))
  }
}

#[async_trait]
impl<T: Transport, M: Mounter> NodeService for RcloneDriver<T, M> {
  fn capabilities(&self) -> NodeCapabilities {
    NodeCapabilities::GET_VOLUME_STATS | NodeCapabilities::EXPAND_VOLUME
  }

  async fn node_publish_volume(
    &self,
    request: NodePublishVolumeRequest,
  ) -> Result<(), NodePublishVolumeError> {
    if request.volume_capability().is_block() {
      return Err(NodePublishVolumeError::ExceedsCapabilities(
        BLOCK_UNSUPPORTED.to_owned(),
      ));
    }

    self
      .mounts
      .publish(
        &self.context(),
        request.volume_id(),
        request.target_path(),
        request.volume_context(),
      )
      .await
      .map_err(|e| match e {
        Error::OperationInProgress(_) => NodePublishVolumeError::OperationPending(e.to_string()),
        e => NodePublishVolumeError::Other(e.into()),
      })
  }

  async fn node_unpublish_volume(
    &self,
    request: NodeUnpublishVolumeRequest,
  ) -> Result<(), NodeUnpublishVolumeError> {
    self
      .mounts
      .unpublish(&self.context(), request.volume_id(), request.target_path())
      .await
      .map_err(|e| match e {
        Error::OperationInProgress(_) => NodeUnpublishVolumeError::OperationPending(e.to_string()),
        e => NodeUnpublishVolumeError::Other(e.into()),
      })
  }

  async fn node_get_volume_stats(
    &self,
    request: NodeGetVolumeStatsRequest,
  ) -> Result<NodeGetVolumeStatsResponse, NodeGetVolumeStatsError> {
    let path = request.volume_path();
    let metadata = match tokio::fs::metadata(path).await {
      Ok(metadata) => metadata,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(NodeGetVolumeStatsError::VolumeNotFound(format!(
          "{} does not exist",
          path.display()
        )))
      }
      Err(e) => return Err(NodeGetVolumeStatsError::Other(Error::from(e).into())),
    };

    debug!(path = %path.display(), used = metadata.len(), "Volume stats");
    Ok(
      NodeGetVolumeStatsResponse::new(vec![VolumeUsage::bytes(metadata.len())])
        .with_volume_condition(VolumeCondition::healthy("healthy")),
    )
  }

  async fn node_expand_volume(
    &self,
    request: NodeExpandVolumeRequest,
  ) -> Result<NodeExpandVolumeResponse, NodeExpandVolumeError> {
    let capacity = self
      .volumes
      .expand(
        &self.context(),
        request.volume_id(),
        requested_bytes(request.capacity_range()),
      )
      .await
      .map_err(|e| match e {
        Error::NotFound(_) => NodeExpandVolumeError::VolumeNotFound(e.to_string()),
        e => NodeExpandVolumeError::Other(e.into()),
      })?;

    Ok(NodeExpandVolumeResponse::new(capacity))
  }

  async fn node_get_info(&self) -> Result<NodeGetInfoResponse, NodeGetInfoError> {
    Ok(NodeGetInfoResponse::new(self.node_id.clone()))
  }
}
