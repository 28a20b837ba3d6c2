mod capabilities;
mod create_volume;
mod delete_volume;
mod expand_volume;
mod validate_volume_capabilities;

use crate::{
  proto,
  utils::{record_request, request_timeout, with_timeout, Record},
  IdentityService,
};
use async_trait::async_trait;
use std::{convert::TryInto, sync::Arc};
use tracing::instrument;

pub use crate::volume::*;
pub use capabilities::*;
pub use create_volume::*;
pub use delete_volume::*;
pub use expand_volume::*;
pub use validate_volume_capabilities::*;

#[async_trait]
pub trait ControllerService: IdentityService {
  /// Get the set of services provided by this controller.
  #[inline]
  fn capabilities(&self) -> ControllerCapabilities {
    ControllerCapabilities::empty()
  }

  /// A Controller Plugin MUST implement this RPC call if it has `CREATE_DELETE_VOLUME`
  /// controller capability.
  ///
  /// This RPC will be called by the CO to provision a new volume on behalf of a user
  /// (to be consumed as either a block device or a mounted filesystem).
  ///
  /// This operation MUST be idempotent.
  ///
  /// If a volume corresponding to the specified volume `name` already exists, is
  /// accessible from `accessibility_requirements`, and is compatible with the specified
  /// `capacity_range`, `volume_capabilities` and `parameters` in the `CreateVolumeRequest`,
  /// the Plugin MUST reply `0 OK` with the corresponding `CreateVolumeResponse`.
  #[allow(unused_variables)]
  async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume, CreateVolumeError> {
    unsupported!("CreateVolume")
  }

  /// A Controller Plugin MUST implement this RPC call if it has CREATE_DELETE_VOLUME capability.
  /// This RPC will be called by the CO to deprovision a volume.
  ///
  /// This operation MUST be idempotent. If a volume corresponding to the specified volume_id
  /// does not exist or the artifacts associated with the volume do not exist anymore, the
  /// Plugin MUST reply 0 OK.
  #[allow(unused_variables)]
  async fn delete_volume(&self, request: DeleteVolumeRequest) -> Result<(), DeleteVolumeError> {
    unsupported!("DeleteVolume")
  }

  /// A Controller Plugin MUST implement this RPC call. This RPC will be called by the
  /// CO to check if a pre-provisioned volume has all the capabilities that the CO wants.
  /// This RPC call SHALL return confirmed only if all the volume capabilities specified
  /// in the request are supported. This operation MUST be idempotent.
  async fn validate_volume_capabilities(
    &self,
    request: ValidateVolumeCapabilitiesRequest,
  ) -> Result<ValidateVolumeCapabilitiesResponse, ValidateVolumeCapabilitiesError>;

  /// A Controller plugin MUST implement this RPC call if plugin has `EXPAND_VOLUME`
  /// controller capability. This RPC allows the CO to expand the size of a volume.
  ///
  /// This operation MUST be idempotent. If a volume corresponding to the specified
  /// volume ID is already larger than or equal to the target capacity of the expansion
  /// request, the plugin SHOULD reply 0 OK.
  ///
  /// If plugin has `EXPAND_VOLUME` node capability, then `NodeExpandVolume` MUST be called
  /// after successful `ControllerExpandVolume` and `node_expansion_required` in
  /// `ControllerExpandVolumeResponse` is `true`.
  #[allow(unused_variables)]
  async fn controller_expand_volume(
    &self,
    request: ControllerExpandVolumeRequest,
  ) -> Result<ControllerExpandVolumeResponse, ControllerExpandVolumeError> {
    unsupported!("ControllerExpandVolume")
  }
}

/// Serves the CSI Controller service on behalf of a [ControllerService].
///
/// Optional RPCs are only dispatched when the matching bit is present in
/// [ControllerService::capabilities]. Calls carrying a `grpc-timeout` are
/// abandoned with `DEADLINE_EXCEEDED` once it elapses.
pub struct Controller<T: ControllerService>(Arc<T>);

impl<T: ControllerService> Controller<T> {
  pub fn new(service: Arc<T>) -> Self {
    Controller(service)
  }

  pub fn into_server(self) -> proto::controller_server::ControllerServer<Self> {
    proto::controller_server::ControllerServer::new(self)
  }

  #[inline]
  fn supports(&self, capability: ControllerCapabilities) -> bool {
    self.0.capabilities().contains(capability)
  }
}

#[async_trait]
impl<T: ControllerService> proto::controller_server::Controller for Controller<T> {
  #[instrument(
    name = "controller.create_volume",
    skip(self, request),
    fields(request, response)
  )]
  async fn create_volume(
    &self,
    request: tonic::Request<proto::CreateVolumeRequest>,
  ) -> Result<tonic::Response<proto::CreateVolumeResponse>, tonic::Status> {
    if !self.supports(ControllerCapabilities::CREATE_DELETE_VOLUME) {
      unsupported!("CreateVolume")
    }

    let timeout = request_timeout(&request);
    let request: CreateVolumeRequest = record_request(request.into_inner().try_into()?);
    let response = with_timeout(timeout, self.0.create_volume(request))
      .await?
      .record_response()
      .try_into()?;
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "controller.delete_volume",
    skip(self, request),
    fields(request)
  )]
  async fn delete_volume(
    &self,
    request: tonic::Request<proto::DeleteVolumeRequest>,
  ) -> Result<tonic::Response<proto::DeleteVolumeResponse>, tonic::Status> {
    if !self.supports(ControllerCapabilities::CREATE_DELETE_VOLUME) {
      unsupported!("DeleteVolume")
    }

    let timeout = request_timeout(&request);
    let request: DeleteVolumeRequest = record_request(request.into_inner().try_into()?);
    with_timeout(timeout, self.0.delete_volume(request)).await?;
    let response = proto::DeleteVolumeResponse {};
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "controller.validate_volume_capabilities",
    skip(self, request),
    fields(request, response)
  )]
  async fn validate_volume_capabilities(
    &self,
    request: tonic::Request<proto::ValidateVolumeCapabilitiesRequest>,
  ) -> Result<tonic::Response<proto::ValidateVolumeCapabilitiesResponse>, tonic::Status> {
    let timeout = request_timeout(&request);
    let request: ValidateVolumeCapabilitiesRequest =
      record_request(request.into_inner().try_into()?);
    let response = with_timeout(timeout, self.0.validate_volume_capabilities(request))
      .await?
      .record_response()
      .into();
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "controller.controller_get_capabilities",
    skip(self, _request),
    fields(response)
  )]
  async fn controller_get_capabilities(
    &self,
    _request: tonic::Request<proto::ControllerGetCapabilitiesRequest>,
  ) -> Result<tonic::Response<proto::ControllerGetCapabilitiesResponse>, tonic::Status> {
    let response = self.0.capabilities().record_response().into();
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "controller.controller_expand_volume",
    skip(self, request),
    fields(request, response)
  )]
  async fn controller_expand_volume(
    &self,
    request: tonic::Request<proto::ControllerExpandVolumeRequest>,
  ) -> Result<tonic::Response<proto::ControllerExpandVolumeResponse>, tonic::Status> {
    if !self.supports(ControllerCapabilities::EXPAND_VOLUME) {
      unsupported!("ControllerExpandVolume")
    }

    let timeout = request_timeout(&request);
    let request: ControllerExpandVolumeRequest = record_request(request.into_inner().try_into()?);
    let response = with_timeout(timeout, self.0.controller_expand_volume(request))
      .await?
      .record_response()
      .try_into()?;
    Ok(tonic::Response::new(response))
  }
}
