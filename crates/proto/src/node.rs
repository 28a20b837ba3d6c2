mod capabilities;
mod expand_volume;
mod get_info;
mod get_volume_stats;
mod publish_volume;
mod unpublish_volume;

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
pub use expand_volume::*;
pub use get_info::*;
pub use get_volume_stats::*;
pub use publish_volume::*;
pub use unpublish_volume::*;

#[async_trait]
pub trait NodeService: IdentityService {
  /// Get the set of services provided by this node.
  #[inline]
  fn capabilities(&self) -> NodeCapabilities {
    NodeCapabilities::empty()
  }

  /// Make the volume available at `target_path`.
  ///
  /// This operation MUST be idempotent. If the volume corresponding to the
  /// `volume_id` has already been published at the specified `target_path`,
  /// and is compatible with the specified `volume_capability` and `readonly`
  /// flag, the Plugin MUST reply `0 OK`.
  async fn node_publish_volume(
    &self,
    request: NodePublishVolumeRequest,
  ) -> Result<(), NodePublishVolumeError>;

  /// Undo the work done by [NodeService::node_publish_volume].
  ///
  /// This operation MUST be idempotent. If this RPC failed, or the CO does not
  /// know if it failed or not, it can choose to call it again.
  async fn node_unpublish_volume(
    &self,
    request: NodeUnpublishVolumeRequest,
  ) -> Result<(), NodeUnpublishVolumeError>;

  /// A Node plugin MUST implement this RPC call if it has GET_VOLUME_STATS
  /// node capability or VOLUME_CONDITION node capability.
  #[allow(unused_variables)]
  async fn node_get_volume_stats(
    &self,
    request: NodeGetVolumeStatsRequest,
  ) -> Result<NodeGetVolumeStatsResponse, NodeGetVolumeStatsError> {
    unsupported!("NodeGetVolumeStats")
  }

  /// A Node Plugin MUST implement this RPC call if it has EXPAND_VOLUME node
  /// capability. This RPC call allows CO to expand volume on a node.
  ///
  /// This operation MUST be idempotent.
  #[allow(unused_variables)]
  async fn node_expand_volume(
    &self,
    request: NodeExpandVolumeRequest,
  ) -> Result<NodeExpandVolumeResponse, NodeExpandVolumeError> {
    unsupported!("NodeExpandVolume")
  }

  async fn node_get_info(&self) -> Result<NodeGetInfoResponse, NodeGetInfoError>;
}

/// Serves the CSI Node service on behalf of a [NodeService].
pub struct Node<T: NodeService>(Arc<T>);

impl<T: NodeService> Node<T> {
  pub fn new(service: Arc<T>) -> Self {
    Node(service)
  }

  pub fn into_server(self) -> proto::node_server::NodeServer<Self> {
    proto::node_server::NodeServer::new(self)
  }

  #[inline]
  fn supports(&self, capability: NodeCapabilities) -> bool {
    self.0.capabilities().contains(capability)
  }
}

#[async_trait]
impl<T: NodeService> proto::node_server::Node for Node<T> {
  #[instrument(
    name = "node.node_publish_volume",
    skip(self, request),
    fields(request)
  )]
  async fn node_publish_volume(
    &self,
    request: tonic::Request<proto::NodePublishVolumeRequest>,
  ) -> Result<tonic::Response<proto::NodePublishVolumeResponse>, tonic::Status> {
    let timeout = request_timeout(&request);
    let request: NodePublishVolumeRequest = record_request(request.into_inner().try_into()?);
    with_timeout(timeout, self.0.node_publish_volume(request)).await?;
    Ok(tonic::Response::new(proto::NodePublishVolumeResponse {}))
  }

  #[instrument(
    name = "node.node_unpublish_volume",
    skip(self, request),
    fields(request)
  )]
  async fn node_unpublish_volume(
    &self,
    request: tonic::Request<proto::NodeUnpublishVolumeRequest>,
  ) -> Result<tonic::Response<proto::NodeUnpublishVolumeResponse>, tonic::Status> {
    let timeout = request_timeout(&request);
    let request: NodeUnpublishVolumeRequest = record_request(request.into_inner().try_into()?);
    with_timeout(timeout, self.0.node_unpublish_volume(request)).await?;
    Ok(tonic::Response::new(proto::NodeUnpublishVolumeResponse {}))
  }

  #[instrument(
    name = "node.node_get_volume_stats",
    skip(self, request),
    fields(request, response)
  )]
  async fn node_get_volume_stats(
    &self,
    request: tonic::Request<proto::NodeGetVolumeStatsRequest>,
  ) -> Result<tonic::Response<proto::NodeGetVolumeStatsResponse>, tonic::Status> {
    if !self.supports(NodeCapabilities::GET_VOLUME_STATS) {
      unsupported!("NodeGetVolumeStats")
    }

    let timeout = request_timeout(&request);
    let request: NodeGetVolumeStatsRequest = record_request(request.into_inner().try_into()?);
    let response = with_timeout(timeout, self.0.node_get_volume_stats(request))
      .await?
      .record_response()
      .try_into()?;
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "node.node_expand_volume",
    skip(self, request),
    fields(request, response)
  )]
  async fn node_expand_volume(
    &self,
    request: tonic::Request<proto::NodeExpandVolumeRequest>,
  ) -> Result<tonic::Response<proto::NodeExpandVolumeResponse>, tonic::Status> {
    if !self.supports(NodeCapabilities::EXPAND_VOLUME) {
      unsupported!("NodeExpandVolume")
    }

    let timeout = request_timeout(&request);
    let request: NodeExpandVolumeRequest = record_request(request.into_inner().try_into()?);
    let response = with_timeout(timeout, self.0.node_expand_volume(request))
      .await?
      .record_response()
      .try_into()?;
    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "node.node_get_capabilities",
    skip(self, _request),
    fields(response)
  )]
  async fn node_get_capabilities(
    &self,
    _request: tonic::Request<proto::NodeGetCapabilitiesRequest>,
  ) -> Result<tonic::Response<proto::NodeGetCapabilitiesResponse>, tonic::Status> {
    let response = self.0.capabilities().record_response().into();
    Ok(tonic::Response::new(response))
  }

  #[instrument(name = "node.node_get_info", skip(self, _request), fields(response))]
  async fn node_get_info(
    &self,
    _request: tonic::Request<proto::NodeGetInfoRequest>,
  ) -> Result<tonic::Response<proto::NodeGetInfoResponse>, tonic::Status> {
    let response = self
      .0
      .node_get_info()
      .await?
      .record_response()
      .try_into()?;
    Ok(tonic::Response::new(response))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proto::node_server::Node as _;
  use std::time::Duration;

  /// Publishing parks forever, and nothing optional is advertised.
  struct Stuck;

  impl IdentityService for Stuck {
    fn name(&self) -> &str {
      "stuck.example.com"
    }

    fn version(&self) -> &str {
      "0.0.0"
    }
  }

  #[async_trait]
  impl NodeService for Stuck {
    async fn node_publish_volume(
      &self,
      _request: NodePublishVolumeRequest,
    ) -> Result<(), NodePublishVolumeError> {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(())
    }

    async fn node_unpublish_volume(
      &self,
      request: NodeUnpublishVolumeRequest,
    ) -> Result<(), NodeUnpublishVolumeError> {
      Err(NodeUnpublishVolumeError::OperationPending(
        request.volume_id().to_owned(),
      ))
    }

    async fn node_get_info(&self) -> Result<NodeGetInfoResponse, NodeGetInfoError> {
      Ok(NodeGetInfoResponse::new("node-1"))
    }
  }

  fn publish_request() -> proto::NodePublishVolumeRequest {
    proto::NodePublishVolumeRequest {
      volume_id: "vol".into(),
      target_path: "/mnt/target".into(),
      volume_capability: Some(proto::VolumeCapability {
        access_type: Some(proto::volume_capability::AccessType::Mount(
          Default::default(),
        )),
        access_mode: Some(Default::default()),
      }),
      ..Default::default()
    }
  }

  #[tokio::test]
  async fn deadline_is_enforced() {
    let node = Node::new(Arc::new(Stuck));
    let mut request = tonic::Request::new(publish_request());
    request
      .metadata_mut()
      .insert("grpc-timeout", "20m".parse().unwrap());

    let err = node.node_publish_volume(request).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::DeadlineExceeded);
  }

  #[tokio::test]
  async fn unadvertised_stats_are_unimplemented() {
    let node = Node::new(Arc::new(Stuck));
    let err = node
      .node_get_volume_stats(tonic::Request::new(proto::NodeGetVolumeStatsRequest {
        volume_id: "vol".into(),
        volume_path: "/mnt/target".into(),
        ..Default::default()
      }))
      .await
      .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Unimplemented);
  }

  #[tokio::test]
  async fn pending_unpublish_is_aborted() {
    let node = Node::new(Arc::new(Stuck));
    let err = node
      .node_unpublish_volume(tonic::Request::new(proto::NodeUnpublishVolumeRequest {
        volume_id: "vol".into(),
        target_path: "/mnt/target".into(),
      }))
      .await
      .unwrap_err();
    assert_eq!(err.code(), tonic::Code::Aborted);
  }

  #[tokio::test]
  async fn info_and_capabilities() {
    let node = Node::new(Arc::new(Stuck));
    let info = node
      .node_get_info(tonic::Request::new(proto::NodeGetInfoRequest {}))
      .await
      .unwrap()
      .into_inner();
    assert_eq!(info.node_id, "node-1");

    let caps = node
      .node_get_capabilities(tonic::Request::new(proto::NodeGetCapabilitiesRequest {}))
      .await
      .unwrap()
      .into_inner();
    assert!(caps.capabilities.is_empty());
  }
}
