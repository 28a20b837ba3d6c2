use super::Topology;
use crate::proto;
use std::{convert::TryFrom, num::NonZeroU64};
use thiserror::Error;

#[derive(Debug)]
pub struct NodeGetInfoResponse {
  /// The identifier of the node as understood by the SP. This field SHALL
  /// be used by the CO in subsequent calls to refer to this node.
  node_id: String,

  /// Maximum number of volumes that controller can publish to the node.
  /// Unset means the CO decides.
  max_volumes_per_node: Option<NonZeroU64>,

  /// Specifies where (regions, zones, racks, etc.) the node is
  /// accessible from.
  accessible_topology: Option<Topology>,
}

impl NodeGetInfoResponse {
  pub fn new(node_id: impl Into<String>) -> Self {
    NodeGetInfoResponse {
      node_id: node_id.into(),
      max_volumes_per_node: None,
      accessible_topology: None,
    }
  }

  pub fn with_max_volumes_per_node(mut self, max_volumes_per_node: u64) -> Self {
    self.max_volumes_per_node = NonZeroU64::new(max_volumes_per_node);
    self
  }

  pub fn with_accessible_topology(mut self, accessible_topology: Topology) -> Self {
    self.accessible_topology = Some(accessible_topology);
    self
  }

  #[inline]
  pub fn node_id(&self) -> &str {
    &self.node_id
  }
}

impl TryFrom<NodeGetInfoResponse> for proto::NodeGetInfoResponse {
  type Error = tonic::Status;

  fn try_from(value: NodeGetInfoResponse) -> Result<Self, Self::Error> {
    if value.node_id.is_empty() {
      return Err(tonic::Status::internal("NodeGetInfoResponse.node_id is empty"));
    }

    let max_volumes_per_node = match value.max_volumes_per_node {
      None => 0,
      Some(v) => i64::try_from(v.get()).map_err(|_| {
        tonic::Status::out_of_range("NodeGetInfoResponse.max_volumes_per_node overflows int64")
      })?,
    };

    Ok(proto::NodeGetInfoResponse {
      node_id: value.node_id,
      max_volumes_per_node,
      accessible_topology: value
        .accessible_topology
        .map(|segments| proto::Topology { segments }),
    })
  }
}

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum NodeGetInfoError {
  #[error(transparent)]
  #[doc(hidden)]
  Other(#[from] tonic::Status),
}

impl From<NodeGetInfoError> for tonic::Status {
  fn from(value: NodeGetInfoError) -> Self {
    match value {
      NodeGetInfoError::Other(v) => v,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn node_id_only() {
    let response = proto::NodeGetInfoResponse::try_from(NodeGetInfoResponse::new("node-1")).unwrap();
    assert_eq!(response.node_id, "node-1");
    assert_eq!(response.max_volumes_per_node, 0);
    assert!(response.accessible_topology.is_none());
  }

  #[test]
  fn empty_node_id_is_internal() {
    let err = proto::NodeGetInfoResponse::try_from(NodeGetInfoResponse::new("")).unwrap_err();
    assert_eq!(err.code(), tonic::Code::Internal);
  }
}
