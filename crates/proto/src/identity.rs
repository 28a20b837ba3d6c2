use crate::{proto, utils::Record};
use async_trait::async_trait;
use lazy_static::lazy_static;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, instrument};

#[derive(Eq, Clone, Copy, PartialEq, Debug, Hash)]
pub enum VolumeExpansionSupport {
  None,
  Offline,
  Online,
}

pub trait IdentityService: Send + Sync + 'static {
  /// The name MUST follow domain name notation format
  /// (<https://tools.ietf.org/html/rfc1035#section-2.3.1>). It SHOULD
  /// include the plugin's host company name and the plugin name,
  /// to minimize the possibility of collisions. It MUST be 63
  /// characters or less, beginning and ending with an alphanumeric
  /// character ([a-z0-9A-Z]) with dashes (-), dots (.), and
  /// alphanumerics between.
  fn name(&self) -> &str;

  /// Plugin version. Value of this field is opaque to the CO.
  fn version(&self) -> &str;

  /// Whether or not this plugin supports volume accessibility constraints.
  #[inline]
  fn volume_accessibility_constraints_support(&self) -> bool {
    false
  }

  /// Which kind of volume expansion this plugin supports.
  #[inline]
  fn volume_expansion_support(&self) -> VolumeExpansionSupport {
    VolumeExpansionSupport::None
  }

  #[inline]
  fn ready(&self) -> bool {
    true
  }

  #[inline]
  fn manifest(&self) -> &HashMap<String, String> {
    lazy_static! {
      static ref EMPTY_MANIFEST: HashMap<String, String> = HashMap::new();
    }

    &EMPTY_MANIFEST
  }
}

fn capabilities(s: &impl IdentityService, controller: bool) -> proto::GetPluginCapabilitiesResponse {
  use proto::plugin_capability::{service, volume_expansion, Service, Type, VolumeExpansion};

  fn service_capability(ty: service::Type) -> proto::PluginCapability {
    proto::PluginCapability {
      r#type: Some(Type::Service(Service { r#type: ty.into() })),
    }
  }

  let mut response = proto::GetPluginCapabilitiesResponse::default();
  if controller {
    response
      .capabilities
      .push(service_capability(service::Type::ControllerService));
  }

  let volume_accessibility_constraints_support = s.volume_accessibility_constraints_support();
  if volume_accessibility_constraints_support {
    response.capabilities.push(service_capability(
      service::Type::VolumeAccessibilityConstraints,
    ));
  }

  let volume_expansion_support = s.volume_expansion_support();
  let expansion = match volume_expansion_support {
    VolumeExpansionSupport::None => None,
    VolumeExpansionSupport::Offline => Some(volume_expansion::Type::Offline),
    VolumeExpansionSupport::Online => Some(volume_expansion::Type::Online),
  };

  if let Some(ty) = expansion {
    response.capabilities.push(proto::PluginCapability {
      r#type: Some(Type::VolumeExpansion(VolumeExpansion { r#type: ty.into() })),
    });
  }

  debug!(
    controller,
    ?volume_accessibility_constraints_support,
    ?volume_expansion_support
  );
  response
}

/// Serves the CSI Identity service on behalf of an [IdentityService].
pub struct Identity<T: IdentityService> {
  service: Arc<T>,
  controller: bool,
}

impl<T: IdentityService> Identity<T> {
  pub fn new(service: Arc<T>) -> Self {
    Identity {
      service,
      controller: false,
    }
  }

  /// Advertise the `CONTROLLER_SERVICE` plugin capability. Set this when the
  /// same endpoint also serves [crate::Controller].
  pub fn with_controller_service(mut self) -> Self {
    self.controller = true;
    self
  }

  pub fn into_server(self) -> proto::identity_server::IdentityServer<Self> {
    proto::identity_server::IdentityServer::new(self)
  }
}

#[async_trait]
impl<T: IdentityService> proto::identity_server::Identity for Identity<T> {
  #[instrument(
    name = "identity.get_plugin_info",
    skip(self, _request),
    fields(name, vendor_version, manifest)
  )]
  async fn get_plugin_info(
    &self,
    _request: tonic::Request<proto::GetPluginInfoRequest>,
  ) -> Result<tonic::Response<proto::GetPluginInfoResponse>, tonic::Status> {
    let response = proto::GetPluginInfoResponse {
      name: self.service.name().record_field("name").into(),
      vendor_version: self.service.version().record_field("vendor_version").into(),
      manifest: self.service.manifest().record_field("manifest").clone(),
    };

    Ok(tonic::Response::new(response))
  }

  #[instrument(
    name = "identity.get_plugin_capabilities",
    skip(self, _request),
    fields(response)
  )]
  async fn get_plugin_capabilities(
    &self,
    _request: tonic::Request<proto::GetPluginCapabilitiesRequest>,
  ) -> Result<tonic::Response<proto::GetPluginCapabilitiesResponse>, tonic::Status> {
    let response = capabilities(&*self.service, self.controller).record_response();

    Ok(tonic::Response::new(response))
  }

  #[instrument(name = "identity.probe", skip(self, _request), fields(ready))]
  async fn probe(
    &self,
    _request: tonic::Request<proto::ProbeRequest>,
  ) -> Result<tonic::Response<proto::ProbeResponse>, tonic::Status> {
    let response = proto::ProbeResponse {
      ready: Some(self.service.ready().record_field("ready")),
    };

    Ok(tonic::Response::new(response))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proto::identity_server::Identity as _;
  use proto::plugin_capability::{service, volume_expansion, Type};

  struct Plugin;

  impl IdentityService for Plugin {
    fn name(&self) -> &str {
      "plugin.example.com"
    }

    fn version(&self) -> &str {
      "1.2.3"
    }

    fn volume_expansion_support(&self) -> VolumeExpansionSupport {
      VolumeExpansionSupport::Online
    }
  }

  #[tokio::test]
  async fn plugin_info() {
    let identity = Identity::new(Arc::new(Plugin));
    let response = identity
      .get_plugin_info(tonic::Request::new(proto::GetPluginInfoRequest {}))
      .await
      .unwrap()
      .into_inner();

    assert_eq!(response.name, "plugin.example.com");
    assert_eq!(response.vendor_version, "1.2.3");
    assert!(response.manifest.is_empty());
  }

  #[tokio::test]
  async fn capabilities_without_controller() {
    let identity = Identity::new(Arc::new(Plugin));
    let response = identity
      .get_plugin_capabilities(tonic::Request::new(
        proto::GetPluginCapabilitiesRequest {},
      ))
      .await
      .unwrap()
      .into_inner();

    assert_eq!(response.capabilities.len(), 1);
    match &response.capabilities[0].r#type {
      Some(Type::VolumeExpansion(v)) => {
        assert_eq!(v.r#type, volume_expansion::Type::Online as i32)
      }
      other => panic!("unexpected capability {:?}", other),
    }
  }

  #[tokio::test]
  async fn capabilities_with_controller() {
    let identity = Identity::new(Arc::new(Plugin)).with_controller_service();
    let response = identity
      .get_plugin_capabilities(tonic::Request::new(
        proto::GetPluginCapabilitiesRequest {},
      ))
      .await
      .unwrap()
      .into_inner();

    assert!(response.capabilities.iter().any(|c| matches!(
      &c.r#type,
      Some(Type::Service(s)) if s.r#type == service::Type::ControllerService as i32
    )));
  }

  #[tokio::test]
  async fn probe_is_ready() {
    let identity = Identity::new(Arc::new(Plugin));
    let response = identity
      .probe(tonic::Request::new(proto::ProbeRequest {}))
      .await
      .unwrap()
      .into_inner();

    assert_eq!(response.ready, Some(true));
  }
}
