macro_rules! unsupported {
  ($name:expr) => {{
    ::tracing::error!("Unsupported method {} called", $name);
    return Err(
      ::tonic::Status::new(
        ::tonic::Code::Unimplemented,
        format!("Unsupported method {} called", $name),
      )
      .into(),
    );
  }};
}

pub mod controller;
pub mod identity;
pub mod node;
pub mod proto;
pub mod volume;

mod secrets;
mod utils;

pub use controller::{Controller, ControllerService};
pub use identity::{Identity, IdentityService, VolumeExpansionSupport};
pub use node::{Node, NodeService};
