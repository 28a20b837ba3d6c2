//! A CSI driver that provisions volumes as directories on an rclone remote
//! and mounts them through the rclone remote control API.

pub mod config;
pub mod error;
pub mod rc;
pub mod server;

mod context;
mod driver;
mod locks;
mod metadata;
mod mounts;
mod options;
mod volume;
mod volumes;

pub use config::{ConfigError, DriverOptions};
pub use context::{Context, Interrupted};
pub use driver::RcloneDriver;
pub use error::{Error, Result};
pub use locks::{KeyedLockRegistry, LockGuard};
pub use metadata::MetadataStore;
pub use mounts::MountOrchestrator;
pub use options::MountOptions;
pub use server::{serve, Endpoint};
pub use volume::{derive_id, Volume};
pub use volumes::{Created, VolumeOrchestrator};
