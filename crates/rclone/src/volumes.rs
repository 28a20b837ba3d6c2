use crate::{
  context::Context,
  error::{Error, Result},
  locks::{KeyedLockRegistry, LockGuard},
  metadata::MetadataStore,
  rc::Transport,
  volume::Volume,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Outcome of [VolumeOrchestrator::create].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Created {
  /// The volume was provisioned by this call.
  New(Volume),
  /// A compatible volume was already present.
  Existing(Volume),
}

impl Created {
  pub fn volume(&self) -> &Volume {
    match self {
      Created::New(v) | Created::Existing(v) => v,
    }
  }
}

/// Create, delete and expand volumes. Each runs as one critical section
/// under the volume id's lock.
pub struct VolumeOrchestrator<T: Transport> {
  store: MetadataStore<T>,
  locks: Arc<KeyedLockRegistry>,
}

impl<T: Transport> VolumeOrchestrator<T> {
  pub fn new(store: MetadataStore<T>, locks: Arc<KeyedLockRegistry>) -> Self {
    VolumeOrchestrator { store, locks }
  }

  fn lock(&self, id: &str) -> Result<LockGuard> {
    self
      .locks
      .try_acquire(id)
      .ok_or_else(|| Error::OperationInProgress(id.to_owned()))
  }

  /// Whether metadata for `id` exists.
  pub async fn exists(&self, ctx: &Context, id: &str) -> Result<bool> {
    self.store.exists(ctx, id).await
  }

  /// Provision the volume for `name`, or return the existing one when its
  /// stored metadata is compatible.
  #[instrument(skip(self, ctx))]
  pub async fn create(&self, ctx: &Context, name: &str, capacity: u64) -> Result<Created> {
    let requested = Volume::new(self.store.remote(), name, capacity);
    let _guard = self.lock(requested.id())?;

    if let Some(existing) = self.store.read(ctx, requested.id()).await? {
      if let Some(conflict) = existing.conflict_with(&requested) {
        return Err(Error::conflict(requested.id(), conflict));
      }

      debug!(id = %existing.id(), "Volume already exists");
      return Ok(Created::Existing(existing));
    }

    self.store.write(ctx, &requested).await?;
    info!(id = %requested.id(), "Volume created");
    Ok(Created::New(requested))
  }

  /// Remove the volume and all of its data. Deleting an absent volume
  /// succeeds.
  #[instrument(skip(self, ctx))]
  pub async fn delete(&self, ctx: &Context, id: &str) -> Result<()> {
    let _guard = self.lock(id)?;

    if !self.store.exists(ctx, id).await? {
      debug!("Volume already gone");
      return Ok(());
    }

    self.store.purge(ctx, id).await?;
    info!("Volume deleted");
    Ok(())
  }

  /// Rewrite the stored capacity of `id`, returning the new capacity.
  #[instrument(skip(self, ctx))]
  pub async fn expand(&self, ctx: &Context, id: &str, capacity: u64) -> Result<u64> {
    let _guard = self.lock(id)?;

    let mut volume = self
      .store
      .read(ctx, id)
      .await?
      .ok_or_else(|| Error::NotFound(format!("volume {}", id)))?;

    volume.set_capacity(capacity);
    self.store.write(ctx, &volume).await?;
    info!(capacity, "Volume expanded");
    Ok(capacity)
  }
}
