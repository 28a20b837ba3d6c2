use crate::{
  context::Context,
  error::{Error, Result},
  locks::{KeyedLockRegistry, LockGuard},
  options::MountOptions,
  rc::{RemoteControl, Transport},
  volume::backend_path,
};
use csi_mount_utils::{MountError, Mounter};
use futures::{future::BoxFuture, FutureExt};
use std::{collections::HashMap, future::Future, io, path::Path, sync::Arc, time::Duration};
use tokio::fs::DirBuilder;
use tracing::{debug, info, instrument, warn};

/// How long a stale mount gets to unmount cleanly before it is forced.
pub const STALE_UNMOUNT_GRACE: Duration = Duration::from_secs(10);

const TARGET_PATH_MODE: u32 = 0o770;

type ListProbe = for<'a> fn(&'a Path) -> BoxFuture<'a, io::Result<()>>;

/// Open `target` and read its first entry. Opening alone is answered by the
/// FUSE layer even when the backend behind the mount is gone.
fn list_target(target: &Path) -> BoxFuture<'_, io::Result<()>> {
  async move {
    let mut entries = tokio::fs::read_dir(target).await?;
    entries.next_entry().await?;
    Ok(())
  }
  .boxed()
}

/// Publish and unpublish volumes on this node.
///
/// Each (volume, target path) pair is its own lock key, so one volume can
/// be mounted at several targets at once but never twice at the same one.
pub struct MountOrchestrator<T: Transport, M: Mounter> {
  rc: Arc<RemoteControl<T>>,
  mounter: M,
  locks: Arc<KeyedLockRegistry>,
  remote: String,
  defaults: MountOptions,
  probe: ListProbe,
}

impl<T: Transport, M: Mounter> MountOrchestrator<T, M> {
  pub fn new(
    rc: Arc<RemoteControl<T>>,
    mounter: M,
    locks: Arc<KeyedLockRegistry>,
    remote: impl Into<String>,
    defaults: MountOptions,
  ) -> Self {
    MountOrchestrator {
      rc,
      mounter,
      locks,
      remote: remote.into(),
      defaults,
      probe: list_target,
    }
  }

  #[cfg(test)]
  fn with_probe(mut self, probe: ListProbe) -> Self {
    self.probe = probe;
    self
  }

  fn lock(&self, id: &str, target: &Path) -> Result<LockGuard> {
    self
      .locks
      .try_acquire(format!("{}-{}", id, target.display()))
      .ok_or_else(|| Error::OperationInProgress(id.to_owned()))
  }

  /// Run a local mount check within the context. The outer result fails
  /// when the context interrupts it; the inner one carries the check's own
  /// outcome.
  async fn local<F, R>(ctx: &Context, future: F) -> Result<Result<R, MountError>>
  where
    F: Future<Output = Result<R, MountError>>,
  {
    ctx.run(future.map(Ok::<_, Error>)).await
  }

  /// Mount volume `id` at `target`, creating the directory if needed.
  ///
  /// A target that is already a mount and can be listed counts as
  /// published. A mount that cannot be listed is stale and is unmounted
  /// before mounting again. `volume_context` may override the mount type
  /// and option blobs per key.
  #[instrument(skip(self, ctx, volume_context), fields(target = %target.display()))]
  pub async fn publish(
    &self,
    ctx: &Context,
    id: &str,
    target: &Path,
    volume_context: &HashMap<String, String>,
  ) -> Result<()> {
    let _guard = self.lock(id, target)?;

    let not_mount = match Self::local(ctx, self.mounter.is_likely_not_mount_point(target)).await? {
      Ok(not_mount) => not_mount,
      Err(e) if e.is_not_found() => {
        debug!("Creating target path");
        DirBuilder::new()
          .recursive(true)
          .mode(TARGET_PATH_MODE)
          .create(target)
          .await?;
        true
      }
      // A corrupted mount fails publish; unpublish tears it down instead.
      Err(e) => return Err(e.into()),
    };

    if !not_mount {
      let listable = ctx
        .run((self.probe)(target).map(|r| Ok::<_, Error>(r.is_ok())))
        .await?;
      if listable {
        debug!("Target path already mounted");
        return Ok(());
      }

      warn!("Target path is a mount point but does not respond, unmounting");
      Self::local(ctx, self.mounter.unmount(target, Some(STALE_UNMOUNT_GRACE))).await??;
    }

    let mount_point = target.to_str().ok_or_else(|| {
      Error::InvalidRequest(format!(
        "target path {} is not valid UTF-8",
        target.display()
      ))
    })?;
    let options = self.defaults.with_overrides(volume_context);
    self
      .rc
      .mount(ctx, &backend_path(&self.remote, id), mount_point, &options)
      .await?;

    info!(?options, "Volume mounted");
    Ok(())
  }

  /// Unmount `target` and remove it. A target that is not mounted, or does
  /// not exist, is already unpublished.
  #[instrument(skip(self, ctx), fields(target = %target.display()))]
  pub async fn unpublish(&self, ctx: &Context, id: &str, target: &Path) -> Result<()> {
    let _guard = self.lock(id, target)?;

    let mounted = match Self::local(ctx, self.mounter.is_mount_point(target)).await? {
      Ok(mounted) => mounted,
      Err(e) if e.is_not_found() => false,
      Err(e) if e.is_corrupted_mount() => true,
      Err(e) => return Err(e.into()),
    };

    if !mounted {
      debug!("Target path is not mounted");
      return Ok(());
    }

    Self::local(ctx, self.mounter.cleanup_mount_point(target, true)).await??;
    info!("Volume unmounted");
    Ok(())
  }
}
