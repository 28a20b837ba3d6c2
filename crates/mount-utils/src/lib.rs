cfg_if::cfg_if! {
  if #[cfg(unix)] {
    mod unix;
    use unix::*;
  } else {
    compile_error!("Only cfg(unix) is supported at this time")
  }
}

mod fake;
mod runner;

pub use fake::FakeAction;

use futures::future::BoxFuture;
use runner::{run, run_inst, MounterImpl, MounterWrapper};
use static_assertions::assert_impl_all;
use std::{
  fmt, io,
  path::{Path, PathBuf},
  result,
  sync::Arc,
  time::Duration,
};
use thiserror::Error;
use tracing::Instrument;

pub type Result<T> = result::Result<T, MountError>;
pub type FutureResult<T> = BoxFuture<'static, Result<T>>;

const DEFAULT_UNMOUNT_COMMAND: &str = "umount";

/// Inspects and tears down mount points on the local system.
///
/// All operations run on a dedicated dispatcher thread so that blocking
/// syscalls and `umount` invocations never stall the async runtime.
pub trait Mounter: Sized + Send + Sync + 'static {
  /// Create a new mounter. `unmount_command` defaults to `umount` when empty.
  fn new<P>(unmount_command: P) -> FutureResult<Self>
  where
    P: Into<PathBuf>;

  /// Unmount unmounts given target. If `force_after` is set and the unmount
  /// has not finished by then, it is killed and retried with `-f`.
  fn unmount<P>(&self, target: P, force_after: Option<Duration>) -> FutureResult<()>
  where
    P: Into<PathBuf>;

  /// List returns a list of all mounted filesystems. This can be large.
  fn list(&self) -> FutureResult<Vec<MountPoint>>;

  /// Uses heuristics to determine if a directory is not a mountpoint. Fails
  /// with a not-found error when the directory does not exist. Does NOT
  /// properly detect bind mounts.
  fn is_likely_not_mount_point<P>(&self, file: P) -> FutureResult<bool>
  where
    P: Into<PathBuf>;

  /// Like [Mounter::is_likely_not_mount_point], but falls back to scanning
  /// the mount table when the heuristic says "not a mount point".
  fn is_not_mount_point<P>(&self, file: P) -> FutureResult<bool>
  where
    P: Into<PathBuf>;

  fn is_mount_point<P>(&self, file: P) -> FutureResult<bool>
  where
    P: Into<PathBuf>;

  /// Unmounts `path` if it is a mount point, and removes the directory.
  /// A missing path is not an error, and a corrupted mount is unmounted
  /// without being probed first. `extensive` selects
  /// [Mounter::is_not_mount_point] over the faster heuristic.
  fn cleanup_mount_point<P>(&self, path: P, extensive: bool) -> FutureResult<()>
  where
    P: Into<PathBuf>;
}

/// MountPoint represents a single line in /proc/mounts or /etc/fstab.
#[derive(Clone, PartialEq)]
pub struct MountPoint {
  device: String,
  path: PathBuf,
  ty: String,
  opts: Vec<String>,
  freq: isize,
  pass: isize,
}

impl fmt::Debug for MountPoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MountPoint")
      .field("device", &self.device)
      .field("path", &self.path)
      .field("type", &self.ty)
      .field("opts", &format!("length={}", self.opts.len()))
      .field("freq", &self.freq)
      .field("pass", &self.pass)
      .finish()
  }
}

impl MountPoint {
  pub fn new(device: impl Into<String>, path: impl Into<PathBuf>, ty: impl Into<String>) -> Self {
    MountPoint {
      device: device.into(),
      path: path.into(),
      ty: ty.into(),
      opts: Vec::new(),
      freq: 0,
      pass: 0,
    }
  }

  #[inline]
  pub fn device(&self) -> &str {
    &self.device
  }

  #[inline]
  pub fn path(&self) -> &Path {
    &self.path
  }

  #[inline]
  pub fn mount_type(&self) -> &str {
    &self.ty
  }

  #[inline]
  pub fn opts(&self) -> &[String] {
    &self.opts
  }

  #[inline]
  pub fn freq(&self) -> isize {
    self.freq
  }

  #[inline]
  pub fn pass(&self) -> isize {
    self.pass
  }

  /// Whether this entry is mounted at `dir`, including entries whose
  /// mount directory has since been deleted.
  pub fn matches(&self, dir: &Path) -> bool {
    is_mount_point_match(self, dir)
  }
}

#[derive(Debug, Error)]
pub enum MountError {
  #[error("Command `{command}` failed: {output}")]
  CommandFailed { command: String, output: String },
  #[error("Mount dispatcher failure: {0}")]
  Dispatcher(String),
  #[error("Unknown mount error: {0}")]
  UnknownMountError(
    #[from]
    #[source]
    io::Error,
  ),
}

impl MountError {
  fn io(&self) -> Option<&io::Error> {
    match self {
      MountError::UnknownMountError(e) => Some(e),
      _ => None,
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self.io().map(io::Error::kind), Some(io::ErrorKind::NotFound))
  }

  pub fn is_permission_error(&self) -> bool {
    matches!(
      self.io().map(io::Error::kind),
      Some(io::ErrorKind::PermissionDenied)
    )
  }

  /// Whether the error comes from probing a mount whose backing filesystem
  /// has gone away (stale handle, disconnected transport).
  pub fn is_corrupted_mount(&self) -> bool {
    self
      .io()
      .and_then(io::Error::raw_os_error)
      .map(is_corrupted_mount_errno)
      .unwrap_or(false)
  }

  fn new(msg: impl Into<String>) -> Self {
    MountError::UnknownMountError(io::Error::new(io::ErrorKind::Other, msg.into()))
  }
}

impl<T> Mounter for T
where
  T: MounterWrapper + Send + Sync + 'static,
{
  fn new<P>(unmount_command: P) -> FutureResult<Self>
  where
    P: Into<PathBuf>,
  {
    let unmount_command = unmount_command.into();

    Box::pin(
      async move {
        run(move || <T as MounterWrapper>::Mounter::new(unmount_command))
          .await
          .map(|inner| T::new(Arc::new(inner)))
      }
      .in_current_span(),
    )
  }

  fn unmount<P>(&self, target: P, force_after: Option<Duration>) -> FutureResult<()>
  where
    P: Into<PathBuf>,
  {
    let target = target.into();

    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.unmount(target, force_after)
    }))
  }

  fn list(&self) -> FutureResult<Vec<MountPoint>> {
    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.list()
    }))
  }

  fn is_likely_not_mount_point<P>(&self, file: P) -> FutureResult<bool>
  where
    P: Into<PathBuf>,
  {
    let file = file.into();

    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.is_likely_not_mount_point(file)
    }))
  }

  fn is_not_mount_point<P>(&self, file: P) -> FutureResult<bool>
  where
    P: Into<PathBuf>,
  {
    let file = file.into();

    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.is_not_mount_point(file)
    }))
  }

  fn is_mount_point<P>(&self, file: P) -> FutureResult<bool>
  where
    P: Into<PathBuf>,
  {
    let file = file.into();

    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.is_not_mount_point(file).map(|not_mnt| !not_mnt)
    }))
  }

  fn cleanup_mount_point<P>(&self, path: P, extensive: bool) -> FutureResult<()>
  where
    P: Into<PathBuf>,
  {
    let path = path.into();

    Box::pin(run_inst(self.mounter().clone(), move |mounter| {
      mounter.cleanup_mount_point(path, extensive)
    }))
  }
}

assert_impl_all!(OsMounter: MounterImpl);
assert_impl_all!(fake::FakeMounter: MounterImpl);

/// Mounter backed by the host's mount table and `umount`.
#[derive(Clone)]
pub struct DefaultMounter(Arc<OsMounter>);

impl MounterWrapper for DefaultMounter {
  type Mounter = OsMounter;

  fn new(inner: Arc<Self::Mounter>) -> Self {
    DefaultMounter(inner)
  }

  #[inline]
  fn mounter(&self) -> &Arc<Self::Mounter> {
    &self.0
  }
}

/// In-memory mount table for tests. Clones share the same table.
#[derive(Clone)]
pub struct FakeMounter(Arc<fake::FakeMounter>);

impl FakeMounter {
  pub fn with_mount_points(mps: impl IntoIterator<Item = MountPoint>) -> Self {
    FakeMounter(Arc::new(fake::FakeMounter::new(mps)))
  }

  /// Record `path` as mounted from `device`.
  pub fn add_mount_point(&self, device: impl Into<String>, path: impl Into<PathBuf>) {
    self.0.add_mount_point(device.into(), path.into())
  }

  /// Make every mount check on `path` fail with the error built by `factory`.
  pub fn set_check_error<F>(&self, path: impl Into<PathBuf>, factory: F)
  where
    F: Fn() -> MountError + Send + 'static,
  {
    self.0.set_check_error(path.into(), Box::new(factory))
  }

  pub fn mount_points(&self) -> Vec<MountPoint> {
    self.0.mount_points()
  }

  pub fn log(&self) -> Vec<FakeAction> {
    self.0.get_log()
  }

  pub fn reset_log(&self) {
    self.0.reset_log()
  }
}

impl MounterWrapper for FakeMounter {
  type Mounter = fake::FakeMounter;

  fn new(inner: Arc<Self::Mounter>) -> Self {
    FakeMounter(inner)
  }

  #[inline]
  fn mounter(&self) -> &Arc<Self::Mounter> {
    &self.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;

  #[tokio::test]
  async fn cleanup_unmounts_and_removes() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("target");
    fs::create_dir(&target).unwrap();

    let mounter = FakeMounter::with_mount_points(None);
    mounter.add_mount_point("remote:vol", &target);
    assert!(mounter.is_mount_point(&target).await.unwrap());

    mounter.cleanup_mount_point(&target, true).await.unwrap();

    assert!(!target.exists());
    assert!(mounter.mount_points().is_empty());
    assert!(matches!(
      mounter.log().as_slice(),
      [FakeAction::Unmount { .. }]
    ));
  }

  #[tokio::test]
  async fn cleanup_of_missing_path_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mounter = FakeMounter::with_mount_points(None);

    mounter
      .cleanup_mount_point(dir.path().join("missing"), true)
      .await
      .unwrap();
    assert!(mounter.log().is_empty());
  }

  #[tokio::test]
  async fn cleanup_of_plain_directory_removes_it() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("plain");
    fs::create_dir(&target).unwrap();
    let mounter = FakeMounter::with_mount_points(None);

    mounter.cleanup_mount_point(&target, false).await.unwrap();
    assert!(!target.exists());
    assert!(mounter.log().is_empty());
  }

  #[tokio::test]
  async fn missing_path_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let mounter = FakeMounter::with_mount_points(None);

    let err = mounter
      .is_likely_not_mount_point(dir.path().join("missing"))
      .await
      .unwrap_err();
    assert!(err.is_not_found());
  }

  #[tokio::test]
  async fn check_errors_are_injected() {
    let dir = tempfile::tempdir().unwrap();
    let mounter = FakeMounter::with_mount_points(None);
    mounter.set_check_error(dir.path(), || {
      io::Error::from_raw_os_error(libc::ENOTCONN).into()
    });

    let err = mounter
      .is_likely_not_mount_point(dir.path())
      .await
      .unwrap_err();
    assert!(err.is_corrupted_mount());
    assert!(!err.is_not_found());
  }

  #[test]
  fn deleted_mount_point_matches() {
    let mp = MountPoint::new("remote:", "/mnt/a\\040(deleted)", "fuse.rclone");
    assert!(mp.matches(Path::new("/mnt/a")));
    assert!(!mp.matches(Path::new("/mnt/b")));
  }
}
