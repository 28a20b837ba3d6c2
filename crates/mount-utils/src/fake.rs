use crate::{runner::MounterImpl, MountError, MountPoint, Result};
use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Mutex, MutexGuard, PoisonError},
  time::Duration,
};
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub enum FakeAction {
  Unmount { target: PathBuf },
}

pub(crate) type ErrorFactory = Box<dyn Fn() -> MountError + Send>;

struct FakeMounterInner {
  mount_points: Vec<MountPoint>,
  log: Vec<FakeAction>,
  mount_check_errors: HashMap<PathBuf, ErrorFactory>,
}

pub struct FakeMounter(Mutex<FakeMounterInner>);

/// Resolve symlinks the way the kernel would, keeping paths that do not exist.
fn resolve(path: PathBuf) -> PathBuf {
  path.canonicalize().unwrap_or(path)
}

impl FakeMounter {
  pub fn new(mps: impl IntoIterator<Item = MountPoint>) -> Self {
    let inner = FakeMounterInner {
      mount_points: mps.into_iter().collect(),
      log: Vec::new(),
      mount_check_errors: HashMap::new(),
    };

    Self(Mutex::new(inner))
  }

  fn inner(&self) -> MutexGuard<'_, FakeMounterInner> {
    self.0.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn add_mount_point(&self, device: String, path: PathBuf) {
    let path = resolve(path);
    info!("Fake mounter: mounted {} to {}", device, path.display());
    self.inner().mount_points.push(MountPoint {
      device,
      path,
      ty: "fuse.rclone".into(),
      opts: Vec::new(),
      freq: 0,
      pass: 0,
    });
  }

  pub fn set_check_error(&self, path: PathBuf, factory: ErrorFactory) {
    self.inner().mount_check_errors.insert(path, factory);
  }

  pub fn mount_points(&self) -> Vec<MountPoint> {
    self.inner().mount_points.clone()
  }

  pub fn reset_log(&self) {
    self.inner().log.clear();
  }

  pub fn get_log(&self) -> Vec<FakeAction> {
    self.inner().log.clone()
  }

  fn is_mounted(inner: &FakeMounterInner, file: &Path) -> bool {
    inner.mount_points.iter().any(|mp| mp.matches(file))
  }
}

impl MounterImpl for FakeMounter {
  fn new(_: PathBuf) -> Result<Self> {
    Ok(FakeMounter::new(None))
  }

  fn unmount(&self, target: PathBuf, _: Option<Duration>) -> Result<()> {
    let mut inner = self.inner();
    let orig_target = target.clone();
    let target = resolve(target);

    if let Some(i) = inner.mount_points.iter().position(|mp| mp.path == target) {
      let mp = inner.mount_points.remove(i);
      info!(
        "Fake mounter: unmounted {} from {}",
        mp.device,
        target.display()
      );
    }

    inner.log.push(FakeAction::Unmount { target });
    inner.mount_check_errors.remove(&orig_target);
    Ok(())
  }

  fn list(&self) -> Result<Vec<MountPoint>> {
    Ok(self.mount_points())
  }

  fn is_likely_not_mount_point(&self, file: PathBuf) -> Result<bool> {
    let inner = self.inner();

    if let Some(err_factory) = inner.mount_check_errors.get(&file) {
      return Err(err_factory());
    }

    let _ = file.metadata()?;
    let file = resolve(file);

    let not_mnt = !FakeMounter::is_mounted(&inner, &file);
    info!("isLikelyNotMountPoint for {}: {}", file.display(), not_mnt);
    Ok(not_mnt)
  }
}
