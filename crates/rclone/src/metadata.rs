use crate::{
  context::Context,
  error::{Error, Result},
  rc::{RcError, RemoteControl, Transport},
  volume::{metadata_path, Volume},
};
use std::{
  path::{Path, PathBuf},
  sync::Arc,
};
use tempfile::TempPath;
use tracing::{debug, instrument};

/// Reads and writes volume metadata objects on the remote.
///
/// Metadata never goes to its final location directly. It is written to a
/// staging file in `work_dir` and moved onto the remote, and read back by
/// copying it into a fresh staging file.
pub struct MetadataStore<T: Transport> {
  rc: Arc<RemoteControl<T>>,
  remote: String,
  work_dir: PathBuf,
}

impl<T: Transport> MetadataStore<T> {
  pub fn new(rc: Arc<RemoteControl<T>>, remote: impl Into<String>, work_dir: impl Into<PathBuf>) -> Self {
    MetadataStore {
      rc,
      remote: remote.into(),
      work_dir: work_dir.into(),
    }
  }

  #[inline]
  pub fn remote(&self) -> &str {
    &self.remote
  }

  fn remote_error(&self, err: RcError) -> Error {
    match err {
      RcError::RemoteNotFound => Error::RemoteNotFound(self.remote.clone()),
      err => err.into(),
    }
  }

  /// A unique, not yet existing path in the work directory.
  fn staging_path(&self) -> Result<TempPath> {
    tempfile::Builder::new()
      .prefix(".csi-metadata-")
      .tempfile_in(&self.work_dir)
      .map(|file| file.into_temp_path())
      .map_err(|e| Error::internal("creating staging file", e))
  }

  /// Whether the metadata object for `id` exists.
  #[instrument(level = "debug", skip(self, ctx))]
  pub async fn exists(&self, ctx: &Context, id: &str) -> Result<bool> {
    let item = self
      .rc
      .stat(ctx, &self.remote, &metadata_path(id))
      .await
      .map_err(|e| self.remote_error(e))?;
    Ok(item.is_some())
  }

  /// Read the metadata for `id`; `None` when the volume does not exist.
  #[instrument(level = "debug", skip(self, ctx))]
  pub async fn read(&self, ctx: &Context, id: &str) -> Result<Option<Volume>> {
    let staging = self.staging_path()?;
    let (dir, name) = split(&staging)?;

    match self
      .rc
      .copy_file(ctx, &self.remote, &metadata_path(id), dir, name)
      .await
    {
      Ok(()) => {}
      Err(RcError::NotFound) => {
        debug!(%id, "No metadata on remote");
        return Ok(None);
      }
      Err(e) => return Err(self.remote_error(e)),
    }

    let bytes = tokio::fs::read(&staging).await?;
    let volume = Volume::from_json(&bytes).map_err(|e| Error::internal("decoding metadata", e))?;
    Ok(Some(volume))
  }

  /// Persist `volume` under its own remote, replacing any previous record.
  #[instrument(level = "debug", skip(self, ctx))]
  pub async fn write(&self, ctx: &Context, volume: &Volume) -> Result<()> {
    let bytes = volume
      .to_json(true)
      .map_err(|e| Error::internal("encoding metadata", e))?;

    let staging = self.staging_path()?;
    tokio::fs::write(&staging, bytes).await?;
    let (dir, name) = split(&staging)?;

    self
      .rc
      .move_file(ctx, dir, name, volume.remote(), &metadata_path(volume.id()))
      .await
      .map_err(|e| self.remote_error(e))
  }

  /// Remove everything stored for `id`, metadata included.
  #[instrument(level = "debug", skip(self, ctx))]
  pub async fn purge(&self, ctx: &Context, id: &str) -> Result<()> {
    self
      .rc
      .purge(ctx, &self.remote, id)
      .await
      .map_err(|e| self.remote_error(e))
  }
}

/// Split a staging path into the local file system root and file name
/// that rclone addresses it by.
fn split(path: &Path) -> Result<(&str, &str)> {
  let dir = path.parent().and_then(Path::to_str);
  let name = path.file_name().and_then(|n| n.to_str());

  match (dir, name) {
    (Some(dir), Some(name)) => Ok((dir, name)),
    _ => Err(Error::Internal(format!(
      "staging path {} is not valid UTF-8",
      path.display()
    ))),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::rc::FakeRemoteControl;

  struct Fixture {
    fake: FakeRemoteControl,
    store: MetadataStore<FakeRemoteControl>,
    work_dir: tempfile::TempDir,
  }

  fn fixture(remote: &str) -> Fixture {
    let work_dir = tempfile::tempdir().unwrap();
    let fake = FakeRemoteControl::new(vec!["r"]);
    let rc = Arc::new(RemoteControl::new(fake.clone()));
    let store = MetadataStore::new(rc, remote, work_dir.path());
    Fixture {
      fake,
      store,
      work_dir,
    }
  }

  #[tokio::test]
  async fn write_then_read() {
    let f = fixture("r:bucket");
    let ctx = Context::background();
    let volume = Volume::new("r:bucket", "pvc-1", 1024);

    assert!(!f.store.exists(&ctx, volume.id()).await.unwrap());
    f.store.write(&ctx, &volume).await.unwrap();

    assert!(f.store.exists(&ctx, volume.id()).await.unwrap());
    assert_eq!(f.store.read(&ctx, volume.id()).await.unwrap(), Some(volume.clone()));

    let stored = f
      .fake
      .object(&format!("r:bucket/{}/.csi-metadata", volume.id()))
      .unwrap();
    assert_eq!(stored, volume.to_json(true).unwrap());
  }

  #[tokio::test]
  async fn staging_files_are_cleaned_up() {
    let f = fixture("r:");
    let ctx = Context::background();
    let volume = Volume::new("r:", "pvc-1", 1);

    f.store.write(&ctx, &volume).await.unwrap();
    f.store.read(&ctx, volume.id()).await.unwrap();
    f.store.read(&ctx, "missing").await.unwrap();

    assert_eq!(std::fs::read_dir(f.work_dir.path()).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn missing_metadata_is_none() {
    let f = fixture("r:");
    assert_eq!(f.store.read(&Context::background(), "nope").await.unwrap(), None);
  }

  #[tokio::test]
  async fn unknown_remote_is_reported() {
    let f = fixture("gone:");
    let err = f.store.read(&Context::background(), "id").await.unwrap_err();
    assert!(matches!(err, Error::RemoteNotFound(remote) if remote == "gone:"));
  }

  #[tokio::test]
  async fn corrupt_metadata_is_internal() {
    let f = fixture("r:");
    f.fake.insert("r:id/.csi-metadata", "not json");
    let err = f.store.read(&Context::background(), "id").await.unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
  }

  #[tokio::test]
  async fn purge_removes_volume_tree() {
    let f = fixture("r:");
    let ctx = Context::background();
    f.fake.insert("r:id/.csi-metadata", "{}");
    f.fake.insert("r:id/data", "x");

    f.store.purge(&ctx, "id").await.unwrap();
    assert!(f.fake.object_paths().is_empty());
  }
}
