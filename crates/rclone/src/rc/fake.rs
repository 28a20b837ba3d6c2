use super::{Params, RcError, Transport};
use crate::volume::backend_path;
use async_trait::async_trait;
use csi_mount_utils::FakeMounter;
use serde_json::{json, Value};
use std::{
  collections::{BTreeMap, HashMap, HashSet},
  fs, io,
  path::Path,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

#[derive(Default)]
struct State {
  objects: BTreeMap<String, Vec<u8>>,
  calls: Vec<String>,
  mounts: Vec<Params>,
  failures: HashMap<String, String>,
  mounter: Option<FakeMounter>,
  latency: Option<Duration>,
}

struct Inner {
  remotes: HashSet<String>,
  state: Mutex<State>,
}

/// In-memory stand-in for `rclone rcd`.
///
/// Objects on configured remotes live in a map keyed by their full backend
/// path; a file system without a `name:` prefix is the local disk, which is
/// where staging files come from. Mounts are recorded and, when a
/// [FakeMounter] is attached, registered in its mount table. Clones share
/// state.
#[derive(Clone)]
pub struct FakeRemoteControl(Arc<Inner>);

impl FakeRemoteControl {
  pub fn new<'a>(remotes: impl IntoIterator<Item = &'a str>) -> Self {
    FakeRemoteControl(Arc::new(Inner {
      remotes: remotes.into_iter().map(str::to_owned).collect(),
      state: Mutex::default(),
    }))
  }

  /// Register every successful `mount/mount` in `mounter`.
  pub fn with_mounter(self, mounter: FakeMounter) -> Self {
    self.state().mounter = Some(mounter);
    self
  }

  /// Delay every call, so overlapping operations can be observed.
  pub fn with_latency(self, latency: Duration) -> Self {
    self.state().latency = Some(latency);
    self
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.0.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Make every call to `method` fail with `message`.
  pub fn fail(&self, method: impl Into<String>, message: impl Into<String>) {
    self.state().failures.insert(method.into(), message.into());
  }

  pub fn insert(&self, path: impl Into<String>, data: impl Into<Vec<u8>>) {
    self.state().objects.insert(path.into(), data.into());
  }

  pub fn object(&self, path: &str) -> Option<Vec<u8>> {
    self.state().objects.get(path).cloned()
  }

  pub fn object_paths(&self) -> Vec<String> {
    self.state().objects.keys().cloned().collect()
  }

  /// Methods called so far, in order.
  pub fn calls(&self) -> Vec<String> {
    self.state().calls.clone()
  }

  pub fn mounts(&self) -> Vec<Params> {
    self.state().mounts.clone()
  }

  /// Whether `fs` names a configured remote rather than the local disk.
  fn check_remote(&self, method: &str, fs: &str) -> Result<bool, RcError> {
    match fs.find(':') {
      None => Ok(false),
      Some(i) if self.0.remotes.contains(&fs[..i]) => Ok(true),
      Some(_) => Err(failed(
        method,
        format!(
          "failed to create file system for {:?}: didn't find section in config file",
          fs
        ),
      )),
    }
  }

  fn read(&self, state: &State, method: &str, fs: &str, remote: &str) -> Result<Vec<u8>, RcError> {
    if self.check_remote(method, fs)? {
      return state
        .objects
        .get(&backend_path(fs, remote))
        .cloned()
        .ok_or_else(|| failed(method, "object not found"));
    }

    fs::read(Path::new(fs).join(remote)).map_err(|e| match e.kind() {
      io::ErrorKind::NotFound => failed(method, "object not found"),
      _ => failed(method, e.to_string()),
    })
  }

  fn write(
    &self,
    state: &mut State,
    method: &str,
    fs: &str,
    remote: &str,
    data: Vec<u8>,
  ) -> Result<(), RcError> {
    if self.check_remote(method, fs)? {
      state.objects.insert(backend_path(fs, remote), data);
      return Ok(());
    }

    fs::write(Path::new(fs).join(remote), data).map_err(|e| failed(method, e.to_string()))
  }

  fn remove(&self, state: &mut State, method: &str, fs: &str, remote: &str) -> Result<(), RcError> {
    if self.check_remote(method, fs)? {
      state.objects.remove(&backend_path(fs, remote));
      return Ok(());
    }

    fs::remove_file(Path::new(fs).join(remote)).map_err(|e| failed(method, e.to_string()))
  }

  fn dispatch(&self, state: &mut State, method: &str, params: &Params) -> Result<Params, RcError> {
    let arg = |key: &str| string_param(method, params, key);

    match method {
      "operations/stat" => {
        let (fs, remote) = (arg("fs")?, arg("remote")?);
        self.check_remote(method, fs)?;
        let item = match state.objects.get(&backend_path(fs, remote)) {
          Some(data) => json!({
            "Path": remote,
            "Name": remote.rsplit('/').next().unwrap_or(remote),
            "Size": data.len(),
            "IsDir": false,
          }),
          None => Value::Null,
        };

        let mut out = Params::new();
        out.insert("item".into(), item);
        Ok(out)
      }
      "operations/copyfile" | "operations/movefile" => {
        let (src_fs, src_remote) = (arg("srcFs")?, arg("srcRemote")?);
        let (dst_fs, dst_remote) = (arg("dstFs")?, arg("dstRemote")?);

        let data = self.read(state, method, src_fs, src_remote)?;
        self.write(state, method, dst_fs, dst_remote, data)?;
        if method == "operations/movefile" {
          self.remove(state, method, src_fs, src_remote)?;
        }
        Ok(Params::new())
      }
      "operations/purge" => {
        let (fs, remote) = (arg("fs")?, arg("remote")?);
        self.check_remote(method, fs)?;
        let root = backend_path(fs, remote);
        let prefix = format!("{}/", root);
        state
          .objects
          .retain(|path, _| path != &root && !path.starts_with(&prefix));
        Ok(Params::new())
      }
      "mount/mount" => {
        let (fs, mount_point) = (arg("fs")?, arg("mountPoint")?);
        self.check_remote(method, fs)?;
        if let Some(mounter) = &state.mounter {
          mounter.add_mount_point(fs, mount_point);
        }
        state.mounts.push(params.clone());
        Ok(Params::new())
      }
      _ => Err(failed(method, "couldn't find method")),
    }
  }
}

fn failed(method: &str, message: impl Into<String>) -> RcError {
  RcError::Failed {
    method: method.to_owned(),
    message: message.into(),
  }
}

fn string_param<'a>(method: &str, params: &'a Params, key: &str) -> Result<&'a str, RcError> {
  params
    .get(key)
    .and_then(Value::as_str)
    .ok_or_else(|| failed(method, format!("Didn't find key {:?} in input", key)))
}

#[async_trait]
impl Transport for FakeRemoteControl {
  async fn call(&self, method: &str, params: Params) -> Result<Params, RcError> {
    let latency = self.state().latency;
    if let Some(latency) = latency {
      tokio::time::sleep(latency).await;
    }

    let mut state = self.state();
    state.calls.push(method.to_owned());
    if let Some(message) = state.failures.get(method) {
      return Err(failed(method, message.clone()));
    }

    self.dispatch(&mut state, method, &params)
  }
}
