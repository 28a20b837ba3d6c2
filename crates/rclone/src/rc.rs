//! Client for the rclone remote-control (`rcd`) API.
//!
//! Every call is a flat JSON object in and a flat JSON object out. The
//! [Transport] carries a single call; [RemoteControl] knows the handful of
//! methods the driver needs and turns their failures into [RcError]s.

mod fake;
mod http;

pub use fake::FakeRemoteControl;
pub use http::HttpTransport;

use crate::{
  context::{Context, Interrupted},
  options::MountOptions,
};
use async_trait::async_trait;
use serde_json::Value;
use std::error::Error as StdError;
use thiserror::Error;
use tracing::{debug, instrument};

/// Parameters of, and results from, a remote-control call.
pub type Params = serde_json::Map<String, Value>;

const NOT_FOUND_SUFFIX: &str = "object not found";
const REMOTE_NOT_FOUND_SUFFIX: &str = "didn't find section in config file";
const STAT_OPTIONS: &str = r#"{"recurse": false}"#;

#[derive(Debug, Error)]
pub enum RcError {
  #[error("object not found")]
  NotFound,

  #[error("didn't find section in config file")]
  RemoteNotFound,

  #[error("operation {method:?} failed: {message}")]
  Failed { method: String, message: String },

  #[error("error calling {method:?}: {source}")]
  Transport {
    method: String,
    #[source]
    source: Box<dyn StdError + Send + Sync>,
  },

  #[error("invalid response from {method:?}: {source}")]
  InvalidResponse {
    method: String,
    #[source]
    source: serde_json::Error,
  },

  #[error(transparent)]
  Interrupted(#[from] Interrupted),
}

impl RcError {
  /// Build the error for a non-OK reply from its `error` field.
  pub fn failed(method: impl Into<String>, response: &Params) -> Self {
    let message = match response.get("error") {
      None | Some(Value::Null) => "<nil>".to_owned(),
      Some(Value::String(s)) => s.clone(),
      Some(other) => other.to_string(),
    };

    RcError::Failed {
      method: method.into(),
      message,
    }
  }

  pub fn transport(method: impl Into<String>, source: impl StdError + Send + Sync + 'static) -> Self {
    RcError::Transport {
      method: method.into(),
      source: Box::new(source),
    }
  }

  /// Recognise the failures that copy and move report by message suffix.
  fn classify(self) -> Self {
    match &self {
      RcError::Failed { message, .. } if message.ends_with(NOT_FOUND_SUFFIX) => RcError::NotFound,
      RcError::Failed { message, .. } if message.ends_with(REMOTE_NOT_FOUND_SUFFIX) => {
        RcError::RemoteNotFound
      }
      _ => self,
    }
  }
}

/// Carries one call to the remote-control server.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
  async fn call(&self, method: &str, params: Params) -> Result<Params, RcError>;
}

fn params<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Params {
  pairs
    .into_iter()
    .map(|(k, v)| (k.to_owned(), Value::String(v.to_owned())))
    .collect()
}

/// The remote-control methods used by the driver.
pub struct RemoteControl<T: Transport> {
  transport: T,
}

impl<T: Transport> RemoteControl<T> {
  pub fn new(transport: T) -> Self {
    RemoteControl { transport }
  }

  #[inline]
  pub fn transport(&self) -> &T {
    &self.transport
  }

  /// Issue `method`, honouring the context's cancellation and deadline.
  pub async fn call(&self, ctx: &Context, method: &str, params: Params) -> Result<Params, RcError> {
    ctx.check()?;
    debug!(method, "Calling remote control");
    ctx.run(self.transport.call(method, params)).await
  }

  /// Look up a single object. `None` when the backend reports no item.
  #[instrument(level = "debug", skip(self, ctx))]
  pub async fn stat(&self, ctx: &Context, fs: &str, remote: &str) -> Result<Option<Value>, RcError> {
    let mut out = self
      .call(
        ctx,
        "operations/stat",
        params(vec![("fs", fs), ("remote", remote), ("opt", STAT_OPTIONS)]),
      )
      .await?;

    match out.remove("item") {
      None | Some(Value::Null) => Ok(None),
      Some(item) => Ok(Some(item)),
    }
  }

  #[instrument(level = "debug", skip(self, ctx))]
  pub async fn copy_file(
    &self,
    ctx: &Context,
    src_fs: &str,
    src_remote: &str,
    dst_fs: &str,
    dst_remote: &str,
  ) -> Result<(), RcError> {
    self
      .transfer(ctx, "operations/copyfile", src_fs, src_remote, dst_fs, dst_remote)
      .await
  }

  #[instrument(level = "debug", skip(self, ctx))]
  pub async fn move_file(
    &self,
    ctx: &Context,
    src_fs: &str,
    src_remote: &str,
    dst_fs: &str,
    dst_remote: &str,
  ) -> Result<(), RcError> {
    self
      .transfer(ctx, "operations/movefile", src_fs, src_remote, dst_fs, dst_remote)
      .await
  }

  async fn transfer(
    &self,
    ctx: &Context,
    method: &str,
    src_fs: &str,
    src_remote: &str,
    dst_fs: &str,
    dst_remote: &str,
  ) -> Result<(), RcError> {
    let params = params(vec![
      ("srcFs", src_fs),
      ("srcRemote", src_remote),
      ("dstFs", dst_fs),
      ("dstRemote", dst_remote),
    ]);

    self
      .call(ctx, method, params)
      .await
      .map(drop)
      .map_err(RcError::classify)
  }

  /// Remove `remote` under `fs` and everything below it.
  #[instrument(level = "debug", skip(self, ctx))]
  pub async fn purge(&self, ctx: &Context, fs: &str, remote: &str) -> Result<(), RcError> {
    self
      .call(ctx, "operations/purge", params(vec![("fs", fs), ("remote", remote)]))
      .await
      .map(drop)
  }

  /// Mount `fs` at `mount_point`. Empty options are left out of the call so
  /// the server falls back to its own defaults.
  #[instrument(level = "debug", skip(self, ctx))]
  pub async fn mount(
    &self,
    ctx: &Context,
    fs: &str,
    mount_point: &str,
    options: &MountOptions,
  ) -> Result<(), RcError> {
    let mut in_params = params(vec![("fs", fs), ("mountPoint", mount_point)]);
    let fields = [
      ("mountType", options.mount_type()),
      ("mountOpt", options.mount_opt()),
      ("vfsOpt", options.vfs_opt()),
    ];
    for (key, value) in fields.iter() {
      if !value.is_empty() {
        in_params.insert((*key).to_owned(), Value::String((*value).to_owned()));
      }
    }

    self.call(ctx, "mount/mount", in_params).await.map(drop)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Mutex;
  use test_case::test_case;

  /// Replies to every call with a fixed result and remembers what it saw.
  struct Canned {
    reply: Mutex<Option<Result<Params, RcError>>>,
    seen: Mutex<Vec<(String, Params)>>,
  }

  impl Canned {
    fn new(reply: Result<Params, RcError>) -> Self {
      Canned {
        reply: Mutex::new(Some(reply)),
        seen: Mutex::new(Vec::new()),
      }
    }
  }

  #[async_trait]
  impl Transport for Canned {
    async fn call(&self, method: &str, params: Params) -> Result<Params, RcError> {
      self.seen.lock().unwrap().push((method.to_owned(), params));
      self.reply.lock().unwrap().take().unwrap_or_else(|| Ok(Params::new()))
    }
  }

  fn failed(message: &str) -> RcError {
    RcError::Failed {
      method: "operations/copyfile".into(),
      message: message.into(),
    }
  }

  #[test_case("failed to copy: object not found", true, false)]
  #[test_case("didn't find section in config file", false, true)]
  #[test_case("object not found in the middle of something", false, false)]
  fn failure_suffixes(message: &str, not_found: bool, remote_not_found: bool) {
    let err = failed(message).classify();
    assert_eq!(matches!(err, RcError::NotFound), not_found);
    assert_eq!(matches!(err, RcError::RemoteNotFound), remote_not_found);
  }

  #[test]
  fn failed_message_reads_error_field() {
    let response = json!({ "error": "boom", "status": 500 });
    let err = RcError::failed("operations/purge", response.as_object().unwrap());
    assert_eq!(err.to_string(), r#"operation "operations/purge" failed: boom"#);

    let err = RcError::failed("operations/purge", &Params::new());
    assert_eq!(err.to_string(), r#"operation "operations/purge" failed: <nil>"#);
  }

  #[tokio::test]
  async fn copy_maps_not_found() {
    let rc = RemoteControl::new(Canned::new(Err(failed("object not found"))));
    let err = rc
      .copy_file(&Context::background(), "r:", "a", "/tmp", "b")
      .await
      .unwrap_err();
    assert!(matches!(err, RcError::NotFound));
  }

  #[tokio::test]
  async fn purge_does_not_classify() {
    let rc = RemoteControl::new(Canned::new(Err(failed("object not found"))));
    let err = rc.purge(&Context::background(), "r:", "a").await.unwrap_err();
    assert!(matches!(err, RcError::Failed { .. }));
  }

  #[tokio::test]
  async fn stat_reads_item() {
    let reply = json!({ "item": { "Path": "id/.csi-metadata" } });
    let rc = RemoteControl::new(Canned::new(Ok(reply.as_object().unwrap().clone())));
    let item = rc.stat(&Context::background(), "r:", "id/.csi-metadata").await.unwrap();
    assert!(item.is_some());

    let (method, params) = rc.transport().seen.lock().unwrap().remove(0);
    assert_eq!(method, "operations/stat");
    assert_eq!(params["opt"], json!(STAT_OPTIONS));

    let reply = json!({ "item": null });
    let rc = RemoteControl::new(Canned::new(Ok(reply.as_object().unwrap().clone())));
    assert!(rc.stat(&Context::background(), "r:", "x").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn mount_omits_empty_options() {
    let rc = RemoteControl::new(Canned::new(Ok(Params::new())));
    let options = MountOptions::new("mount2", "", r#"{"CacheMode":"full"}"#);
    rc.mount(&Context::background(), "r:id", "/mnt/target", &options)
      .await
      .unwrap();

    let (method, params) = rc.transport().seen.lock().unwrap().remove(0);
    assert_eq!(method, "mount/mount");
    assert_eq!(params["fs"], json!("r:id"));
    assert_eq!(params["mountPoint"], json!("/mnt/target"));
    assert_eq!(params["mountType"], json!("mount2"));
    assert!(!params.contains_key("mountOpt"));
    assert_eq!(params["vfsOpt"], json!(r#"{"CacheMode":"full"}"#));
  }

  #[tokio::test]
  async fn cancelled_context_skips_call() {
    let rc = RemoteControl::new(Canned::new(Ok(Params::new())));
    let ctx = Context::background();
    ctx.cancel();

    let err = rc.purge(&ctx, "r:", "a").await.unwrap_err();
    assert!(matches!(err, RcError::Interrupted(Interrupted::Cancelled)));
    assert!(rc.transport().seen.lock().unwrap().is_empty());
  }
}
