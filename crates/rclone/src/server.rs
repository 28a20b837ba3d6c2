use csi_proto::{Controller, ControllerService, Identity, Node, NodeService};
use futures::TryStreamExt;
use std::{
  fmt, io,
  net::SocketAddr,
  path::{Path, PathBuf},
  pin::Pin,
  str::FromStr,
  sync::Arc,
  task::{Context, Poll},
};
use thiserror::Error;
use tokio::{
  io::{AsyncRead, AsyncWrite, ReadBuf},
  net::UnixListener,
};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{server::Connected, Server};
use tracing::{info, warn};

const UNIX_SCHEME: &str = "unix://";
const TCP_SCHEME: &str = "tcp://";

#[derive(Debug, Error)]
pub enum EndpointError {
  #[error("unsupported endpoint scheme in {0:?}, expected unix:// or tcp://")]
  UnsupportedScheme(String),
  #[error("endpoint {0:?} has no path")]
  EmptyPath(String),
  #[error("invalid tcp endpoint {0:?}: {1}")]
  InvalidAddress(String, std::net::AddrParseError),
}

#[derive(Debug, Error)]
pub enum ServeError {
  #[error("failed to bind {0}: {1}")]
  Bind(String, #[source] io::Error),
  #[error(transparent)]
  Transport(#[from] tonic::transport::Error),
}

/// Where the CSI services listen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
  Unix(PathBuf),
  Tcp(SocketAddr),
}

impl FromStr for Endpoint {
  type Err = EndpointError;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    if let Some(path) = value.strip_prefix(UNIX_SCHEME) {
      if path.is_empty() {
        return Err(EndpointError::EmptyPath(value.to_owned()));
      }

      return Ok(Endpoint::Unix(PathBuf::from(path)));
    }

    if let Some(addr) = value.strip_prefix(TCP_SCHEME) {
      return addr
        .parse()
        .map(Endpoint::Tcp)
        .map_err(|e| EndpointError::InvalidAddress(value.to_owned(), e));
    }

    Err(EndpointError::UnsupportedScheme(value.to_owned()))
  }
}

impl fmt::Display for Endpoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Endpoint::Unix(path) => write!(f, "{}{}", UNIX_SCHEME, path.display()),
      Endpoint::Tcp(addr) => write!(f, "{}{}", TCP_SCHEME, addr),
    }
  }
}

/// A unix socket connection that tonic can serve.
#[derive(Debug)]
pub struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
  fn remote_addr(&self) -> Option<SocketAddr> {
    None
  }
}

impl AsyncRead for UnixStream {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut self.0).poll_read(cx, buf)
  }
}

impl AsyncWrite for UnixStream {
  fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut self.0).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.0).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut self.0).poll_shutdown(cx)
  }
}

/// Bind a unix socket at `path`, replacing a socket left behind by a
/// previous run.
pub fn bind_unix(path: &Path) -> io::Result<UnixListener> {
  match std::fs::remove_file(path) {
    Ok(()) => warn!(path = %path.display(), "Removed stale socket"),
    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
    Err(e) => return Err(e),
  }

  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }

  UnixListener::bind(path)
}

/// Serve the identity, controller and node services of `driver` on
/// `endpoint` until `shutdown` is cancelled.
pub async fn serve<D>(
  driver: Arc<D>,
  endpoint: &Endpoint,
  shutdown: CancellationToken,
) -> Result<(), ServeError>
where
  D: ControllerService + NodeService,
{
  let router = Server::builder()
    .add_service(Identity::new(driver.clone()).with_controller_service().into_server())
    .add_service(Controller::new(driver.clone()).into_server())
    .add_service(Node::new(driver).into_server());

  info!(%endpoint, "Serving CSI");
  match endpoint {
    Endpoint::Unix(path) => {
      let listener = bind_unix(path).map_err(|e| ServeError::Bind(endpoint.to_string(), e))?;
      let incoming = UnixListenerStream::new(listener).map_ok(UnixStream);
      let result = router
        .serve_with_incoming_shutdown(incoming, shutdown.cancelled())
        .await;

      if let Err(e) = std::fs::remove_file(path) {
        warn!(error = %e, "Failed to remove socket");
      }
      result?;
    }
    Endpoint::Tcp(addr) => {
      router.serve_with_shutdown(*addr, shutdown.cancelled()).await?;
    }
  }

  info!("CSI server stopped");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use test_case::test_case;

  #[test_case("unix:///tmp/csi.sock", Endpoint::Unix("/tmp/csi.sock".into()) ; "unix")]
  #[test_case("tcp://127.0.0.1:10000", Endpoint::Tcp(([127, 0, 0, 1], 10000).into()) ; "tcp")]
  fn parses_endpoints(value: &str, expected: Endpoint) {
    let endpoint: Endpoint = value.parse().unwrap();
    assert_eq!(endpoint, expected);
    assert_eq!(endpoint.to_string(), value);
  }

  #[test_case("/tmp/csi.sock" ; "bare path")]
  #[test_case("http://localhost" ; "other scheme")]
  #[test_case("unix://" ; "empty path")]
  #[test_case("tcp://localhost" ; "missing port")]
  fn rejects_endpoints(value: &str) {
    assert!(value.parse::<Endpoint>().is_err());
  }

  #[tokio::test]
  async fn bind_replaces_stale_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plugins/csi.sock");

    let first = bind_unix(&path).unwrap();
    drop(first);
    assert!(path.exists());

    let _second = bind_unix(&path).unwrap();
  }

  #[tokio::test]
  async fn serve_stops_on_shutdown() {
    use crate::{config::DriverOptions, driver::RcloneDriver, rc::FakeRemoteControl};
    use csi_mount_utils::FakeMounter;

    let dir = tempfile::tempdir().unwrap();
    let options = DriverOptions {
      node_id: "node-1".into(),
      remote: "r:".into(),
      work_dir: Some(dir.path().to_owned()),
      ..Default::default()
    };
    let shutdown = CancellationToken::new();
    let driver = RcloneDriver::new(
      &options,
      FakeRemoteControl::new(vec!["r"]),
      FakeMounter::with_mount_points(None),
      shutdown.clone(),
    )
    .unwrap();

    let path = dir.path().join("csi.sock");
    let endpoint = Endpoint::Unix(path.clone());
    let server = tokio::spawn({
      let shutdown = shutdown.clone();
      async move { serve(Arc::new(driver), &endpoint, shutdown).await }
    });

    while !path.exists() {
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    tokio::net::UnixStream::connect(&path).await.unwrap();

    shutdown.cancel();
    server.await.unwrap().unwrap();
    assert!(!path.exists());
  }
}
