use anyhow::Context as _;
use clap::Parser;
use csi_mount_utils::{DefaultMounter, Mounter};
use csi_rclone::{rc::HttpTransport, serve, DriverOptions, Endpoint, RcloneDriver};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let options = DriverOptions::parse();
  if options.node_id.is_empty() {
    warn!("--node-id is not set");
  }
  options.validate()?;
  info!(?options, "Starting csi-rclone");

  let endpoint: Endpoint = options.endpoint.parse()?;
  let work_dir = options.work_dir();
  tokio::fs::create_dir_all(&work_dir)
    .await
    .with_context(|| format!("creating work directory {}", work_dir.display()))?;

  let transport = HttpTransport::new(
    options.address.clone(),
    &options.username,
    &options.password,
  )?;
  let mounter = DefaultMounter::new("").await?;

  let shutdown = CancellationToken::new();
  let driver = RcloneDriver::new(&options, transport, mounter, shutdown.clone())?;

  tokio::spawn({
    let shutdown = shutdown.clone();
    async move {
      shutdown_signal().await;
      info!("Shutting down");
      shutdown.cancel();
    }
  });

  serve(Arc::new(driver), &endpoint, shutdown).await?;
  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(e) = signal::ctrl_c().await {
      warn!(error = %e, "Failed to listen for Ctrl+C");
      futures::future::pending::<()>().await;
    }
  };

  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut sigterm) => {
        sigterm.recv().await;
      }
      Err(e) => {
        warn!(error = %e, "Failed to listen for SIGTERM");
        futures::future::pending::<()>().await;
      }
    }
  };

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }
}
