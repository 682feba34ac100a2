//! streamfork Relay Server
//!
//! Accepts inbound streams and mirrors them to the storage and media servers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use streamfork_core::Config;
use streamfork_core::tracing_init::{crate_filter, init_tracing};
use streamfork_relay::Relay;

#[derive(Parser, Debug)]
#[command(name = "streamfork-relay")]
#[command(
    version,
    about = "streamfork relay server - mirrors inbound streams to storage and media"
)]
struct Args {
    /// Path to the TOML config file. Defaults to ./config.toml, then the
    /// global config directory.
    #[arg(long, env = "STREAMFORK_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the relay (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "STREAMFORK_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "STREAMFORK_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_tracing(&crate_filter("streamfork_relay", &args.log_level), args.log_json)?;

    let (config, config_path) = Config::resolve(args.config.as_deref())?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        listen = %config.listen(),
        storage = %config.storage(),
        media = %config.media(),
        "Starting streamfork-relay"
    );

    let relay = Relay::bind(Arc::new(config)).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let serve_handle = tokio::spawn(relay.serve(shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the relay is accepting connections (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    serve_handle.await?;

    info!("Relay stopped");
    Ok(())
}
