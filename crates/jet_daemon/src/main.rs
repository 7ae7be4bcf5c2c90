//! `jetd`, the jet broker daemon.

mod config;
mod error;
mod frame;
mod logging;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use jet_core::FetchMode;
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::config::DaemonConfig;
use crate::transport::Protocol;

#[derive(Debug, Parser)]
#[command(name = "jetd", version, about = "Jet publish/subscribe broker")]
struct Cli {
    /// JSON config file. Missing files fall back to defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address of the length-prefixed TCP listener.
    #[arg(long)]
    tcp: Option<SocketAddr>,

    /// Address of the WebSocket listener.
    #[arg(long)]
    ws: Option<SocketAddr>,

    /// Disable the TCP listener.
    #[arg(long, conflicts_with = "tcp")]
    no_tcp: bool,

    /// Disable the WebSocket listener.
    #[arg(long, conflicts_with = "ws")]
    no_ws: bool,

    /// Broker name reported by `info`.
    #[arg(long)]
    name: Option<String>,

    /// Routed call/set timeout in milliseconds.
    #[arg(long)]
    route_timeout_ms: Option<u64>,

    /// Serve only the unsorted `fetch_all` fetch.
    #[arg(long)]
    simple_fetch: bool,

    /// `tracing` filter directive (RUST_LOG wins when set).
    #[arg(long)]
    log_filter: Option<String>,

    /// Write daily-rotated log files to this directory.
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Write the effective configuration back to `--config` and continue.
    #[arg(long, requires = "config")]
    save_config: bool,
}

impl Cli {
    /// Layer command-line flags over the file configuration.
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(addr) = self.tcp {
            config.tcp_addr = Some(addr);
        }
        if let Some(addr) = self.ws {
            config.ws_addr = Some(addr);
        }
        if self.no_tcp {
            config.tcp_addr = None;
        }
        if self.no_ws {
            config.ws_addr = None;
        }
        if let Some(name) = &self.name {
            config.broker.name = name.clone();
        }
        if let Some(ms) = self.route_timeout_ms {
            config.broker.route_timeout = Duration::from_millis(ms);
        }
        if self.simple_fetch {
            config.broker.fetch = FetchMode::Simple;
        }
        if let Some(filter) = &self.log_filter {
            config.log_filter = filter.clone();
        }
        if let Some(dir) = &self.log_dir {
            config.log_dir = Some(dir.clone());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => DaemonConfig::load_or_default(path),
        None => DaemonConfig::default(),
    };
    cli.apply(&mut config);

    let _guard = logging::init_logging(&config.log_filter, config.log_dir.as_deref())?;

    if cli.save_config {
        if let Some(path) = &cli.config {
            config
                .save_to_file(path)
                .with_context(|| format!("Failed to save config to {}", path.display()))?;
            info!("Saved configuration to {}", path.display());
        }
    }

    run(config).await
}

/// Start the broker and its listeners, then wait for Ctrl-C.
async fn run(config: DaemonConfig) -> Result<()> {
    let listeners: Vec<(SocketAddr, Protocol)> = [
        config.tcp_addr.map(|addr| (addr, Protocol::Tcp)),
        config.ws_addr.map(|addr| (addr, Protocol::WebSocket)),
    ]
    .into_iter()
    .flatten()
    .collect();
    if listeners.is_empty() {
        bail!("No listener configured: enable TCP and/or WebSocket");
    }

    let (broker, broker_task) = jet_core::service::spawn(config.broker.clone());
    let (shutdown_tx, _) = broadcast::channel(8);

    let mut servers = Vec::new();
    for (addr, protocol) in listeners {
        let broker = broker.clone();
        let shutdown = shutdown_tx.subscribe();
        servers.push(tokio::spawn(async move {
            if let Err(e) = transport::serve(addr, protocol, broker, shutdown).await {
                error!("{protocol:?} listener on {addr} failed: {e}");
            }
        }));
    }

    info!("jetd {} running", env!("CARGO_PKG_VERSION"));
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");

    let _ = shutdown_tx.send(());
    for server in servers {
        let _ = server.await;
    }
    // The broker may already be gone if every handle was dropped.
    let _ = broker.shutdown().await;
    broker_task.await.context("Broker task panicked")?;
    Ok(())
}
