//! Daemon configuration: listener addresses, logging and the broker settings.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use jet_core::BrokerConfig;
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;

/// Default port of the length-prefixed TCP listener.
pub const DEFAULT_TCP_PORT: u16 = 11122;
/// Default port of the WebSocket listener.
pub const DEFAULT_WS_PORT: u16 = 11123;

/// Everything `jetd` reads from its config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Raw TCP listener; `None` disables it.
    pub tcp_addr: Option<SocketAddr>,

    /// WebSocket listener; `None` disables it.
    pub ws_addr: Option<SocketAddr>,

    /// Directory for daily-rotated log files. Console only when unset.
    pub log_dir: Option<PathBuf>,

    /// `tracing` filter directive, overridden by `RUST_LOG`.
    pub log_filter: String,

    pub broker: BrokerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            tcp_addr: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_TCP_PORT))),
            ws_addr: Some(SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_WS_PORT))),
            log_dir: None,
            log_filter: "info,jet_core=debug,jet_daemon=debug".to_string(),
            broker: BrokerConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), DaemonError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file, or return defaults if the file is
    /// missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_json::from_str::<DaemonConfig>(&data) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Corrupt config file, using defaults: {e}");
                    }
                },
                Err(e) => {
                    tracing::warn!("Cannot read config file, using defaults: {e}");
                }
            }
        }
        Self::default()
    }
}
