//! Daemon error types.

use jet_core::JetError;

use crate::frame::MAX_FRAME_LEN;

/// Errors raised by the listeners and connection tasks.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// An I/O error on a socket or the config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// WebSocket handshake or protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// A length-prefixed frame announced more than the allowed size.
    #[error("Frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_LEN)]
    FrameTooLarge(usize),

    /// The broker rejected the command, usually because it stopped.
    #[error("Broker error: {0}")]
    Broker(#[from] JetError),
}

impl From<tokio_tungstenite::tungstenite::Error> for DaemonError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(e.to_string())
    }
}
