//! Error types for the WebSocket transport

use thiserror::Error;

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// WebSocket handshake or framing failure
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Socket bind or accept failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Coordinator rejected or could not take the request
    #[error("Coordinator error: {0}")]
    Core(#[from] cosync_core::Error),

    /// Server startup did not report back
    #[error("Server failed to start: {0}")]
    Startup(String),

    /// Background session task panicked or was cancelled
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The peer or the local session went away
    #[error("Connection closed")]
    ConnectionClosed,
}
