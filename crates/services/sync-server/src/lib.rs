//! cosync sync server
//!
//! Wires a coordinator to the WebSocket transport and exposes a read-only
//! HTTP inspection API next to it.

pub mod api;
pub mod config;

pub use api::{build_router, AppState};
pub use config::{Config, ConfigError, ServerConfig};
