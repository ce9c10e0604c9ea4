//! Configuration for the sync server
//!
//! Loaded from a TOML file and/or `COSYNC_*` environment variables. The
//! coordination tuning lives under `[coordination.*]` tables.

use cosync_core::CoordinationConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listener addresses and catalog location
    #[serde(default)]
    pub server: ServerConfig,

    /// Sync protocol tuning
    #[serde(default)]
    pub coordination: CoordinationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind both listeners to
    #[serde(default = "default_host")]
    pub host: String,

    /// WebSocket port
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// HTTP inspection API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// JSON track catalog served by the built-in resolver
    #[serde(default)]
    pub catalog: Option<PathBuf>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_ws_port() -> u16 {
    8787
}

fn default_http_port() -> u16 {
    8788
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ws_port: default_ws_port(),
            http_port: default_http_port(),
            catalog: None,
        }
    }
}

impl ServerConfig {
    pub fn ws_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.host, self.ws_port)
    }

    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_addr(&self.host, self.http_port)
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, ConfigError> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("bad listen address {}:{}: {}", host, port, e)))
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Override fields from `COSYNC_*` environment variables
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("COSYNC_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_parse("COSYNC_WS_PORT") {
            self.server.ws_port = port;
        }
        if let Some(port) = env_parse("COSYNC_HTTP_PORT") {
            self.server.http_port = port;
        }
        if let Ok(path) = std::env::var("COSYNC_CATALOG") {
            self.server.catalog = Some(PathBuf::from(path));
        }

        let coordination = &mut self.coordination;
        if let Some(ms) = env_parse("COSYNC_ROLE_GRACE_MS") {
            coordination.lifecycle.role_grace_ms = ms;
        }
        if let Some(ms) = env_parse("COSYNC_ROOM_DELETION_GRACE_MS") {
            coordination.lifecycle.room_deletion_grace_ms = ms;
        }
        if let Some(ms) = env_parse("COSYNC_VOTE_TIMEOUT_MS") {
            coordination.voting.vote_timeout_ms = ms;
        }
        if let Some(ms) = env_parse("COSYNC_MIN_MARGIN_MS") {
            coordination.scheduling.min_margin_ms = ms;
        }
    }

    /// Load from `path` when it exists, otherwise start from defaults;
    /// environment overrides apply either way
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) if p.as_ref().exists() => Self::from_file(p)?,
            _ => Config::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.ws_addr()?;
        self.server.http_addr()?;
        if self.server.ws_port != 0 && self.server.ws_port == self.server.http_port {
            return Err(ConfigError::Invalid(format!(
                "ws_port and http_port are both {}",
                self.server.ws_port
            )));
        }
        self.coordination
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|value| value.parse().ok())
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
