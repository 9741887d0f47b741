//! Configuration loading and management.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server information.
    pub server: ServerConfig,
    /// WebSocket relay listen configuration.
    pub listen: ListenConfig,
    /// HTTP API listen configuration.
    pub http: HttpConfig,
    /// Database configuration.
    pub database: Option<DatabaseConfig>,
    /// Authentication configuration.
    pub auth: AuthConfig,
}

/// Server identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name (e.g., "chat.example.net").
    pub name: String,
}

/// WebSocket listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Address to bind the relay to (e.g., "0.0.0.0:8800").
    pub address: SocketAddr,
}

/// HTTP API listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Address to bind the REST API to (e.g., "0.0.0.0:8801").
    pub address: SocketAddr,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file.
    pub path: String,
}

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Secret used to sign access tokens.
    pub token_secret: String,
    /// Access token lifetime in minutes.
    #[serde(default = "default_access_ttl_minutes")]
    pub access_ttl_minutes: i64,
    /// Refresh token (session) lifetime in days.
    #[serde(default = "default_refresh_ttl_days")]
    pub refresh_ttl_days: i64,
}

fn default_access_ttl_minutes() -> i64 {
    15
}

fn default_refresh_ttl_days() -> i64 {
    30
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
