//! Server configuration module
//! Handles dynamic configuration parameters for the chat server

use crate::constants::{
    DEFAULT_CHANNEL, DEFAULT_HISTORY_CAPACITY, DEFAULT_HISTORY_REPLAY, DEFAULT_HOST,
    DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_LINE_LENGTH, DEFAULT_PORT, DEFAULT_WRITE_TIMEOUT_MS,
};
use crate::error::{ChatwireError, Result};
use std::env;
use std::time::Duration;

/// Server configuration parameters
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Inactivity window after which a connection is closed
    pub idle_timeout: Duration,
    /// How long a dispatch waits for one recipient's write before closing it
    pub write_timeout: Duration,
    /// Longest accepted inbound line, in bytes
    pub max_line_length: usize,
    /// Number of rendered messages kept in memory
    pub history_capacity: usize,
    /// Number of history lines replayed to a freshly connected participant
    pub history_replay: usize,
    /// Channel every participant is bound to on login
    pub default_channel: String,
    /// Optional file the history is dumped to on shutdown
    pub history_dump_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            write_timeout: Duration::from_millis(DEFAULT_WRITE_TIMEOUT_MS),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            history_replay: DEFAULT_HISTORY_REPLAY,
            default_channel: DEFAULT_CHANNEL.to_string(),
            history_dump_path: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ChatwireError::ConfigError(format!("{} has an invalid value: {}", name, raw))),
        Err(_) => Ok(None),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables if available
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let host = env::var("CHATWIRE_HOST").unwrap_or(defaults.host);
        let port = parse_var("CHATWIRE_PORT")?.unwrap_or(defaults.port);

        let idle_timeout = parse_var::<u64>("CHATWIRE_IDLE_TIMEOUT")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.idle_timeout);
        let write_timeout = parse_var::<u64>("CHATWIRE_WRITE_TIMEOUT_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.write_timeout);

        let max_line_length =
            parse_var("CHATWIRE_MAX_LINE_LENGTH")?.unwrap_or(defaults.max_line_length);
        let history_capacity =
            parse_var("CHATWIRE_HISTORY_CAPACITY")?.unwrap_or(defaults.history_capacity);
        let history_replay =
            parse_var("CHATWIRE_HISTORY_REPLAY")?.unwrap_or(defaults.history_replay);

        let default_channel =
            env::var("CHATWIRE_DEFAULT_CHANNEL").unwrap_or(defaults.default_channel);
        let history_dump_path = env::var("CHATWIRE_HISTORY_DUMP").ok();

        let config = Self {
            host,
            port,
            idle_timeout,
            write_timeout,
            max_line_length,
            history_capacity,
            history_replay,
            default_channel,
            history_dump_path,
        };
        config.validate()?;

        Ok(config)
    }

    /// Reject settings the server cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero() {
            return Err(ChatwireError::ConfigError(
                "CHATWIRE_IDLE_TIMEOUT must be at least one second".to_string(),
            ));
        }
        if self.write_timeout.is_zero() {
            return Err(ChatwireError::ConfigError(
                "CHATWIRE_WRITE_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }
        if self.max_line_length == 0 {
            return Err(ChatwireError::ConfigError(
                "CHATWIRE_MAX_LINE_LENGTH must be greater than zero".to_string(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(ChatwireError::ConfigError(
                "CHATWIRE_HISTORY_CAPACITY must be greater than zero".to_string(),
            ));
        }
        if self.default_channel.trim().is_empty() {
            return Err(ChatwireError::ConfigError(
                "CHATWIRE_DEFAULT_CHANNEL must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Address the accept loop binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
