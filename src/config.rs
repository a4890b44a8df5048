//! Server configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors reported by [`ServerConfig::validate`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid host: host cannot be empty")]
    EmptyHost,

    #[error("invalid server_name: must be a non-empty single-line value")]
    InvalidServerName,

    #[error("invalid {field}: must be greater than 0")]
    Zero { field: &'static str },
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening address
    /// Env: PORTICO_HOST
    /// Default: "0.0.0.0" (all interfaces)
    pub host: String,

    /// Listening port; 0 picks an ephemeral port
    /// Env: PORTICO_PORT
    /// Default: 8080
    pub port: u16,

    /// Name to advertise the service under
    /// Env: PORTICO_ADVERTISE_NAME
    /// Default: None (no advertisement). An empty name is derived from the host.
    pub advertise_name: Option<String>,

    /// Value of the `Server` response header
    /// Env: PORTICO_SERVER_NAME
    /// Default: "Portico"
    pub server_name: String,

    /// Largest accepted request head in bytes
    /// Env: PORTICO_MAX_HEAD_SIZE
    /// Default: 65536
    pub max_head_size: usize,

    /// Largest accepted declared Content-Length
    /// Env: PORTICO_MAX_BODY_SIZE
    /// Default: None (unlimited)
    pub max_body_size: Option<u64>,

    /// Answer `Expect: 100-continue` before reading the body
    /// Env: PORTICO_SEND_CONTINUE
    /// Default: true
    pub send_continue: bool,

    /// Chunk size for socket and response-body transfers
    /// Default: 32768
    pub io_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            advertise_name: None,
            server_name: "Portico".to_string(),
            max_head_size: 64 * 1024,
            max_body_size: None,
            send_continue: true,
            io_buffer_size: 32 * 1024,
        }
    }
}

impl ServerConfig {
    /// Returns the `host:port` string to bind.
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Apply environment variables
    pub fn apply_env_vars(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("PORTICO_HOST") {
            self.host = host;
        }

        if let Some(port) = lookup("PORTICO_PORT") {
            match port.parse() {
                Ok(p) => self.port = p,
                Err(_) => warn!(value = %port, "ignoring invalid PORTICO_PORT"),
            }
        }

        if let Some(name) = lookup("PORTICO_ADVERTISE_NAME") {
            self.advertise_name = Some(name);
        }

        if let Some(name) = lookup("PORTICO_SERVER_NAME") {
            self.server_name = name;
        }

        if let Some(size) = lookup("PORTICO_MAX_HEAD_SIZE") {
            match size.parse() {
                Ok(s) => self.max_head_size = s,
                Err(_) => warn!(value = %size, "ignoring invalid PORTICO_MAX_HEAD_SIZE"),
            }
        }

        if let Some(size) = lookup("PORTICO_MAX_BODY_SIZE") {
            match size.parse() {
                Ok(s) => self.max_body_size = Some(s),
                Err(_) => warn!(value = %size, "ignoring invalid PORTICO_MAX_BODY_SIZE"),
            }
        }

        if let Some(flag) = lookup("PORTICO_SEND_CONTINUE") {
            match parse_flag(&flag) {
                Some(f) => self.send_continue = f,
                None => warn!(value = %flag, "ignoring invalid PORTICO_SEND_CONTINUE"),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }

        if self.server_name.is_empty() || self.server_name.contains(['\r', '\n']) {
            return Err(ConfigError::InvalidServerName);
        }

        if self.max_head_size == 0 {
            return Err(ConfigError::Zero {
                field: "max_head_size",
            });
        }

        if self.io_buffer_size == 0 {
            return Err(ConfigError::Zero {
                field: "io_buffer_size",
            });
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
