//! Gateway configuration, loaded from TOML.
//!
//! Every field is optional in the file; missing fields take the defaults
//! below.
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 8931
//! base_path = "/mcp"
//! session_header = "mcp-session-id"
//! session_timeout_secs = 1800
//! max_request_bytes = 8388608
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors raised while loading or validating a [`GatewayConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    3000
}

fn default_base_path() -> String {
    "/mcp".into()
}

fn default_session_header() -> String {
    "mcp-session-id".into()
}

fn default_session_timeout_secs() -> u64 {
    30 * 60
}

fn default_max_request_bytes() -> usize {
    8 * 1024 * 1024
}

/// Settings for one gateway listener.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct GatewayConfig {
    /// Interface to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// TCP port; `0` picks a free one.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Requests must target this path or one below it.
    #[serde(default = "default_base_path")]
    pub base_path: String,
    /// Header carrying the session token.
    #[serde(default = "default_session_header")]
    pub session_header: String,
    /// Idle time after which a session is evicted.
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// Largest incomplete request a connection may buffer.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_base_path(),
            session_header: default_session_header(),
            session_timeout_secs: default_session_timeout_secs(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

impl GatewayConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML or unknown keys,
    /// [`ConfigError::Invalid`] when a value fails [`validate`](Self::validate).
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Checks values that deserialize fine but cannot work.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.base_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "base_path must start with '/': {:?}",
                self.base_path
            )));
        }
        if self.session_header.trim().is_empty()
            || !self
                .session_header
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ConfigError::Invalid(format!(
                "session_header is not a valid header name: {:?}",
                self.session_header
            )));
        }
        if self.session_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "session_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.max_request_bytes == 0 {
            return Err(ConfigError::Invalid(
                "max_request_bytes must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// `host:port`, as passed to the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }
}
