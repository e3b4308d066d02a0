//! Runtime configuration.
//!
//! Transport limits come from environment variables, host settings from
//! the command line. Both have defaults that work without any setup.

use std::str::FromStr;
use std::time::Duration;

use crate::protocol::VersionPolicy;
use crate::transport::{
    DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_STDIO_BUFFER_SIZE,
};

/// Default grace period for in-flight handlers once the session ends.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server name reported in `initialize` and `version` responses.
pub const DEFAULT_SERVER_NAME: &str = env!("CARGO_PKG_NAME");

/// Frame size limits and buffer sizing for a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportConfig {
    /// Maximum frame body size in bytes.
    pub max_message_size: usize,
    /// Maximum header block size in bytes.
    pub max_header_size: usize,
    /// Read/write buffer size in bytes.
    pub buffer_size: usize,
}

impl TransportConfig {
    /// Loads configuration from environment variables with defaults.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TOOLHOST_MAX_MESSAGE_SIZE` | 10 MiB |
    /// | `TOOLHOST_MAX_HEADER_SIZE` | 8 KiB |
    /// | `TOOLHOST_STDIO_BUFFER_SIZE` | 64 KiB |
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            max_message_size: env_or("TOOLHOST_MAX_MESSAGE_SIZE", DEFAULT_MAX_MESSAGE_SIZE),
            max_header_size: env_or("TOOLHOST_MAX_HEADER_SIZE", DEFAULT_MAX_HEADER_SIZE),
            buffer_size: env_or("TOOLHOST_STDIO_BUFFER_SIZE", DEFAULT_STDIO_BUFFER_SIZE),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            buffer_size: DEFAULT_STDIO_BUFFER_SIZE,
        }
    }
}

/// Settings for one protocol host session.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Name reported to the client.
    pub server_name: String,
    /// Version reported to the client.
    pub server_version: String,
    /// Timeout for requests the host sends to the client. `None` waits
    /// indefinitely.
    pub request_timeout: Option<Duration>,
    /// How long to wait for in-flight handlers after the session ends.
    pub drain_timeout: Duration,
    /// How strictly incoming `jsonrpc` members are checked.
    pub version_policy: VersionPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            request_timeout: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            version_policy: VersionPolicy::default(),
        }
    }
}

/// Reads an environment variable, parsing it to type `T`, or returns the default.
///
/// Logs a warning if the variable is set but cannot be parsed.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(name, value = %v, "invalid env var value, using default");
            default
        }),
        Err(_) => default,
    }
}
