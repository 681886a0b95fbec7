//! Service configuration.
//!
//! Loaded from an optional YAML file. Every key has a default, so an empty
//! file (or none at all) yields a working configuration:
//!
//! ```yaml
//! server:
//!   bind: 0.0.0.0:5007
//!   log_level: info
//! session:
//!   discovery_timeout_ms: 5000
//!   connect_timeout_ms: 5000
//!   read_timeout_ms: 5000
//!   write_retry_limit: 5
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Deserializer};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 5007)),
            log_level: "info".to_string(),
        }
    }
}

/// Timers and limits applied to every fetch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Total time to look for the peripheral.
    #[serde(rename = "discovery_timeout_ms", deserialize_with = "millis")]
    pub discovery_timeout: Duration,
    /// How often the peripheral registry is checked while discovering.
    #[serde(rename = "discovery_poll_interval_ms", deserialize_with = "millis")]
    pub discovery_poll_interval: Duration,
    #[serde(rename = "connect_timeout_ms", deserialize_with = "millis")]
    pub connect_timeout: Duration,
    #[serde(rename = "resolve_timeout_ms", deserialize_with = "millis")]
    pub resolve_timeout: Duration,
    #[serde(rename = "subscribe_timeout_ms", deserialize_with = "millis")]
    pub subscribe_timeout: Duration,
    /// Silence allowed while a response is awaited. Restarted by every
    /// notification.
    #[serde(rename = "read_timeout_ms", deserialize_with = "millis")]
    pub read_timeout: Duration,
    #[serde(rename = "disconnect_timeout_ms", deserialize_with = "millis")]
    pub disconnect_timeout: Duration,
    /// Write attempts per request while the link reports busy.
    pub write_retry_limit: u32,
    #[serde(rename = "write_retry_backoff_ms", deserialize_with = "millis")]
    pub write_retry_backoff: Duration,
    /// Pause between enabling notifications and the first request. Some
    /// modules drop writes that arrive too early.
    #[serde(rename = "subscribe_settle_ms", deserialize_with = "millis")]
    pub subscribe_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_secs(5),
            discovery_poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            resolve_timeout: Duration::from_secs(5),
            subscribe_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(5),
            write_retry_limit: 5,
            write_retry_backoff: Duration::from_millis(100),
            subscribe_settle: Duration::ZERO,
        }
    }
}

fn millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(Config::from_yaml("").unwrap(), Config::default());
        assert_eq!(Config::from_yaml("  \n").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            "server:\n  bind: 127.0.0.1:8080\n\
             session:\n  read_timeout_ms: 2500\n  write_retry_limit: 3\n",
        )
        .unwrap();
        assert_eq!(config.server.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.session.read_timeout, Duration::from_millis(2500));
        assert_eq!(config.session.write_retry_limit, 3);
        assert_eq!(config.session.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(Config::from_yaml("session:\n  read_timeout: 5\n").is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = Config::load(Path::new("/nonexistent/blemetry.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/blemetry.yaml"));
    }
}
