//! Runtime configuration and logging setup.
//!
//! Settings that the hub integrations historically read from process-wide
//! state (the compatibility override, verbose logging) live here and are
//! handed explicitly to every component that needs them.

use crate::error::{BroadlinkError, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use tokio::time::Duration;

/// Operator debug switches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    /// Treat every discovered model as compatible with the expected one
    pub force_compatibility: bool,
    /// Log at debug level unless `RUST_LOG` says otherwise
    pub logging: bool,
}

/// Configuration shared by discovery, sessions and polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub debug: DebugSettings,
    /// Local address sockets bind to
    pub bind_address: IpAddr,
    /// UDP port devices listen on
    pub device_port: u16,
    pub command_timeout_ms: u64,
    pub discovery_window_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: DebugSettings::default(),
            bind_address: IpAddr::from([0, 0, 0, 0]),
            device_port: 80,
            command_timeout_ms: 5000,
            discovery_window_secs: 5,
            poll_interval_secs: 10,
        }
    }
}

impl Config {
    /// Parse configuration from JSON text. Missing keys take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| BroadlinkError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.command_timeout_ms == 0 {
            return Err(BroadlinkError::Config(
                "command_timeout_ms must be positive".into(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(BroadlinkError::Config(
                "poll_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn discovery_window(&self) -> Duration {
        Duration::from_secs(self.discovery_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Set the per-command timeout.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = timeout.as_millis().max(1) as u64;
        self
    }

    /// Set the UDP port devices are addressed on.
    pub fn with_device_port(mut self, port: u16) -> Self {
        self.device_port = port;
        self
    }

    /// Force every discovered model to be reported as compatible.
    pub fn with_forced_compatibility(mut self, force: bool) -> Self {
        self.debug.force_compatibility = force;
        self
    }
}

/// Initialise `env_logger` according to the configuration.
///
/// `RUST_LOG` takes precedence. Calling this more than once is harmless.
pub fn init_logging(config: &Config) {
    let default_level = if config.debug.logging { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_level),
    )
    .format_timestamp_millis()
    .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_take_defaults() {
        let config = Config::from_json(r#"{ "debug": { "force_compatibility": true } }"#).unwrap();
        assert!(config.debug.force_compatibility);
        assert!(!config.debug.logging);
        assert_eq!(config.device_port, 80);
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.discovery_window(), Duration::from_secs(5));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        assert!(matches!(
            Config::from_json(r#"{ "command_timeout_ms": 0 }"#),
            Err(BroadlinkError::Config(_))
        ));
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        assert!(matches!(
            Config::from_json("{ nope"),
            Err(BroadlinkError::Config(_))
        ));
    }

    #[test]
    fn builders_adjust_fields() {
        let config = Config::default()
            .with_command_timeout(Duration::from_millis(50))
            .with_device_port(8080)
            .with_forced_compatibility(true);
        assert_eq!(config.command_timeout_ms, 50);
        assert_eq!(config.device_port, 8080);
        assert!(config.debug.force_compatibility);
    }
}
