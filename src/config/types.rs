//! Core configuration types and loading.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use super::defaults::*;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Instance identity and gateway address.
    #[serde(default)]
    pub server: ServerConfig,
    /// Policy and protected-topic files.
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Handshake behavior.
    #[serde(default)]
    pub handshake: HandshakeConfig,
    /// Peer update fan-out.
    #[serde(default)]
    pub propagation: PropagationConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Instance identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Name used in logs.
    #[serde(default = "default_instance_name")]
    pub instance_name: String,
    /// Peer identity of the authentication service itself.
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Address of the line-JSON gateway.
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            instance_name: default_instance_name(),
            identity: default_identity(),
            listen: default_listen(),
        }
    }
}

/// Policy file locations and reload cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    /// Path of the versioned policy file.
    #[serde(default = "default_auth_file")]
    pub auth_file: String,
    /// Path of the write-protected topics file.
    #[serde(default = "default_protected_topics_file")]
    pub protected_topics_file: String,
    /// Seconds between modification-time checks of both files (default: 5).
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
    /// Reload as soon as either file changes on disk (default: true).
    #[serde(default = "default_watch_files")]
    pub watch_files: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auth_file: default_auth_file(),
            protected_topics_file: default_protected_topics_file(),
            reload_interval_secs: default_reload_interval(),
            watch_files: default_watch_files(),
        }
    }
}

impl PolicyConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval_secs)
    }
}

/// Handshake configuration.
///
/// `allow_any` grants every handshake that matches no entry and is meant
/// for bootstrap only. `setup_mode` instead enrolls each unknown credential
/// as a new entry.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default)]
    pub allow_any: bool,
    #[serde(default)]
    pub setup_mode: bool,
    /// Ceiling in seconds for the per-address rejection delay (default: 100).
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            allow_any: false,
            setup_mode: false,
            max_backoff_secs: default_max_backoff(),
        }
    }
}

/// Peer update configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PropagationConfig {
    /// Seconds to wait after startup before the first full push (default: 3).
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,
    /// Per-peer call timeout in seconds (default: 4).
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
    /// Seconds between full passes when nothing changed (default: 60).
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            startup_delay_secs: default_startup_delay(),
            peer_timeout_secs: default_peer_timeout(),
            resync_interval_secs: default_resync_interval(),
        }
    }
}

impl PropagationConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration. Filtering is controlled by `RUST_LOG`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.identity, "platform.auth");
        assert_eq!(config.policy.reload_interval_secs, 5);
        assert!(config.policy.watch_files);
        assert_eq!(config.handshake.max_backoff_secs, 100);
        assert!(!config.handshake.allow_any);
        assert_eq!(config.propagation.peer_timeout(), Duration::from_secs(4));
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_sections_override_defaults() {
        let config: Config = toml::from_str(
            r#"
[server]
identity = "auth"
listen = "0.0.0.0:9000"

[handshake]
setup_mode = true

[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(config.server.identity, "auth");
        assert_eq!(config.server.listen.port(), 9000);
        assert!(config.handshake.setup_mode);
        assert_eq!(config.logging.format, LogFormat::Json);
    }
}
