//! Configuration management

use crate::handshake::DEFAULT_USER_AGENT;
use crate::protocol::{DEFAULT_ACK_INTERVAL, DEFAULT_ACK_TIMEOUT, MAX_RECONNECT_WINDOW};
use crate::tunnel::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel session configuration
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, crate::Error> {
        let config: Config = toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.tunnel.validate()?;
        Ok(config)
    }

    /// Render configuration as TOML text
    pub fn to_toml_string(&self) -> Result<String, crate::Error> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))
    }
}

/// Tunnel session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// User-Agent header sent with every handshake
    pub user_agent: String,
    /// Send an ACK once this many bytes are unacknowledged
    pub ack_interval: u64,
    /// Send an ACK after this much inbound silence (milliseconds)
    pub ack_timeout_ms: u64,
    /// Timeout for one WebSocket dial, and for `initiate_connection` (seconds)
    pub connect_timeout_secs: u64,
    /// How long a local EOF waits for queued data to go out (seconds)
    pub all_sent_timeout_secs: u64,
    /// Reconnect backoff
    pub reconnect: ReconnectConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            ack_interval: DEFAULT_ACK_INTERVAL,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT.as_millis() as u64,
            connect_timeout_secs: 30,
            all_sent_timeout_secs: 10,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TunnelConfig {
    /// Check values that would make a session misbehave
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.ack_interval == 0 {
            return Err(crate::Error::Config("ack_interval must be positive".to_string()));
        }
        if self.reconnect.multiplier < 1.0 {
            return Err(crate::Error::Config(
                "reconnect.multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.reconnect.max_window_secs == 0 {
            return Err(crate::Error::Config(
                "reconnect.max_window_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn all_sent_timeout(&self) -> Duration {
        Duration::from_secs(self.all_sent_timeout_secs)
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    /// Give up after this long without a working carrier
    pub max_window_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
            multiplier: 2.0,
            jitter_ms: 250,
            max_window_secs: MAX_RECONNECT_WINDOW.as_secs(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            jitter: Duration::from_millis(self.jitter_ms),
            max_window: Duration::from_secs(self.max_window_secs),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Install a global tracing subscriber. Later calls are no-ops.
pub fn init_logging(config: &LoggingConfig) -> Result<(), crate::Error> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| crate::Error::Config(format!("Invalid log level {}: {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match config.format.to_lowercase().as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        "pretty" => builder.pretty().try_init(),
        other => {
            return Err(crate::Error::Config(format!("Unknown log format: {}", other)));
        }
    };
    // Already installed by an earlier call or by the host application
    let _ = result;
    Ok(())
}
