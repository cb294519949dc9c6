//! Settings types. Every section defaults field-by-field, so a partial
//! settings file only needs the keys it changes.

use std::path::PathBuf;

use iterlink_core::retry::BackoffConfig;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Server endpoint and keepalive.
    pub server: ServerSettings,
    /// Reconnect backoff.
    pub reconnect: BackoffConfig,
    /// Local event store.
    pub store: StoreSettings,
    /// Write queue retry policy.
    pub write_queue: WriteQueueSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl SyncSettings {
    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.url.is_empty() {
            return Err(SettingsError::InvalidValue("server.url is empty".into()));
        }
        if !(self.server.url.starts_with("ws://") || self.server.url.starts_with("wss://")) {
            return Err(SettingsError::InvalidValue(format!(
                "server.url must be ws:// or wss://, got {}",
                self.server.url
            )));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(SettingsError::InvalidValue(
                "reconnect.maxAttempts must be at least 1".into(),
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(SettingsError::InvalidValue(
                "reconnect.initialDelayMs exceeds reconnect.maxDelayMs".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_factor) {
            return Err(SettingsError::InvalidValue(
                "reconnect.jitterFactor must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Server connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Keepalive ping interval in ms.
    pub heartbeat_interval_ms: u64,
    /// Instance treated as active until the UI says otherwise.
    pub default_instance: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:3847/ws".into(),
            heartbeat_interval_ms: 30_000,
            default_instance: "default".into(),
        }
    }
}

/// Local event store settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    /// `SQLite` database file.
    pub db_path: PathBuf,
    /// Maximum pooled connections.
    pub pool_size: u32,
    /// `SQLite` busy timeout in ms.
    pub busy_timeout_ms: u32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            db_path: crate::loader::iterlink_dir().join("events.db"),
            pool_size: 4,
            busy_timeout_ms: 5000,
        }
    }
}

/// Write queue retry policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WriteQueueSettings {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// First retry delay in ms; doubles per retry.
    pub retry_base_delay_ms: u64,
}

impl Default for WriteQueueSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 100,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = SyncSettings::default();
        assert_eq!(settings.server.heartbeat_interval_ms, 30_000);
        assert_eq!(settings.server.default_instance, "default");
        assert_eq!(settings.reconnect.max_attempts, 10);
        assert_eq!(settings.write_queue.max_retries, 3);
        assert_eq!(settings.logging.level, "info");
        assert!(settings.store.db_path.ends_with("events.db"));
        settings.validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: SyncSettings =
            serde_json::from_str(r#"{"server": {"url": "wss://example.test/ws"}}"#).unwrap();
        assert_eq!(settings.server.url, "wss://example.test/ws");
        assert_eq!(settings.server.heartbeat_interval_ms, 30_000);
        assert_eq!(settings.reconnect.initial_delay_ms, 1000);
    }

    #[test]
    fn validate_rejects_http_url() {
        let mut settings = SyncSettings::default();
        settings.server.url = "http://example.test".into();
        assert!(matches!(settings.validate(), Err(SettingsError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_zero_attempts() {
        let mut settings = SyncSettings::default();
        settings.reconnect.max_attempts = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_delays() {
        let mut settings = SyncSettings::default();
        settings.reconnect.initial_delay_ms = 60_000;
        assert!(settings.validate().is_err());
    }
}
