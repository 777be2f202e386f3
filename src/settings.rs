//! Configuration management.
//!
//! Settings load from `config/<name>.toml` via the `config` crate, with serde
//! defaults so a missing file still yields a working configuration. Durations are
//! written in human form (`"5s"`, `"50ms"`) and parsed with `humantime-serde`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::Config;
use serde::Deserialize;

use crate::error::{DeviceError, Result};
use crate::retry::RetryPolicy;

/// Top-level crate settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Default tracing level (`trace`..`error`) when `RUST_LOG` is unset.
    pub log_level: String,

    /// Default capacity of the concurrency governor. Must be at least 1.
    pub concurrency_limit: usize,

    /// Retry budget and backoff bases for device operations.
    pub retry: RetrySettings,

    /// Per-attempt deadline for hardware-touching operations.
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Duration,

    /// Delay between setting a parameter and capturing during a sequenced sweep,
    /// giving hardware time to settle.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,

    /// How long a blocking façade call waits before timing out.
    #[serde(with = "humantime_serde")]
    pub facade_call_timeout: Duration,

    /// Bound on the `close_all` sweep during façade shutdown.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Per-backend overrides for the connection-check timeout, keyed by backend
    /// name. Backends not listed use `operation_timeout`.
    #[serde(default, with = "humantime_serde_map")]
    pub connection_timeouts: HashMap<String, Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            concurrency_limit: 4,
            retry: RetrySettings::default(),
            operation_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(50),
            facade_call_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            connection_timeouts: HashMap::new(),
        }
    }
}

/// Retry budget and per-class backoff bases, in milliseconds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrySettings {
    /// Total attempts for retryable operations (including the first).
    pub retrieve_retry_count: u32,
    /// Backoff base for capture failures.
    pub capture_backoff_ms: u64,
    /// Backoff base for connection failures.
    pub connection_backoff_ms: u64,
    /// Backoff base for timeouts.
    pub timeout_backoff_ms: u64,
    /// Backoff base for unclassified errors.
    pub default_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            retrieve_retry_count: 3,
            capture_backoff_ms: 250,
            connection_backoff_ms: 1000,
            timeout_backoff_ms: 500,
            default_backoff_ms: 500,
        }
    }
}

impl RetrySettings {
    /// Build the pure retry policy these settings describe.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            budget: self.retrieve_retry_count.max(1),
            capture_base: Duration::from_millis(self.capture_backoff_ms),
            connection_base: Duration::from_millis(self.connection_backoff_ms),
            timeout_base: Duration::from_millis(self.timeout_backoff_ms),
            default_base: Duration::from_millis(self.default_backoff_ms),
        }
    }
}

impl Settings {
    /// Load settings from `config/<name>.toml` (default: `config/default.toml`).
    ///
    /// A missing file is not an error; defaults apply. A present but malformed
    /// file is.
    pub fn new(config_name: Option<&str>) -> Result<Self> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        Self::from_file(&config_path)
    }

    /// Load settings from an explicit path (without extension).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_string_lossy().to_string();
        let cfg = Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .build()
            .map_err(|e| DeviceError::InvalidArgument(format!("config load failed: {e}")))?;

        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| DeviceError::InvalidArgument(format!("config parse failed: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject semantically invalid values that pass parsing.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit < 1 {
            return Err(DeviceError::InvalidArgument(
                "concurrency_limit must be at least 1".into(),
            ));
        }
        if self.retry.retrieve_retry_count < 1 {
            return Err(DeviceError::InvalidArgument(
                "retrieve_retry_count must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Connection-check timeout for a backend, falling back to `operation_timeout`.
    pub fn connection_timeout(&self, backend: &str) -> Duration {
        self.connection_timeouts
            .get(backend)
            .copied()
            .unwrap_or(self.operation_timeout)
    }
}

/// `humantime_serde` over the values of a string-keyed map.
mod humantime_serde_map {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: HashMap<String, humantime_serde::Serde<Duration>> =
            HashMap::deserialize(deserializer)?;
        Ok(raw.into_iter().map(|(k, v)| (k, v.into_inner())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.concurrency_limit, 4);
        assert_eq!(settings.retry.retrieve_retry_count, 3);
        assert_eq!(settings.operation_timeout, Duration::from_secs(5));
        settings.validate().unwrap();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let settings = Settings::from_file("/nonexistent/devicehub-config").unwrap();
        assert_eq!(settings.concurrency_limit, 4);
    }

    #[test]
    fn parses_toml_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
log_level = "debug"
concurrency_limit = 2
operation_timeout = "2s"
settle_delay = "10ms"

[retry]
retrieve_retry_count = 5
capture_backoff_ms = 100

[connection_timeouts]
Mock = "250ms"
"#
        )
        .unwrap();

        let settings = Settings::from_file(dir.path().join("hub")).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.concurrency_limit, 2);
        assert_eq!(settings.operation_timeout, Duration::from_secs(2));
        assert_eq!(settings.retry.retrieve_retry_count, 5);
        assert_eq!(settings.retry.capture_backoff_ms, 100);
        // Unspecified retry fields keep their defaults.
        assert_eq!(settings.retry.connection_backoff_ms, 1000);
        assert_eq!(
            settings.connection_timeout("Mock"),
            Duration::from_millis(250)
        );
        assert_eq!(settings.connection_timeout("Other"), Duration::from_secs(2));
    }

    #[test]
    fn rejects_zero_concurrency_limit() {
        let settings = Settings {
            concurrency_limit: 0,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(DeviceError::InvalidArgument(_))
        ));
    }

    #[test]
    fn retry_settings_build_policy() {
        let retry = RetrySettings {
            retrieve_retry_count: 4,
            capture_backoff_ms: 125,
            ..RetrySettings::default()
        };
        let policy = retry.policy();
        assert_eq!(policy.budget, 4);
        assert_eq!(policy.capture_base, Duration::from_millis(125));
    }
}
