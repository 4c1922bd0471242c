//! # Flowrun Configuration
//!
//! Layered configuration: built-in defaults, an optional TOML file, then
//! `FLOWRUN__SECTION__KEY` environment variables.
//!
//! ```rust,no_run
//! use flowrun_core::config::FlowrunConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FlowrunConfig::load(Some("config/flowrun.toml"))?;
//! println!("polling logs every {:?}", config.log_sync.poll_interval());
//! # Ok(())
//! # }
//! ```

use crate::error::{FlowrunError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Root configuration structure mirroring `config/flowrun.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct FlowrunConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub reconciler: ReconcilerConfig,
    pub log_sync: LogSyncConfig,
    pub observer: ObserverConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/flowrun_development".to_string(),
            max_connections: 10,
        }
    }
}

/// Connection settings for the workflow engine server
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub base_url: String,
    pub namespace: String,
    /// Bearer token sent with every request, if set
    pub auth_token: Option<String>,
    /// Container image used for every step
    pub image: String,
    pub request_timeout_ms: u64,
    /// Storage requested for the shared handoff volume of flow jobs
    pub volume_size: String,
    pub service_account: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:2746".to_string(),
            namespace: "default".to_string(),
            auth_token: None,
            image: "python:3.11-slim".to_string(),
            request_timeout_ms: 30_000,
            volume_size: "1Gi".to_string(),
            service_account: None,
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_ms: u64,
    /// Upper bound on runs reconciled at once within one tick
    pub max_concurrency: usize,
    /// After this long a requested cancellation is applied locally
    pub cancel_timeout_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_concurrency: 16,
            cancel_timeout_secs: 120,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LogSyncConfig {
    pub poll_interval_ms: u64,
    /// Buffered updates per stream before slow observers start lagging
    pub channel_capacity: usize,
}

impl Default for LogSyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            channel_capacity: 64,
        }
    }
}

impl LogSyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Reconnection policy for observers of a log stream
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObserverConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_attempts: u32,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl FlowrunConfig {
    /// Load configuration from an optional file plus `FLOWRUN__*` environment overrides.
    pub fn load(path: Option<impl AsRef<Path>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            let path = path.as_ref();
            debug!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FLOWRUN")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: FlowrunConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the background loops.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(FlowrunError::ConfigurationError(msg.to_string()));

        if self.reconciler.interval_ms == 0 {
            return invalid("reconciler.interval_ms must be greater than 0");
        }
        if self.reconciler.max_concurrency == 0 {
            return invalid("reconciler.max_concurrency must be greater than 0");
        }
        if self.log_sync.poll_interval_ms == 0 {
            return invalid("log_sync.poll_interval_ms must be greater than 0");
        }
        if self.log_sync.channel_capacity == 0 {
            return invalid("log_sync.channel_capacity must be greater than 0");
        }
        if self.observer.max_attempts == 0 {
            return invalid("observer.max_attempts must be greater than 0");
        }
        if self.observer.initial_backoff_ms > self.observer.max_backoff_ms {
            return invalid("observer.initial_backoff_ms must not exceed observer.max_backoff_ms");
        }
        if self.engine.base_url.trim().is_empty() {
            return invalid("engine.base_url must be set");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = FlowrunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.engine.namespace, "default");
        assert_eq!(config.log_sync.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[engine]
namespace = "analytics"
image = "python:3.12-slim"

[reconciler]
interval_ms = 750
"#
        )
        .unwrap();

        let config = FlowrunConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.engine.namespace, "analytics");
        assert_eq!(config.engine.image, "python:3.12-slim");
        assert_eq!(config.reconciler.interval(), Duration::from_millis(750));
        // untouched sections keep their defaults
        assert_eq!(config.observer.max_attempts, 5);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = FlowrunConfig::default();
        config.log_sync.poll_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, FlowrunError::ConfigurationError(_)));
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = FlowrunConfig::default();
        config.observer.initial_backoff_ms = 60_000;
        assert!(config.validate().is_err());
    }
}
