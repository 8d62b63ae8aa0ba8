//! Configuration for the Tributary orchestrator
//!
//! Values come from an optional file named by `ORCHESTRATOR_CONFIG_FILE`,
//! overridden by `ORCHESTRATOR_*` environment variables.

use std::env;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tributary_core::RetryPolicy;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Environment variable naming the optional configuration file
pub const CONFIG_FILE_ENV: &str = "ORCHESTRATOR_CONFIG_FILE";

/// Orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Shared secret for signing continuation tokens
    #[serde(default)]
    pub token_secret: String,

    /// Delay between reconciliation ticks
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Identity used when claiming flows for preparation
    #[serde(default = "default_orchestrator_id")]
    pub orchestrator_id: String,

    /// Image pull policy handed to the deployment driver
    #[serde(default)]
    pub image_pull_policy: Option<String>,

    /// Replicas per workload
    #[serde(default = "default_replicas")]
    pub replicas: u32,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Days a completed execution record is kept
    #[serde(default = "default_retention_days")]
    pub journal_retention_days: i64,

    /// Days a duplicate-delivery audit row is kept
    #[serde(default = "default_retention_days")]
    pub duplicate_retention_days: i64,

    /// Attempts for counter upserts that lose an insert race
    #[serde(default = "default_counter_retry_attempts")]
    pub counter_retry_attempts: u32,

    /// First backoff between counter upsert attempts
    #[serde(default = "default_counter_retry_backoff_ms")]
    pub counter_retry_backoff_ms: u64,
}

fn default_tick_interval_ms() -> u64 {
    10_000
}

fn default_orchestrator_id() -> String {
    format!("orchestrator-{}", uuid::Uuid::new_v4())
}

fn default_replicas() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retention_days() -> i64 {
    7
}

fn default_counter_retry_attempts() -> u32 {
    5
}

fn default_counter_retry_backoff_ms() -> u64 {
    25
}

impl OrchestratorConfig {
    /// Load configuration from the optional file and the environment
    pub fn load() -> OrchestratorResult<Self> {
        let path = env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| "orchestrator".to_string());

        let config: Self = Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix("ORCHESTRATOR").try_parsing(true))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        info!(orchestrator_id = %config.orchestrator_id, "Loaded orchestrator configuration");
        Ok(config)
    }

    /// Reject unusable values
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.token_secret.is_empty() {
            return Err(OrchestratorError::ConfigError(
                "Token secret is required".to_string(),
            ));
        }

        if self.tick_interval_ms == 0 {
            return Err(OrchestratorError::ConfigError(
                "Tick interval must be positive".to_string(),
            ));
        }

        if self.journal_retention_days <= 0 || self.duplicate_retention_days <= 0 {
            return Err(OrchestratorError::ConfigError(
                "Retention must be at least one day".to_string(),
            ));
        }

        if self.image_pull_policy.is_none() {
            warn!("No image pull policy configured - driver default applies");
        }

        Ok(())
    }

    /// Delay between reconciliation ticks
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Retry policy for counter upserts
    pub fn counter_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.counter_retry_attempts,
            Duration::from_millis(self.counter_retry_backoff_ms),
        )
    }

    /// Retention of completed execution records
    pub fn journal_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.journal_retention_days)
    }

    /// Retention of duplicate-delivery audit rows
    pub fn duplicate_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.duplicate_retention_days)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            token_secret: String::new(),
            tick_interval_ms: default_tick_interval_ms(),
            orchestrator_id: default_orchestrator_id(),
            image_pull_policy: None,
            replicas: default_replicas(),
            log_level: default_log_level(),
            journal_retention_days: default_retention_days(),
            duplicate_retention_days: default_retention_days(),
            counter_retry_attempts: default_counter_retry_attempts(),
            counter_retry_backoff_ms: default_counter_retry_backoff_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(10));
        assert_eq!(config.replicas, 1);
        assert!(config.orchestrator_id.starts_with("orchestrator-"));
        assert_eq!(config.counter_retry().max_attempts, 5);
        assert_eq!(config.journal_retention(), chrono::Duration::days(7));
    }

    #[test]
    fn test_missing_secret_is_rejected() {
        let config = OrchestratorConfig::default();
        assert!(matches!(
            config.validate(),
            Err(OrchestratorError::ConfigError(_))
        ));

        let config = OrchestratorConfig {
            token_secret: "s3cret".to_string(),
            ..OrchestratorConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_fills_defaults() {
        let config: OrchestratorConfig = serde_json::from_value(serde_json::json!({
            "token_secret": "abc",
            "tick_interval_ms": 500
        }))
        .unwrap();

        assert_eq!(config.tick_interval_ms, 500);
        assert_eq!(config.duplicate_retention_days, 7);
        assert_eq!(config.log_level, "info");
    }
}
