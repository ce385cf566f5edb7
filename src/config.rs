//! Runtime configuration for the orchestrator.
//!
//! Every setting has a default and can be overridden through a
//! `CASE_ORCH_*` environment variable.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::resilience::CircuitBreakerConfig;
use crate::scheduler::{WorkerPoolConfig, DEFAULT_MAX_RETRIES};

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for queue access, workers and downstream calls.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub redis_url: String,
    pub queue_name: String,

    // Workers
    pub workers: usize,
    pub poll_interval: Duration,
    pub task_timeout: Duration,
    pub shutdown_timeout: Duration,
    /// Retry budget for tasks created without an explicit one.
    pub max_retries: u32,

    // Recommender
    /// Base URL; when unset, alerts are processed without propositions.
    pub recommender_url: Option<String>,
    pub recommender_timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_timeout: Duration,

    /// Service name to endpoint, for workflow steps.
    pub services: BTreeMap<String, String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379/".to_string(),
            queue_name: "cases".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(1000),
            task_timeout: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(60),
            max_retries: DEFAULT_MAX_RETRIES,
            recommender_url: None,
            recommender_timeout: Duration::from_secs(10),
            breaker_failure_threshold: 5,
            breaker_success_threshold: 2,
            breaker_timeout: Duration::from_secs(60),
            services: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `CASE_ORCH_REDIS_URL`: Redis connection URL (default: redis://127.0.0.1:6379/)
    /// - `CASE_ORCH_QUEUE_NAME`: Queue key prefix (default: cases)
    /// - `CASE_ORCH_WORKERS`: Number of workers (default: 4)
    /// - `CASE_ORCH_POLL_INTERVAL_MS`: Idle poll interval (default: 1000)
    /// - `CASE_ORCH_TASK_TIMEOUT_SECS`: Per-task timeout (default: 300)
    /// - `CASE_ORCH_SHUTDOWN_TIMEOUT_SECS`: Graceful shutdown limit (default: 60)
    /// - `CASE_ORCH_MAX_RETRIES`: Default task retry budget (default: 3)
    /// - `CASE_ORCH_RECOMMENDER_URL`: Recommender base URL (default: unset)
    /// - `CASE_ORCH_RECOMMENDER_TIMEOUT_SECS`: Recommender request timeout (default: 10)
    /// - `CASE_ORCH_BREAKER_FAILURE_THRESHOLD`: Failures before opening (default: 5)
    /// - `CASE_ORCH_BREAKER_SUCCESS_THRESHOLD`: Trial successes before closing (default: 2)
    /// - `CASE_ORCH_BREAKER_TIMEOUT_SECS`: Open duration before probing (default: 60)
    /// - `CASE_ORCH_SERVICES`: Comma-separated `name=url` pairs
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result is
    /// invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("CASE_ORCH_REDIS_URL") {
            config.redis_url = val;
        }
        if let Some(val) = lookup("CASE_ORCH_QUEUE_NAME") {
            config.queue_name = val;
        }

        if let Some(val) = lookup("CASE_ORCH_WORKERS") {
            config.workers = parse_env_value(&val, "CASE_ORCH_WORKERS")?;
        }
        if let Some(val) = lookup("CASE_ORCH_POLL_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "CASE_ORCH_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(val) = lookup("CASE_ORCH_TASK_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "CASE_ORCH_TASK_TIMEOUT_SECS")?;
            config.task_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("CASE_ORCH_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "CASE_ORCH_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("CASE_ORCH_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "CASE_ORCH_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("CASE_ORCH_RECOMMENDER_URL") {
            config.recommender_url = Some(val).filter(|url| !url.trim().is_empty());
        }
        if let Some(val) = lookup("CASE_ORCH_RECOMMENDER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "CASE_ORCH_RECOMMENDER_TIMEOUT_SECS")?;
            config.recommender_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = lookup("CASE_ORCH_BREAKER_FAILURE_THRESHOLD") {
            config.breaker_failure_threshold =
                parse_env_value(&val, "CASE_ORCH_BREAKER_FAILURE_THRESHOLD")?;
        }
        if let Some(val) = lookup("CASE_ORCH_BREAKER_SUCCESS_THRESHOLD") {
            config.breaker_success_threshold =
                parse_env_value(&val, "CASE_ORCH_BREAKER_SUCCESS_THRESHOLD")?;
        }
        if let Some(val) = lookup("CASE_ORCH_BREAKER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "CASE_ORCH_BREAKER_TIMEOUT_SECS")?;
            config.breaker_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("CASE_ORCH_SERVICES") {
            config.services = parse_services(&val)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url must not be empty".to_string(),
            ));
        }
        if self.queue_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_name must not be empty".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers must be greater than 0".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }
        if self.breaker_failure_threshold == 0 || self.breaker_success_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "breaker thresholds must be greater than 0".to_string(),
            ));
        }
        if let Some((name, _)) = self.services.iter().find(|(_, url)| url.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(format!(
                "service '{name}' has an empty endpoint"
            )));
        }
        Ok(())
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_recommender_url(mut self, url: impl Into<String>) -> Self {
        self.recommender_url = Some(url.into());
        self
    }

    pub fn with_service(mut self, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        self.services.insert(name.into(), endpoint.into());
        self
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig::new(self.workers)
            .with_poll_interval(self.poll_interval)
            .with_task_timeout(self.task_timeout)
            .with_shutdown_timeout(self.shutdown_timeout)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::default()
            .with_failure_threshold(self.breaker_failure_threshold)
            .with_success_threshold(self.breaker_success_threshold)
            .with_timeout(self.breaker_timeout)
    }
}

/// Parse an environment variable value into the given type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse `name=url,name=url`.
fn parse_services(value: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    let mut services = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, url) = entry.split_once('=').ok_or_else(|| ConfigError::InvalidValue {
            key: "CASE_ORCH_SERVICES".to_string(),
            message: format!("expected name=url, got '{}'", entry),
        })?;
        services.insert(name.trim().to_string(), url.trim().to_string());
    }
    Ok(services)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.queue_name, "cases");
        assert_eq!(config.workers, 4);
        assert_eq!(config.max_retries, 3);
        assert!(config.recommender_url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = OrchestratorConfig::from_lookup(lookup(&[
            ("CASE_ORCH_QUEUE_NAME", "incidents"),
            ("CASE_ORCH_WORKERS", "8"),
            ("CASE_ORCH_POLL_INTERVAL_MS", "250"),
            ("CASE_ORCH_RECOMMENDER_URL", "http://recs:8000"),
            ("CASE_ORCH_BREAKER_FAILURE_THRESHOLD", "3"),
            ("CASE_ORCH_SERVICES", "ci=http://ci:8080, spam=http://spam:9000"),
        ]))
        .expect("valid config");

        assert_eq!(config.queue_name, "incidents");
        assert_eq!(config.workers, 8);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.recommender_url.as_deref(), Some("http://recs:8000"));
        assert_eq!(config.breaker_config().failure_threshold, 3);
        assert_eq!(config.services["spam"], "http://spam:9000");
        assert_eq!(config.worker_pool_config().num_workers, 8);
    }

    #[test]
    fn test_invalid_number() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("CASE_ORCH_WORKERS", "many")]))
            .expect_err("not a number");
        assert!(err.to_string().contains("CASE_ORCH_WORKERS"));
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let result = OrchestratorConfig::default().with_workers(0).validate();
        assert!(result.unwrap_err().to_string().contains("workers"));
    }

    #[test]
    fn test_malformed_services() {
        assert!(OrchestratorConfig::from_lookup(lookup(&[("CASE_ORCH_SERVICES", "ci")])).is_err());
        assert!(OrchestratorConfig::from_lookup(lookup(&[("CASE_ORCH_SERVICES", "ci=")])).is_err());
    }
}
