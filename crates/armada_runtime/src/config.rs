//! Engine configuration and layered per-run settings.
//!
//! [`EngineConfig`] holds process-wide defaults. Per-run values are resolved
//! by [`Settings::resolve`], which walks an ordered chain of sources:
//! run-local [`RunOverrides`] first, then the service definition, then the
//! engine defaults.

use core::time::Duration;

use serde::{Deserialize, Serialize};

use armada_workflow::policy::{RetryPolicy, RunMode, duration_secs};
use armada_workflow::Service;

use crate::error::ConfigError;

/// Prefix of environment variables read by [`EngineConfig::with_env_overrides`].
pub const ENV_PREFIX: &str = "ARMADA_";

// ─────────────────────────────────────────────────────────────────────────────
// EngineConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Process-wide engine defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool ceiling for parallel dispatch.
    pub max_workers: usize,
    /// Timeout applied to connection-open calls.
    #[serde(with = "duration_secs")]
    pub connection_timeout: Duration,
    /// How many sessions are closed concurrently when a run ends.
    pub close_concurrency: usize,
    /// Absolute retry ceiling when a service sets none.
    pub max_retry_ceiling: u32,
    /// Visit bound for workflow members that set none.
    pub default_max_runs: usize,
    /// Maximum expression nesting depth.
    pub expression_depth_limit: usize,
    /// Log lines kept per step in the progress store.
    pub progress_log_limit: usize,
    /// Maximum nesting of workflows inside workflows.
    pub max_nesting_depth: usize,
    /// Finished lineages whose progress and task handles are kept.
    pub finished_run_retention: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            connection_timeout: Duration::from_secs(10),
            close_concurrency: 8,
            max_retry_ceiling: 100,
            default_max_runs: 1,
            expression_depth_limit: 64,
            progress_log_limit: 1000,
            max_nesting_depth: 32,
            finished_run_retention: 256,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document. Missing fields keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed documents and
    /// [`ConfigError::OutOfRange`] for invalid values.
    pub fn from_json(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(source).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `ARMADA_*` environment variables on top of this configuration.
    ///
    /// Recognized variables: `ARMADA_MAX_WORKERS`, `ARMADA_CONNECTION_TIMEOUT`
    /// (seconds), `ARMADA_CLOSE_CONCURRENCY`, `ARMADA_MAX_RETRY_CEILING`,
    /// `ARMADA_DEFAULT_MAX_RUNS`, `ARMADA_EXPRESSION_DEPTH_LIMIT`,
    /// `ARMADA_PROGRESS_LOG_LIMIT`, `ARMADA_MAX_NESTING_DEPTH`,
    /// `ARMADA_FINISHED_RUN_RETENTION`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable does not parse.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub(crate) fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        fn parse<T: core::str::FromStr>(key: String, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key, value })
        }

        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("MAX_WORKERS") {
            self.max_workers = parse(key, value)?;
        }
        if let Some((key, value)) = get("CONNECTION_TIMEOUT") {
            let seconds: f64 = parse(key.clone(), value.clone())?;
            self.connection_timeout = Duration::try_from_secs_f64(seconds)
                .map_err(|_| ConfigError::InvalidValue { key, value })?;
        }
        if let Some((key, value)) = get("CLOSE_CONCURRENCY") {
            self.close_concurrency = parse(key, value)?;
        }
        if let Some((key, value)) = get("MAX_RETRY_CEILING") {
            self.max_retry_ceiling = parse(key, value)?;
        }
        if let Some((key, value)) = get("DEFAULT_MAX_RUNS") {
            self.default_max_runs = parse(key, value)?;
        }
        if let Some((key, value)) = get("EXPRESSION_DEPTH_LIMIT") {
            self.expression_depth_limit = parse(key, value)?;
        }
        if let Some((key, value)) = get("PROGRESS_LOG_LIMIT") {
            self.progress_log_limit = parse(key, value)?;
        }
        if let Some((key, value)) = get("MAX_NESTING_DEPTH") {
            self.max_nesting_depth = parse(key, value)?;
        }
        if let Some((key, value)) = get("FINISHED_RUN_RETENTION") {
            self.finished_run_retention = parse(key, value)?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("max_workers", self.max_workers),
            ("close_concurrency", self.close_concurrency),
            ("default_max_runs", self.default_max_runs),
            ("expression_depth_limit", self.expression_depth_limit),
            ("max_nesting_depth", self.max_nesting_depth),
            ("finished_run_retention", self.finished_run_retention),
        ];
        for (field, value) in checks {
            if value < 1 {
                return Err(ConfigError::OutOfRange { field, min: 1 });
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Layered settings
// ─────────────────────────────────────────────────────────────────────────────

/// Run-local overrides, consulted before the service definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOverrides {
    /// Dispatch mode override.
    pub run_mode: Option<RunMode>,
    /// Retry policy override.
    pub retry: Option<RetryPolicy>,
    /// Worker pool ceiling override.
    pub max_processes: Option<usize>,
}

impl RunOverrides {
    /// Overrides the dispatch mode.
    #[must_use]
    pub fn with_run_mode(mut self, mode: RunMode) -> Self {
        self.run_mode = Some(mode);
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Overrides the worker pool ceiling.
    #[must_use]
    pub fn with_max_processes(mut self, max: usize) -> Self {
        self.max_processes = Some(max);
        self
    }
}

/// Effective settings for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Dispatch mode.
    pub run_mode: RunMode,
    /// Retry policy, with the ceiling resolved.
    pub retry: RetryPolicy,
    /// Absolute retry ceiling.
    pub retry_ceiling: u32,
    /// Worker pool ceiling.
    pub max_processes: usize,
    /// Connection-open timeout.
    pub connection_timeout: Duration,
}

/// Returns the first value present in the chain, or `fallback`.
fn layered<T: Clone>(sources: &[Option<&T>], fallback: T) -> T {
    sources
        .iter()
        .find_map(|source| source.cloned())
        .unwrap_or(fallback)
}

impl Settings {
    /// Resolves the settings for `service` under `overrides`.
    ///
    /// Overrides only apply to the step they were given for; nested steps
    /// pass `None`.
    #[must_use]
    pub fn resolve(
        service: &Service,
        overrides: Option<&RunOverrides>,
        config: &EngineConfig,
    ) -> Self {
        let run_mode = layered(
            &[
                overrides.and_then(|o| o.run_mode.as_ref()),
                Some(&service.run_mode),
            ],
            RunMode::default(),
        );
        let retry = layered(
            &[
                overrides.and_then(|o| o.retry.as_ref()),
                Some(&service.retry),
            ],
            RetryPolicy::default(),
        );
        let retry_ceiling = retry.max_retries.unwrap_or(config.max_retry_ceiling);
        let max_processes = layered(
            &[
                overrides.and_then(|o| o.max_processes.as_ref()),
                service.max_processes.as_ref(),
            ],
            config.max_workers,
        )
        .max(1);

        Self {
            run_mode,
            retry,
            retry_ceiling,
            max_processes,
            connection_timeout: config.connection_timeout,
        }
    }

    /// Returns how many retries are allowed given a (possibly revised)
    /// per-attempt retry count.
    #[must_use]
    pub fn allowed_retries(&self, requested: u32) -> u32 {
        requested.min(self.retry_ceiling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use hashbrown::HashMap;

    #[test]
    fn defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn from_json_keeps_missing_defaults() {
        let config = EngineConfig::from_json(r#"{"max_workers": 4, "connection_timeout": 2.5}"#)
            .unwrap();
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.connection_timeout, Duration::from_millis(2500));
        assert_eq!(config.close_concurrency, 8);
    }

    #[test]
    fn from_json_rejects_zero_workers() {
        let err = EngineConfig::from_json(r#"{"max_workers": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { field: "max_workers", .. }));
    }

    #[test]
    fn overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ARMADA_MAX_WORKERS", "3"),
            ("ARMADA_CONNECTION_TIMEOUT", "0.5"),
            ("ARMADA_FINISHED_RUN_RETENTION", "16"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| (*v).to_owned()))
            .unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.connection_timeout, Duration::from_millis(500));
        assert_eq!(config.finished_run_retention, 16);
    }

    #[test]
    fn invalid_override_is_reported() {
        let err = EngineConfig::default()
            .with_overrides(|key| (key == "ARMADA_MAX_WORKERS").then(|| "many".to_owned()))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid value 'many' for ARMADA_MAX_WORKERS");
    }

    #[test]
    fn run_overrides_win_over_service() {
        let service = Service::atomic(1, "ping", "command")
            .with_run_mode(RunMode::PerDevice)
            .with_retry(RetryPolicy::new(2).with_ceiling(1))
            .with_max_processes(4);
        let config = EngineConfig::default();

        let settings = Settings::resolve(&service, None, &config);
        assert_eq!(settings.run_mode, RunMode::PerDevice);
        assert_eq!(settings.max_processes, 4);
        assert_eq!(settings.allowed_retries(2), 1);

        let overrides = RunOverrides::default()
            .with_run_mode(RunMode::Once)
            .with_retry(RetryPolicy::new(5));
        let settings = Settings::resolve(&service, Some(&overrides), &config);
        assert_eq!(settings.run_mode, RunMode::Once);
        assert_eq!(settings.retry_ceiling, 100);
        assert_eq!(settings.allowed_retries(5), 5);
    }
}
