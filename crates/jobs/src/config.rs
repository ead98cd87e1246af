//! Subsystem configuration.
//!
//! `JobsConfig` deserializes with every field defaulted, and
//! [`JobsConfig::from_env`] overlays `FORMJOBS_*` environment variables:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `FORMJOBS_DATABASE_URL` (or `DATABASE_URL`) | `database_url` |
//! | `FORMJOBS_POLL_INTERVAL_MS` | `poll_interval_ms` |
//! | `FORMJOBS_BATCH_SIZE` | `batch_size` |
//! | `FORMJOBS_DEFAULT_MAX_ATTEMPTS` | `default_max_attempts` |
//! | `FORMJOBS_HANDLER_TIMEOUT_MS` | `handler_timeout_ms` (`0` disables; stale recovery must be off) |
//! | `FORMJOBS_UNROUTABLE` | `unroutable` (`skip`, `count_attempt`, `fail`) |
//! | `FORMJOBS_BACKOFF` | `backoff.strategy` |
//! | `FORMJOBS_BACKOFF_BASE_MS` | `backoff.base_delay_ms` |
//! | `FORMJOBS_BACKOFF_MAX_MS` | `backoff.max_delay_ms` |
//! | `FORMJOBS_BACKOFF_JITTER` | `backoff.jitter` |
//! | `FORMJOBS_STALE_AFTER_SECS` | `stale_after_secs` (`0` disables; must exceed the handler timeout) |

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::dispatcher::{DispatcherConfig, UnroutablePolicy};
use super::queue::JobQueue;
use super::store::JobStore;
use super::types::{BackoffPolicy, BackoffStrategy, DEFAULT_MAX_ATTEMPTS};

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Display) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Retry backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Overrides the strategy's default jitter when set.
    pub jitter: Option<f64>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Immediate,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter: None,
        }
    }
}

impl BackoffConfig {
    pub fn policy(&self) -> BackoffPolicy {
        let base = Duration::from_millis(self.base_delay_ms);
        let max = Duration::from_millis(self.max_delay_ms);

        let policy = match self.strategy {
            BackoffStrategy::Immediate => BackoffPolicy::immediate(),
            BackoffStrategy::Fixed => BackoffPolicy::fixed(base),
            BackoffStrategy::Linear => BackoffPolicy::linear(base, max),
            BackoffStrategy::Exponential => BackoffPolicy::exponential(base, max),
        };

        match self.jitter {
            Some(jitter) => policy.with_jitter(jitter),
            None => policy,
        }
    }
}

/// Job subsystem configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub database_url: String,
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub default_max_attempts: u32,
    pub handler_timeout_ms: u64,
    pub unroutable: UnroutablePolicy,
    pub backoff: BackoffConfig,
    pub stale_after_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://formjobs.db".to_string(),
            poll_interval_ms: 5_000,
            batch_size: 10,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            handler_timeout_ms: 60_000,
            unroutable: UnroutablePolicy::Skip,
            backoff: BackoffConfig::default(),
            stale_after_secs: 900,
        }
    }
}

impl JobsConfig {
    /// Defaults overlaid with `FORMJOBS_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup` (keyed like the
    /// environment).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("FORMJOBS_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            config.database_url = url;
        }
        overlay(&lookup, "FORMJOBS_POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        overlay(&lookup, "FORMJOBS_BATCH_SIZE", &mut config.batch_size)?;
        overlay(&lookup, "FORMJOBS_DEFAULT_MAX_ATTEMPTS", &mut config.default_max_attempts)?;
        overlay(&lookup, "FORMJOBS_HANDLER_TIMEOUT_MS", &mut config.handler_timeout_ms)?;
        overlay(&lookup, "FORMJOBS_UNROUTABLE", &mut config.unroutable)?;
        overlay(&lookup, "FORMJOBS_STALE_AFTER_SECS", &mut config.stale_after_secs)?;

        if let Some(raw) = lookup("FORMJOBS_BACKOFF") {
            config.backoff.strategy = parse_strategy(&raw).ok_or_else(|| {
                ConfigError::invalid("FORMJOBS_BACKOFF", format!("unknown strategy '{raw}'"))
            })?;
        }
        overlay(&lookup, "FORMJOBS_BACKOFF_BASE_MS", &mut config.backoff.base_delay_ms)?;
        overlay(&lookup, "FORMJOBS_BACKOFF_MAX_MS", &mut config.backoff.max_delay_ms)?;
        if let Some(raw) = lookup("FORMJOBS_BACKOFF_JITTER") {
            config.backoff.jitter = Some(parse("FORMJOBS_BACKOFF_JITTER", &raw)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be greater than 0"));
        }
        if self.default_max_attempts == 0 {
            return Err(ConfigError::invalid("default_max_attempts", "must be at least 1"));
        }
        if let Some(jitter) = self.backoff.jitter {
            if !(0.0..=1.0).contains(&jitter) {
                return Err(ConfigError::invalid("backoff.jitter", "must be within 0.0..=1.0"));
            }
        }
        if self.stale_after_secs > 0 {
            if self.handler_timeout_ms == 0 {
                return Err(ConfigError::invalid(
                    "handler_timeout_ms",
                    "must be set while stale recovery is enabled",
                ));
            }
            if self.stale_after_secs.saturating_mul(1_000) <= self.handler_timeout_ms {
                return Err(ConfigError::invalid(
                    "stale_after_secs",
                    "must exceed handler_timeout_ms",
                ));
            }
        }
        Ok(())
    }

    /// Enqueue API using the configured default attempt budget.
    pub fn job_queue<S: JobStore>(&self, store: S) -> JobQueue<S> {
        JobQueue::new(store).with_default_max_attempts(self.default_max_attempts)
    }

    /// Runtime dispatcher settings.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_batch_size(self.batch_size)
            .with_handler_timeout(
                (self.handler_timeout_ms > 0).then(|| Duration::from_millis(self.handler_timeout_ms)),
            )
            .with_unroutable_policy(self.unroutable)
            .with_backoff(self.backoff.policy())
            .with_stale_after(
                (self.stale_after_secs > 0).then(|| Duration::from_secs(self.stale_after_secs)),
            )
    }
}

fn parse<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, format!("'{raw}': {e}")))
}

fn overlay<T, F>(lookup: &F, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *target = parse(key, &raw)?;
    }
    Ok(())
}

fn parse_strategy(raw: &str) -> Option<BackoffStrategy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "immediate" => Some(BackoffStrategy::Immediate),
        "fixed" => Some(BackoffStrategy::Fixed),
        "linear" => Some(BackoffStrategy::Linear),
        "exponential" => Some(BackoffStrategy::Exponential),
        _ => None,
    }
}
