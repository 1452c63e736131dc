//! Engine configuration.
//!
//! [`QueueConfig::default`] gives a working configuration. [`QueueConfig::from_env`] overlays
//! the following environment variables, ignoring empty values:
//!
//! | Variable | Default |
//! |---|---|
//! | `JOBQUEUE_MAX_ATTEMPTS` | `3` |
//! | `JOBQUEUE_RETRY_BACKOFF` | `constant` (or `linear`, `exponential`) |
//! | `JOBQUEUE_RETRY_BACKOFF_MS` | `1000` |
//! | `JOBQUEUE_RETRY_BACKOFF_MAX_MS` | unset |
//! | `JOBQUEUE_MAX_CONCURRENT_JOBS` | `4` |
//! | `JOBQUEUE_QUEUE_CAPACITY` | `256` |
//! | `JOBQUEUE_WORK_TIMEOUT_SECS` | `300` |
//! | `JOBQUEUE_RECOVERY_GRACE_SECS` | `60` |
//! | `JOBQUEUE_RECOVERY_SCHEDULE` | `0/30 * * * * *` |
//! | `DATABASE_URL` | `sqlite://jobs.db?mode=rwc` |
use std::{fmt::Display, str::FromStr, time::Duration};

use chrono::TimeDelta;
use thiserror::Error;

use crate::{backoff::BackoffStrategy, retry::RetryPolicy};

pub const MAX_ATTEMPTS: &str = "JOBQUEUE_MAX_ATTEMPTS";
pub const RETRY_BACKOFF: &str = "JOBQUEUE_RETRY_BACKOFF";
pub const RETRY_BACKOFF_MS: &str = "JOBQUEUE_RETRY_BACKOFF_MS";
pub const RETRY_BACKOFF_MAX_MS: &str = "JOBQUEUE_RETRY_BACKOFF_MAX_MS";
pub const MAX_CONCURRENT_JOBS: &str = "JOBQUEUE_MAX_CONCURRENT_JOBS";
pub const QUEUE_CAPACITY: &str = "JOBQUEUE_QUEUE_CAPACITY";
pub const WORK_TIMEOUT_SECS: &str = "JOBQUEUE_WORK_TIMEOUT_SECS";
pub const RECOVERY_GRACE_SECS: &str = "JOBQUEUE_RECOVERY_GRACE_SECS";
pub const RECOVERY_SCHEDULE: &str = "JOBQUEUE_RECOVERY_SCHEDULE";
pub const DATABASE_URL: &str = "DATABASE_URL";

const DEFAULT_RECOVERY_SCHEDULE: &str = "0/30 * * * * *";
const DEFAULT_DATABASE_URL: &str = "sqlite://jobs.db?mode=rwc";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// The delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffConfig {
    Constant {
        delay: TimeDelta,
    },
    Linear {
        factor: TimeDelta,
        max: Option<TimeDelta>,
    },
    Exponential {
        base: TimeDelta,
        max: Option<TimeDelta>,
    },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Constant {
            delay: RetryPolicy::DEFAULT_BACKOFF,
        }
    }
}

impl BackoffConfig {
    fn from_parts(
        kind: &str,
        delay: TimeDelta,
        max: Option<TimeDelta>,
    ) -> Result<Self, ConfigError> {
        match kind {
            "constant" => Ok(Self::Constant { delay }),
            "linear" => Ok(Self::Linear { factor: delay, max }),
            "exponential" => Ok(Self::Exponential { base: delay, max }),
            other => Err(ConfigError::InvalidValue {
                key: RETRY_BACKOFF.to_owned(),
                message: format!("unknown backoff '{other}'"),
            }),
        }
    }

    /// Builds the [`RetryPolicy`] allowing `max_attempts` attempts with this delay curve.
    pub fn retry_policy(self, max_attempts: u32) -> RetryPolicy {
        match self {
            Self::Constant { delay } => {
                RetryPolicy::new(max_attempts, BackoffStrategy::constant(delay))
            }
            Self::Linear { factor, max: None } => {
                RetryPolicy::new(max_attempts, BackoffStrategy::linear(factor))
            }
            Self::Linear {
                factor,
                max: Some(max),
            } => RetryPolicy::new(max_attempts, BackoffStrategy::linear(factor).with_max(max)),
            Self::Exponential { base, max: None } => {
                RetryPolicy::new(max_attempts, BackoffStrategy::exponential(base))
            }
            Self::Exponential {
                base,
                max: Some(max),
            } => RetryPolicy::new(
                max_attempts,
                BackoffStrategy::exponential(base).with_max(max),
            ),
        }
    }
}

/// Configuration of a [`crate::JobQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Total attempts per job, including the first.
    pub max_attempts: u32,
    pub retry_backoff: BackoffConfig,
    /// Size of the worker pool, the bound on concurrent work function invocations.
    pub max_concurrent_jobs: usize,
    /// Dispatches buffered for the workers before submissions defer to the recovery scan.
    pub queue_capacity: usize,
    pub work_function_timeout: Duration,
    /// How old a queued job must be before the recovery scan re-offers it.
    pub crash_recovery_grace_period: TimeDelta,
    pub recovery_schedule: cron::Schedule,
    /// Connection string for durable stores.
    pub database_url: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: RetryPolicy::DEFAULT_MAX_ATTEMPTS,
            retry_backoff: BackoffConfig::default(),
            max_concurrent_jobs: 4,
            queue_capacity: 256,
            work_function_timeout: Duration::from_secs(300),
            crash_recovery_grace_period: TimeDelta::seconds(60),
            recovery_schedule: cron::Schedule::from_str(DEFAULT_RECOVERY_SCHEDULE)
                .expect("default recovery schedule is valid"),
            database_url: DEFAULT_DATABASE_URL.to_owned(),
        }
    }
}

impl QueueConfig {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads the configuration from `lookup`, falling back to the defaults for missing or empty
    /// values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let max_attempts = parse(&var, MAX_ATTEMPTS)?.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(invalid(MAX_ATTEMPTS, "must be at least 1"));
        }
        let max_concurrent_jobs =
            parse(&var, MAX_CONCURRENT_JOBS)?.unwrap_or(defaults.max_concurrent_jobs);
        if max_concurrent_jobs == 0 {
            return Err(invalid(MAX_CONCURRENT_JOBS, "must be at least 1"));
        }
        let queue_capacity = parse(&var, QUEUE_CAPACITY)?.unwrap_or(defaults.queue_capacity);
        if queue_capacity == 0 {
            return Err(invalid(QUEUE_CAPACITY, "must be at least 1"));
        }

        let retry_backoff = match (
            var(RETRY_BACKOFF),
            parse::<i64>(&var, RETRY_BACKOFF_MS)?,
            parse::<i64>(&var, RETRY_BACKOFF_MAX_MS)?,
        ) {
            (None, None, None) => defaults.retry_backoff,
            (kind, delay, max) => BackoffConfig::from_parts(
                kind.as_deref().unwrap_or("constant").trim(),
                delay
                    .map(TimeDelta::milliseconds)
                    .unwrap_or(RetryPolicy::DEFAULT_BACKOFF),
                max.map(TimeDelta::milliseconds),
            )?,
        };

        let work_function_timeout = parse(&var, WORK_TIMEOUT_SECS)?
            .map(Duration::from_secs)
            .unwrap_or(defaults.work_function_timeout);
        let crash_recovery_grace_period = parse(&var, RECOVERY_GRACE_SECS)?
            .map(TimeDelta::seconds)
            .unwrap_or(defaults.crash_recovery_grace_period);
        let recovery_schedule =
            parse(&var, RECOVERY_SCHEDULE)?.unwrap_or(defaults.recovery_schedule);
        let database_url = var(DATABASE_URL).unwrap_or(defaults.database_url);

        Ok(Self {
            max_attempts,
            retry_backoff,
            max_concurrent_jobs,
            queue_capacity,
            work_function_timeout,
            crash_recovery_grace_period,
            recovery_schedule,
            database_url,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_backoff.retry_policy(self.max_attempts)
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    pub fn with_retry_backoff(self, retry_backoff: BackoffConfig) -> Self {
        Self {
            retry_backoff,
            ..self
        }
    }

    pub fn with_max_concurrent_jobs(self, max_concurrent_jobs: usize) -> Self {
        Self {
            max_concurrent_jobs,
            ..self
        }
    }

    pub fn with_queue_capacity(self, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..self
        }
    }

    pub fn with_work_function_timeout(self, work_function_timeout: Duration) -> Self {
        Self {
            work_function_timeout,
            ..self
        }
    }

    pub fn with_crash_recovery_grace_period(self, crash_recovery_grace_period: TimeDelta) -> Self {
        Self {
            crash_recovery_grace_period,
            ..self
        }
    }

    pub fn with_recovery_schedule(self, recovery_schedule: cron::Schedule) -> Self {
        Self {
            recovery_schedule,
            ..self
        }
    }

    pub fn with_database_url(self, database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..self
        }
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_owned(),
        message: message.into(),
    }
}

fn parse<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|err| invalid(key, format!("invalid value '{value}': {err}"))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use fxhash::FxHashMap;

    use super::*;
    use crate::{retry::RetryDecision, work::WorkError};

    fn load(vars: &[(&str, &str)]) -> Result<QueueConfig, ConfigError> {
        let vars: FxHashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        QueueConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]).unwrap();

        assert_eq!(config.max_attempts, 3);
        assert_eq!(
            config.retry_backoff,
            BackoffConfig::Constant {
                delay: TimeDelta::seconds(1)
            }
        );
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.queue_capacity, 256);
        assert_eq!(config.work_function_timeout, Duration::from_secs(300));
        assert_eq!(config.crash_recovery_grace_period, TimeDelta::seconds(60));
        assert_eq!(config.database_url, "sqlite://jobs.db?mode=rwc");
    }

    #[test]
    fn values_are_read_from_lookup() {
        let config = load(&[
            (MAX_ATTEMPTS, "5"),
            (RETRY_BACKOFF, "exponential"),
            (RETRY_BACKOFF_MS, "200"),
            (RETRY_BACKOFF_MAX_MS, "1000"),
            (MAX_CONCURRENT_JOBS, "2"),
            (QUEUE_CAPACITY, "16"),
            (WORK_TIMEOUT_SECS, "30"),
            (RECOVERY_GRACE_SECS, "10"),
            (RECOVERY_SCHEDULE, "0 * * * * *"),
            (DATABASE_URL, "sqlite::memory:"),
        ])
        .unwrap();

        assert_eq!(config.max_attempts, 5);
        assert_eq!(
            config.retry_backoff,
            BackoffConfig::Exponential {
                base: TimeDelta::milliseconds(200),
                max: Some(TimeDelta::seconds(1)),
            }
        );
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.work_function_timeout, Duration::from_secs(30));
        assert_eq!(config.crash_recovery_grace_period, TimeDelta::seconds(10));
        assert_eq!(config.database_url, "sqlite::memory:");
    }

    #[test]
    fn empty_values_are_ignored() {
        let config = load(&[(MAX_ATTEMPTS, ""), (DATABASE_URL, "  ")]).unwrap();

        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.database_url, "sqlite://jobs.db?mode=rwc");
    }

    #[test]
    fn backoff_delay_without_kind_is_constant() {
        let config = load(&[(RETRY_BACKOFF_MS, "50")]).unwrap();

        assert_eq!(
            config.retry_backoff,
            BackoffConfig::Constant {
                delay: TimeDelta::milliseconds(50)
            }
        );
    }

    #[test]
    fn invalid_values_name_the_key() {
        assert_eq!(
            load(&[(MAX_ATTEMPTS, "many")]).unwrap_err(),
            ConfigError::InvalidValue {
                key: MAX_ATTEMPTS.to_owned(),
                message: "invalid value 'many': invalid digit found in string".to_owned(),
            }
        );
        assert!(matches!(
            load(&[(RETRY_BACKOFF, "fibonacci")]),
            Err(ConfigError::InvalidValue { key, .. }) if key == RETRY_BACKOFF
        ));
        assert!(matches!(
            load(&[(MAX_CONCURRENT_JOBS, "0")]),
            Err(ConfigError::InvalidValue { key, .. }) if key == MAX_CONCURRENT_JOBS
        ));
        assert!(matches!(
            load(&[(RECOVERY_SCHEDULE, "whenever")]),
            Err(ConfigError::InvalidValue { key, .. }) if key == RECOVERY_SCHEDULE
        ));
    }

    #[test]
    fn retry_policy_follows_config() {
        let policy = QueueConfig::default()
            .with_max_attempts(2)
            .with_retry_backoff(BackoffConfig::Linear {
                factor: TimeDelta::milliseconds(100),
                max: None,
            })
            .retry_policy();
        let error = WorkError::transient("flaky");

        assert_eq!(
            policy.decide(1, &error),
            RetryDecision::RetryAfter(TimeDelta::milliseconds(100))
        );
        assert_eq!(policy.decide(2, &error), RetryDecision::GiveUp);
    }
}
