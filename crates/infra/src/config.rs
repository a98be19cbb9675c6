//! Worker configuration loaded from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::queue::DEFAULT_KEY_PREFIX;
use crate::queue::postgres::DEFAULT_TABLE;
use crate::queue::record::{DEFAULT_LOCK_DURATION, DEFAULT_RETRY_ATTEMPTS, LeasePolicy};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown queue backend `{0}` (expected memory, postgres or redis)")]
    UnknownBackend(String),

    #[error("{0} must be set for the selected queue backend")]
    Missing(&'static str),

    #[error("invalid {var}=`{value}`: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Which store backs the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    Memory,
    Postgres { database_url: String, table: String },
    Redis { redis_url: String, key_prefix: String },
}

impl QueueBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Postgres { .. } => "postgres",
            Self::Redis { .. } => "redis",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub backend: QueueBackend,
    pub lease: LeasePolicy,
    pub poll_interval: Duration,
    /// Capacity of every inter-stage channel.
    pub channel_capacity: usize,
    /// Where ingested sources are materialised.
    pub temp_folder: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            lease: LeasePolicy::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            temp_folder: default_temp_folder(),
        }
    }
}

impl WorkerConfig {
    /// Read the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let backend = match get("QUEUE_BACKEND").as_deref().unwrap_or("memory") {
            "memory" => QueueBackend::Memory,
            "postgres" => QueueBackend::Postgres {
                database_url: get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?,
                table: get("QUEUE_TABLE").unwrap_or_else(|| DEFAULT_TABLE.to_string()),
            },
            "redis" => QueueBackend::Redis {
                redis_url: get("REDIS_URL").ok_or(ConfigError::Missing("REDIS_URL"))?,
                key_prefix: get("QUEUE_KEY_PREFIX").unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            },
            other => return Err(ConfigError::UnknownBackend(other.to_string())),
        };

        let retry_attempts = parse_or("QUEUE_RETRY_ATTEMPTS", get("QUEUE_RETRY_ATTEMPTS"), DEFAULT_RETRY_ATTEMPTS)?;
        let lock_secs = parse_or(
            "QUEUE_LOCK_DURATION_SECS",
            get("QUEUE_LOCK_DURATION_SECS"),
            DEFAULT_LOCK_DURATION.as_secs(),
        )?;
        let poll_ms = parse_or(
            "WORKER_POLL_INTERVAL_MS",
            get("WORKER_POLL_INTERVAL_MS"),
            DEFAULT_POLL_INTERVAL.as_millis() as u64,
        )?;
        let channel_capacity = parse_or(
            "PIPELINE_CHANNEL_CAPACITY",
            get("PIPELINE_CHANNEL_CAPACITY"),
            DEFAULT_CHANNEL_CAPACITY,
        )?;

        if retry_attempts == 0 {
            return Err(ConfigError::Invalid {
                var: "QUEUE_RETRY_ATTEMPTS",
                value: "0".into(),
                reason: "at least one delivery attempt is required".into(),
            });
        }
        if lock_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "QUEUE_LOCK_DURATION_SECS",
                value: "0".into(),
                reason: "lock duration must be positive".into(),
            });
        }

        Ok(Self {
            backend,
            lease: LeasePolicy::new(retry_attempts, Duration::from_secs(lock_secs)),
            poll_interval: Duration::from_millis(poll_ms),
            channel_capacity,
            temp_folder: get("AUDIT_TEMP_FOLDER")
                .map(PathBuf::from)
                .unwrap_or_else(default_temp_folder),
        })
    }
}

fn default_temp_folder() -> PathBuf {
    std::env::temp_dir().join("auditflow")
}

fn parse_or<T>(var: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        WorkerConfig::from_lookup(|k| vars.get(k).cloned())
    }

    #[test]
    fn defaults_to_the_memory_backend() {
        let config = load(&[]).unwrap();

        assert_eq!(config.backend, QueueBackend::Memory);
        assert_eq!(config.lease, LeasePolicy::default());
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.channel_capacity, 1);
        assert!(config.temp_folder.ends_with("auditflow"));
    }

    #[test]
    fn postgres_requires_a_database_url() {
        assert_eq!(load(&[("QUEUE_BACKEND", "postgres")]), Err(ConfigError::Missing("DATABASE_URL")));

        let config = load(&[
            ("QUEUE_BACKEND", "postgres"),
            ("DATABASE_URL", "postgres://localhost/audits"),
            ("QUEUE_TABLE", "jobs"),
        ])
        .unwrap();
        assert_eq!(
            config.backend,
            QueueBackend::Postgres {
                database_url: "postgres://localhost/audits".into(),
                table: "jobs".into(),
            }
        );
    }

    #[test]
    fn redis_uses_the_default_prefix() {
        let config = load(&[("QUEUE_BACKEND", "redis"), ("REDIS_URL", "redis://127.0.0.1/")]).unwrap();

        assert_eq!(config.backend.name(), "redis");
        assert!(matches!(config.backend, QueueBackend::Redis { ref key_prefix, .. } if key_prefix == DEFAULT_KEY_PREFIX));
    }

    #[test]
    fn numeric_overrides_are_parsed() {
        let config = load(&[
            ("QUEUE_RETRY_ATTEMPTS", "5"),
            ("QUEUE_LOCK_DURATION_SECS", "30"),
            ("WORKER_POLL_INTERVAL_MS", "250"),
            ("PIPELINE_CHANNEL_CAPACITY", "4"),
            ("AUDIT_TEMP_FOLDER", "/var/tmp/audits"),
        ])
        .unwrap();

        assert_eq!(config.lease, LeasePolicy::new(5, Duration::from_secs(30)));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.channel_capacity, 4);
        assert_eq!(config.temp_folder, PathBuf::from("/var/tmp/audits"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            load(&[("QUEUE_RETRY_ATTEMPTS", "three")]),
            Err(ConfigError::Invalid { var: "QUEUE_RETRY_ATTEMPTS", .. })
        ));
        assert!(matches!(
            load(&[("QUEUE_RETRY_ATTEMPTS", "0")]),
            Err(ConfigError::Invalid { var: "QUEUE_RETRY_ATTEMPTS", .. })
        ));
        assert!(matches!(
            load(&[("QUEUE_LOCK_DURATION_SECS", "0")]),
            Err(ConfigError::Invalid { var: "QUEUE_LOCK_DURATION_SECS", .. })
        ));
        assert_eq!(load(&[("QUEUE_BACKEND", "sqs")]), Err(ConfigError::UnknownBackend("sqs".into())));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[("QUEUE_BACKEND", "  "), ("WORKER_POLL_INTERVAL_MS", "")]).unwrap();
        assert_eq!(config.backend, QueueBackend::Memory);
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
    }
}
