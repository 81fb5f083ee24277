//! Queue and worker configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::DEFAULT_BACKOFF_BASE;
use crate::logging::LoggingSettings;
use crate::{Error, Result};

/// Per-queue limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Jobs of this queue a single worker runs at once.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
        }
    }
}

/// Configuration for a queue worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    /// Lock owner name; must be unique among live workers.
    #[serde(default = "default_worker_name")]
    pub worker_name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Jobs this worker runs at once, across all queues.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_retry_backoff_base")]
    pub retry_backoff_base: u32,
    /// Only poll these queues. Empty means all.
    #[serde(default)]
    pub restricted_queues: Vec<String>,
    #[serde(default)]
    pub excluded_queues: Vec<String>,
    #[serde(default)]
    pub queue_options: HashMap<String, QueueOptions>,
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_database_url() -> String {
    "sqlite:jobq.db?mode=rwc".to_string()
}

fn default_worker_name() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .ok()
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| "worker".to_string());
    format!("{}-{}", host, uuid::Uuid::new_v4())
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_retry_backoff_base() -> u32 {
    DEFAULT_BACKOFF_BASE
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            worker_name: default_worker_name(),
            poll_interval_ms: default_poll_interval_ms(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            retry_backoff_base: default_retry_backoff_base(),
            restricted_queues: Vec::new(),
            excluded_queues: Vec::new(),
            queue_options: HashMap::new(),
            log_dir: None,
        }
    }
}

impl QueueConfig {
    /// Load `.env` (if present) and read `JOBQ_*` variables over the defaults.
    ///
    /// Supported env vars:
    /// - `JOBQ_DATABASE_URL`
    /// - `JOBQ_WORKER_NAME`
    /// - `JOBQ_POLL_INTERVAL_MS`
    /// - `JOBQ_MAX_CONCURRENT_JOBS`
    /// - `JOBQ_RETRY_BACKOFF_BASE`
    /// - `JOBQ_RESTRICTED_QUEUES`, `JOBQ_EXCLUDED_QUEUES` (comma separated)
    /// - `JOBQ_QUEUE_MAX_CONCURRENT_JOBS` (e.g. "mail=2,video=1")
    /// - `JOBQ_LOG_DIR`
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(url) = var("JOBQ_DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(name) = var("JOBQ_WORKER_NAME") {
            config.worker_name = name.trim().to_string();
        }
        if let Some(value) = var("JOBQ_POLL_INTERVAL_MS") {
            config.poll_interval_ms = parse_number("JOBQ_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = var("JOBQ_MAX_CONCURRENT_JOBS") {
            config.max_concurrent_jobs = parse_number("JOBQ_MAX_CONCURRENT_JOBS", &value)?;
        }
        if let Some(value) = var("JOBQ_RETRY_BACKOFF_BASE") {
            config.retry_backoff_base = parse_number("JOBQ_RETRY_BACKOFF_BASE", &value)?;
        }
        if let Some(value) = var("JOBQ_RESTRICTED_QUEUES") {
            config.restricted_queues = split_list(&value);
        }
        if let Some(value) = var("JOBQ_EXCLUDED_QUEUES") {
            config.excluded_queues = split_list(&value);
        }
        if let Some(value) = var("JOBQ_QUEUE_MAX_CONCURRENT_JOBS") {
            for entry in split_list(&value) {
                let (queue, limit) = entry.split_once('=').ok_or_else(|| {
                    Error::config(format!(
                        "JOBQ_QUEUE_MAX_CONCURRENT_JOBS entry '{}' is not queue=limit",
                        entry
                    ))
                })?;
                config.queue_options.insert(
                    queue.trim().to_string(),
                    QueueOptions {
                        max_concurrent_jobs: parse_number(
                            "JOBQ_QUEUE_MAX_CONCURRENT_JOBS",
                            limit,
                        )?,
                    },
                );
            }
        }
        if let Some(dir) = var("JOBQ_LOG_DIR") {
            config.log_dir = Some(dir);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_name.is_empty() {
            return Err(Error::config("worker name must not be empty"));
        }
        if self.max_concurrent_jobs == 0 {
            return Err(Error::config("max_concurrent_jobs must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("poll_interval_ms must be at least 1"));
        }
        Ok(())
    }

    /// Per-queue limit, if one is configured.
    pub fn queue_limit(&self, queue: &str) -> Option<usize> {
        self.queue_options
            .get(queue)
            .map(|options| options.max_concurrent_jobs)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn logging_settings(&self) -> LoggingSettings {
        LoggingSettings {
            log_dir: self.log_dir.as_ref().map(PathBuf::from),
            ..LoggingSettings::default()
        }
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::config(format!("{} has invalid value '{}': {}", key, value, e)))
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.database_url, "sqlite:jobq.db?mode=rwc");
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.retry_backoff_base, 5);
        assert!(config.restricted_queues.is_empty());
        assert!(!config.worker_name.is_empty());
    }

    #[test]
    fn test_worker_names_are_unique() {
        assert_ne!(default_worker_name(), default_worker_name());
    }

    #[test]
    fn test_serde_defaults() {
        let config: QueueConfig =
            serde_json::from_str(r#"{"queue_options": {"mail": {}}}"#).unwrap();
        assert_eq!(config.max_concurrent_jobs, 4);
        assert_eq!(config.queue_limit("mail"), Some(4));
        assert_eq!(config.queue_limit("other"), None);
    }

    #[test]
    fn test_from_vars() {
        let config = QueueConfig::from_vars(vars(&[
            ("JOBQ_WORKER_NAME", "w-1"),
            ("JOBQ_POLL_INTERVAL_MS", "250"),
            ("JOBQ_MAX_CONCURRENT_JOBS", "2"),
            ("JOBQ_RESTRICTED_QUEUES", "mail, video,,"),
            ("JOBQ_QUEUE_MAX_CONCURRENT_JOBS", "video=1"),
            ("JOBQ_LOG_DIR", "/tmp/jobq-logs"),
        ]))
        .unwrap();

        assert_eq!(config.worker_name, "w-1");
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(config.max_concurrent_jobs, 2);
        assert_eq!(config.restricted_queues, vec!["mail", "video"]);
        assert_eq!(config.queue_limit("video"), Some(1));
        assert_eq!(
            config.logging_settings().log_dir,
            Some(PathBuf::from("/tmp/jobq-logs"))
        );
    }

    #[test]
    fn test_invalid_numbers_are_configuration_errors() {
        let err = QueueConfig::from_vars(vars(&[("JOBQ_MAX_CONCURRENT_JOBS", "many")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = QueueConfig::from_vars(vars(&[("JOBQ_QUEUE_MAX_CONCURRENT_JOBS", "video")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = QueueConfig::from_vars(vars(&[("JOBQ_MAX_CONCURRENT_JOBS", "0")])).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
