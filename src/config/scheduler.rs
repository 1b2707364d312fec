//! Scheduler configuration structures.

use std::env;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;

/// Backing ordering queue selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueBackendConfig {
    /// In-memory queue handing tasks out in submission order.
    #[default]
    Fifo,
    /// In-memory queue handing out the highest priority first.
    Priority,
}

/// Retry hand-off policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicyConfig {
    /// Retry in place; re-queue only interrupted tasks.
    #[default]
    Immediate,
    /// Retry in place until `threshold` attempts, then re-queue.
    NowOrLater {
        /// Attempts after which a retry is handed to the backing queue.
        threshold: u32,
    },
}

/// Root scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Consumer threads started with the scheduler.
    pub consumer_threads: usize,
    /// Backing ordering queue.
    pub queue: QueueBackendConfig,
    /// Retry hand-off policy.
    pub retry: RetryPolicyConfig,
    /// Maximum tasks (and reservations) the backing queue holds.
    pub max_queue_depth: usize,
    /// Per-attempt transaction timeout in milliseconds.
    pub default_timeout_ms: u64,
    /// Timeout of unbounded transactions in milliseconds.
    pub unbounded_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            consumer_threads: 4,
            queue: QueueBackendConfig::default(),
            retry: RetryPolicyConfig::default(),
            max_queue_depth: 65_536,
            default_timeout_ms: 100,
            unbounded_timeout_ms: u64::MAX,
        }
    }
}

impl SchedulerConfig {
    /// Set the number of consumer threads.
    #[must_use]
    pub const fn with_consumer_threads(mut self, consumer_threads: usize) -> Self {
        self.consumer_threads = consumer_threads;
        self
    }

    /// Set the backing queue.
    #[must_use]
    pub const fn with_queue(mut self, queue: QueueBackendConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicyConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the backing queue depth limit.
    #[must_use]
    pub const fn with_max_queue_depth(mut self, max_queue_depth: usize) -> Self {
        self.max_queue_depth = max_queue_depth;
        self
    }

    /// Set the per-attempt transaction timeout.
    #[must_use]
    pub const fn with_default_timeout_ms(mut self, default_timeout_ms: u64) -> Self {
        self.default_timeout_ms = default_timeout_ms;
        self
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid value.
    pub fn validate(&self) -> Result<(), String> {
        if self.consumer_threads == 0 {
            return Err("consumer_threads must be greater than 0".into());
        }
        if self.max_queue_depth == 0 {
            return Err("max_queue_depth must be greater than 0".into());
        }
        if self.default_timeout_ms == 0 {
            return Err("default_timeout_ms must be greater than 0".into());
        }
        if self.unbounded_timeout_ms == 0 {
            return Err("unbounded_timeout_ms must be greater than 0".into());
        }
        if let RetryPolicyConfig::NowOrLater { threshold: 0 } = self.retry {
            return Err("retry threshold must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse scheduler configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from the environment, after loading `.env` if
    /// present. Unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Fails if a key holds an unparsable value or the result is invalid.
    pub fn from_env() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok().filter(|value| !value.is_empty()))
    }

    /// Build configuration from `lookup`, which maps an environment key to
    /// its value.
    ///
    /// # Errors
    ///
    /// Fails if a key holds an unparsable value or the result is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let mut cfg = Self::default();

        if let Some(value) = lookup("TXN_SCHEDULER_CONSUMER_THREADS") {
            cfg.consumer_threads = parse_key("TXN_SCHEDULER_CONSUMER_THREADS", &value)?;
        }
        if let Some(value) = lookup("TXN_SCHEDULER_QUEUE") {
            cfg.queue = match value.to_ascii_lowercase().as_str() {
                "fifo" => QueueBackendConfig::Fifo,
                "priority" => QueueBackendConfig::Priority,
                other => anyhow::bail!("TXN_SCHEDULER_QUEUE: unknown queue `{other}`"),
            };
        }
        if let Some(value) = lookup("TXN_SCHEDULER_RETRY") {
            cfg.retry = match value.to_ascii_lowercase().as_str() {
                "immediate" => RetryPolicyConfig::Immediate,
                "now_or_later" => {
                    let threshold = lookup("TXN_SCHEDULER_RETRY_THRESHOLD")
                        .map(|v| parse_key("TXN_SCHEDULER_RETRY_THRESHOLD", &v))
                        .transpose()?
                        .unwrap_or(DEFAULT_RETRY_THRESHOLD);
                    RetryPolicyConfig::NowOrLater { threshold }
                }
                other => anyhow::bail!("TXN_SCHEDULER_RETRY: unknown retry policy `{other}`"),
            };
        }
        if let Some(value) = lookup("TXN_SCHEDULER_MAX_QUEUE_DEPTH") {
            cfg.max_queue_depth = parse_key("TXN_SCHEDULER_MAX_QUEUE_DEPTH", &value)?;
        }
        if let Some(value) = lookup("TXN_TIMEOUT_MS") {
            cfg.default_timeout_ms = parse_key("TXN_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("TXN_UNBOUNDED_TIMEOUT_MS") {
            cfg.unbounded_timeout_ms = parse_key("TXN_UNBOUNDED_TIMEOUT_MS", &value)?;
        }

        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }
}

/// Threshold used when `now_or_later` is selected without one.
pub const DEFAULT_RETRY_THRESHOLD: u32 = 3;

fn parse_key<T>(key: &str, value: &str) -> AppResult<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{key}: invalid value `{value}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = SchedulerConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.consumer_threads, 4);
        assert_eq!(cfg.default_timeout_ms, 100);
        assert_eq!(cfg.retry, RetryPolicyConfig::Immediate);
    }

    #[test]
    fn test_from_json_str_fills_defaults() {
        let cfg = SchedulerConfig::from_json_str(
            r#"{"consumer_threads": 2, "queue": "priority", "retry": {"kind": "now_or_later", "threshold": 5}}"#,
        )
        .unwrap();
        assert_eq!(cfg.consumer_threads, 2);
        assert_eq!(cfg.queue, QueueBackendConfig::Priority);
        assert_eq!(cfg.retry, RetryPolicyConfig::NowOrLater { threshold: 5 });
        assert_eq!(cfg.max_queue_depth, 65_536);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        assert!(SchedulerConfig::default().with_consumer_threads(0).validate().is_err());
        assert!(SchedulerConfig::default().with_max_queue_depth(0).validate().is_err());
        assert!(SchedulerConfig::default().with_default_timeout_ms(0).validate().is_err());
        let err = SchedulerConfig::default()
            .with_retry(RetryPolicyConfig::NowOrLater { threshold: 0 })
            .validate()
            .unwrap_err();
        assert!(err.contains("threshold"));
        assert!(SchedulerConfig::from_json_str(r#"{"consumer_threads": 0}"#).is_err());
    }

    #[test]
    fn test_from_lookup_reads_environment_keys() {
        let cfg = SchedulerConfig::from_lookup(lookup_from(&[
            ("TXN_SCHEDULER_CONSUMER_THREADS", "8"),
            ("TXN_SCHEDULER_QUEUE", "Priority"),
            ("TXN_SCHEDULER_RETRY", "now_or_later"),
            ("TXN_SCHEDULER_RETRY_THRESHOLD", "2"),
            ("TXN_TIMEOUT_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(cfg.consumer_threads, 8);
        assert_eq!(cfg.queue, QueueBackendConfig::Priority);
        assert_eq!(cfg.retry, RetryPolicyConfig::NowOrLater { threshold: 2 });
        assert_eq!(cfg.default_timeout_ms, 250);
        assert_eq!(cfg.unbounded_timeout_ms, u64::MAX);
    }

    #[test]
    fn test_from_lookup_reports_bad_values() {
        let err = SchedulerConfig::from_lookup(lookup_from(&[("TXN_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("TXN_TIMEOUT_MS"));

        let err = SchedulerConfig::from_lookup(lookup_from(&[("TXN_SCHEDULER_QUEUE", "lifo")])).unwrap_err();
        assert!(err.to_string().contains("lifo"));
    }
}
