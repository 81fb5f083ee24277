//! Retry scheduling policies.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::Job;

/// Default exponential backoff base in seconds.
pub const DEFAULT_BACKOFF_BASE: u32 = 5;

/// Decides when the next retry of a failed job becomes eligible.
///
/// Implementations must be monotonically non-decreasing in the number of
/// retries the original job already has.
pub trait RetryPolicy: Send + Sync {
    fn schedule_next_retry(&self, original: &Job, now: DateTime<Utc>) -> DateTime<Utc>;
}

/// `now + base^n` seconds, where `n` is the 1-based number of the retry
/// being scheduled (retries the original already has, plus one). The first
/// retry waits `base` seconds, then `base²`, `base³` and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExponentialRetryPolicy {
    #[serde(default = "default_base")]
    pub base: u32,
}

fn default_base() -> u32 {
    DEFAULT_BACKOFF_BASE
}

impl ExponentialRetryPolicy {
    pub fn new(base: u32) -> Self {
        Self { base }
    }

    /// Delay before the `retry_number`-th retry (1-based).
    pub fn delay_for_retry(&self, retry_number: u32) -> Duration {
        let secs = i64::from(self.base).saturating_pow(retry_number);
        Duration::try_seconds(secs).unwrap_or(Duration::MAX)
    }
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        Self {
            base: default_base(),
        }
    }
}

impl RetryPolicy for ExponentialRetryPolicy {
    fn schedule_next_retry(&self, original: &Job, now: DateTime<Utc>) -> DateTime<Utc> {
        let existing = u32::try_from(original.retry_job_ids().len()).unwrap_or(u32::MAX);
        now.checked_add_signed(self.delay_for_retry(existing.saturating_add(1)))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}
