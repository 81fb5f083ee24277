//! Backoff for writes that race for the SQLite write lock.
//!
//! The scheduler's lock `UPDATE` runs on the shared read pool, so under heavy
//! contention it can surface `SQLITE_BUSY` even with a busy timeout.

use rand::RngExt;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const MAX_ATTEMPTS: u32 = 12;
const BASE_DELAY_MS: u64 = 10;
const MAX_DELAY_MS: u64 = 2000;

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6), or a message saying as much.
pub(crate) fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    match sqlx_err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(Cow::into_owned);
            matches!(code.as_deref(), Some("5") | Some("6"))
                || mentions_lock(db_err.message())
        }
        other => mentions_lock(&other.to_string()),
    }
}

fn mentions_lock(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Delay before retry `attempt` (0-based): doubling from 10ms plus up to 25% jitter, capped at 2s.
fn backoff(attempt: u32) -> Duration {
    let base = BASE_DELAY_MS
        .saturating_mul(1u64 << attempt.min(20))
        .min(MAX_DELAY_MS);
    let jitter = rand::rng().random_range(0..=base / 4);
    Duration::from_millis((base + jitter).min(MAX_DELAY_MS))
}

/// Run `op`, retrying while it fails with a busy/locked error.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(err) if is_busy(&err) && attempt < MAX_ATTEMPTS => {
                let delay = backoff(attempt);
                attempt += 1;
                debug!(
                    op = op_name,
                    attempt,
                    max_attempts = MAX_ATTEMPTS,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                sleep(delay).await;
            }
            result => return result,
        }
    }
}
