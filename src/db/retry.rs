//! Bounded retry for transient database errors.
//!
//! Transactions against the catalog can fail with serialization
//! failures, deadlocks, or dropped connections when pack jobs overlap.
//! `do_retry` wraps a whole transaction body and re-runs it with
//! exponential backoff; the body must be deterministic with respect to
//! its inputs so a retry produces the same writes.

use std::future::Future;
use std::time::Duration;

use sea_orm::DbErr;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{PackError, Result};

const MAX_ATTEMPTS: u32 = 10;
const BASE_DELAY_MS: u64 = 100;
const MAX_DELAY_MS: u64 = 5_000;

/// Whether the database error is worth retrying.
pub fn is_transient(err: &DbErr) -> bool {
    let msg = err.to_string().to_ascii_lowercase();
    msg.contains("serialization failure")
        || msg.contains("deadlock")
        || msg.contains("connection reset")
        || msg.contains("connection closed")
        || msg.contains("timed out")
        || msg.contains("timeout")
        || msg.contains("database is locked")
        || msg.contains("database table is locked")
}

fn is_retryable(err: &PackError) -> bool {
    matches!(err, PackError::Db(db_err) if is_transient(db_err))
}

/// Run `op` up to [`MAX_ATTEMPTS`] times, backing off exponentially
/// between attempts when the failure is transient. Non-transient errors
/// and cancellation return immediately; cancellation is also honored at
/// every retry boundary.
pub async fn do_retry<T, F, Fut>(token: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(PackError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 < MAX_ATTEMPTS && is_retryable(&err) => {
                let delay = (BASE_DELAY_MS << attempt.min(10)).min(MAX_DELAY_MS);
                warn!(attempt, error = %err, delay_ms = delay, "transient database error, retrying");
                attempt += 1;
                tokio::select! {
                    _ = token.cancelled() => return Err(PackError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}
