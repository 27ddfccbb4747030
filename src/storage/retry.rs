//! Transient database error retry.
//!
//! Store operations run through [`with_retry`], which retries
//! connection-level failures with linear backoff and lets everything else
//! (constraint violations, bad SQL, missing rows) fail immediately.

use std::future::Future;
use std::time::Duration;

use log::warn;

use crate::config::DbSettings;
use crate::error_handling::DatabaseError;

/// How many times to retry and how long to wait between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retry attempts after the initial try.
    pub count: u32,
    /// Base delay; attempt `n` waits `delay × (n + 1)`.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Policy from deployment settings.
    pub fn from_settings(db: &DbSettings) -> Self {
        RetryPolicy {
            count: db.query_retry_count,
            delay: db.query_retry_delay,
        }
    }

    /// Backoff before retry attempt `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.delay * (attempt + 1)
    }
}

/// Runs `operation`, retrying transient failures per `policy`.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T, DatabaseError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DatabaseError>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.count => {
                let backoff = policy.backoff(attempt);
                warn!(
                    "Transient database error in {op_name} (attempt {}/{}): {e}; retrying in {:?}",
                    attempt + 1,
                    policy.count,
                    backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            count: 3,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_backoff_is_linear() {
        let policy = RetryPolicy {
            count: 3,
            delay: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let result = with_retry(policy(), "op", || async { Ok::<_, DatabaseError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_transient_errors_retried_until_success() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(policy(), "op", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DatabaseError::SqlError(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transient_errors_exhaust_and_bubble() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(policy(), "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(DatabaseError::SqlError(sqlx::Error::PoolTimedOut)) }
        })
        .await;
        assert!(result.is_err());
        // Initial try plus three retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_permanent_errors_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(policy(), "op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(DatabaseError::SqlError(sqlx::Error::RowNotFound)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
