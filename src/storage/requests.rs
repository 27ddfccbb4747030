//! MySQL implementation of the request store.
//!
//! Every operation runs through the transient-error retry wrapper. The
//! conditional UPDATEs return affected-row counts untouched; interpreting
//! zero is the caller's business.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use sqlx::mysql::MySqlPool;

use crate::error_handling::DatabaseError;
use crate::storage::{
    with_retry, DnsRequest, RequestStore, RequestType, RetryPolicy, Transition,
};

const SELECT_COLUMNS: &str = "SELECT id, target, type, status, created_at, updated_at, \
     activated_at, last_checked_at, next_check_at, expires_at, \
     last_check_result_json, fail_reason FROM dns_requests";

/// Request store over a MySQL pool.
pub struct MySqlRequestStore {
    pool: MySqlPool,
    retry: RetryPolicy,
}

impl MySqlRequestStore {
    /// Wraps a connected pool.
    pub fn new(pool: MySqlPool, retry: RetryPolicy) -> Self {
        MySqlRequestStore { pool, retry }
    }

    async fn fetch_by_id(&self, id: u64) -> Result<Option<DnsRequest>, DatabaseError> {
        let row = sqlx::query_as::<_, DnsRequest>(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}

#[async_trait]
impl RequestStore for MySqlRequestStore {
    async fn insert_request(
        &self,
        target: &str,
        kind: RequestType,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<DnsRequest, DatabaseError> {
        let id = with_retry(self.retry, "insert_request", || async {
            let result = sqlx::query(
                "INSERT INTO dns_requests \
                 (target, type, status, created_at, updated_at, expires_at) \
                 VALUES (?, ?, 'PENDING', ?, ?, ?)",
            )
            .bind(target)
            .bind(kind)
            .bind(now)
            .bind(now)
            .bind(expires_at)
            .execute(&self.pool)
            .await;
            match result {
                Ok(done) => Ok(done.last_insert_id()),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    Err(DatabaseError::DuplicateRequest {
                        kind: kind.as_str().to_string(),
                        target: target.to_string(),
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
        .await?;

        self.fetch_by_id(id)
            .await?
            .ok_or(DatabaseError::SqlError(sqlx::Error::RowNotFound))
    }

    async fn find_by_target(&self, target: &str) -> Result<Vec<DnsRequest>, DatabaseError> {
        with_retry(self.retry, "find_by_target", || async {
            let rows = sqlx::query_as::<_, DnsRequest>(&format!(
                "{SELECT_COLUMNS} WHERE target = ? ORDER BY id"
            ))
            .bind(target)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await
    }

    async fn find_by_id(&self, id: u64) -> Result<Option<DnsRequest>, DatabaseError> {
        with_retry(self.retry, "find_by_id", || self.fetch_by_id(id)).await
    }

    async fn find_pending_not_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DnsRequest>, DatabaseError> {
        with_retry(self.retry, "find_pending_not_expired", || async {
            let rows = sqlx::query_as::<_, DnsRequest>(&format!(
                "{SELECT_COLUMNS} WHERE status = 'PENDING' AND expires_at > ? ORDER BY id"
            ))
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        })
        .await
    }

    async fn find_last_created(
        &self,
        target: &str,
        kind: RequestType,
    ) -> Result<Option<DnsRequest>, DatabaseError> {
        with_retry(self.retry, "find_last_created", || async {
            let row = sqlx::query_as::<_, DnsRequest>(&format!(
                "{SELECT_COLUMNS} WHERE target = ? AND type = ? \
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            ))
            .bind(target)
            .bind(kind)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        })
        .await
    }

    async fn update_check_result(
        &self,
        id: u64,
        now: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
        result_json: &str,
    ) -> Result<u64, DatabaseError> {
        with_retry(self.retry, "update_check_result", || async {
            let done = sqlx::query(
                "UPDATE dns_requests \
                 SET last_checked_at = ?, next_check_at = ?, \
                     last_check_result_json = ?, updated_at = ? \
                 WHERE id = ? AND status = 'PENDING'",
            )
            .bind(now)
            .bind(next_check_at)
            .bind(result_json)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(done.rows_affected())
        })
        .await
    }

    async fn record_fail_reason(
        &self,
        id: u64,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        with_retry(self.retry, "record_fail_reason", || async {
            sqlx::query(
                "UPDATE dns_requests SET fail_reason = ?, updated_at = ? \
                 WHERE id = ? AND status = 'PENDING'",
            )
            .bind(reason)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn conditional_transition(
        &self,
        id: u64,
        now: DateTime<Utc>,
        transition: Transition,
    ) -> Result<u64, DatabaseError> {
        with_retry(self.retry, "conditional_transition", || {
            let transition = transition.clone();
            async move {
                let done = match transition {
                    Transition::Activate { activated_at } => {
                        sqlx::query(
                            "UPDATE dns_requests \
                             SET status = 'ACTIVE', activated_at = ?, updated_at = ? \
                             WHERE id = ? AND status = 'PENDING'",
                        )
                        .bind(activated_at)
                        .bind(now)
                        .bind(id)
                        .execute(&self.pool)
                        .await?
                    }
                    Transition::Expire { fail_reason } => {
                        sqlx::query(
                            "UPDATE dns_requests \
                             SET status = 'EXPIRED', fail_reason = ?, updated_at = ? \
                             WHERE id = ? AND status = 'PENDING'",
                        )
                        .bind(fail_reason)
                        .bind(now)
                        .bind(id)
                        .execute(&self.pool)
                        .await?
                    }
                };
                Ok(done.rows_affected())
            }
        })
        .await
    }

    async fn mark_domain_active(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        with_retry(self.retry, "mark_domain_active", || async {
            let result = sqlx::query(
                "INSERT INTO domain (name, active, created_at) VALUES (?, 1, ?)",
            )
            .bind(name)
            .bind(now)
            .execute(&self.pool)
            .await;
            match result {
                Ok(_) => Ok(()),
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    debug!("Domain {name} already recorded as active");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}
