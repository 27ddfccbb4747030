//! Request persistence.
//!
//! The store owns every durable fact about a request. All transitions out
//! of `PENDING` go through [`RequestStore::conditional_transition`], whose
//! `WHERE status = 'PENDING'` guard is the only mechanism preventing double
//! promotion or expiry when the intake-time check races a background tick.

mod models;
mod pool;
mod requests;
mod retry;

pub use models::{DnsRequest, RequestStatus, RequestType};
pub use pool::{init_db_pool, run_migrations};
pub use requests::MySqlRequestStore;
pub use retry::{with_retry, RetryPolicy};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error_handling::DatabaseError;

/// A state transition out of `PENDING`.
#[derive(Debug, Clone)]
pub enum Transition {
    /// `PENDING → ACTIVE`; sets `activated_at`.
    Activate {
        /// Promotion time.
        activated_at: DateTime<Utc>,
    },
    /// `PENDING → EXPIRED`; sets `fail_reason`.
    Expire {
        /// Why the request expired.
        fail_reason: String,
    },
}

/// Contract between the service and its relational store.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Inserts a new `PENDING` row. Fails with
    /// [`DatabaseError::DuplicateRequest`] when `(target, type)` exists.
    async fn insert_request(
        &self,
        target: &str,
        kind: RequestType,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<DnsRequest, DatabaseError>;

    /// All rows for a target, any type.
    async fn find_by_target(&self, target: &str) -> Result<Vec<DnsRequest>, DatabaseError>;

    /// One row by id.
    async fn find_by_id(&self, id: u64) -> Result<Option<DnsRequest>, DatabaseError>;

    /// All `PENDING` rows whose deadline is still in the future. Used by
    /// the scheduler to reconstruct jobs at boot.
    async fn find_pending_not_expired(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<DnsRequest>, DatabaseError>;

    /// The most recently created row for `(target, type)`, for the intake
    /// cooldown check.
    async fn find_last_created(
        &self,
        target: &str,
        kind: RequestType,
    ) -> Result<Option<DnsRequest>, DatabaseError>;

    /// Persists a check result while the row is still `PENDING`. Returns
    /// affected rows; zero means the row raced into a terminal state and
    /// the caller should stop.
    async fn update_check_result(
        &self,
        id: u64,
        now: DateTime<Utc>,
        next_check_at: DateTime<Utc>,
        result_json: &str,
    ) -> Result<u64, DatabaseError>;

    /// Records a failure note without changing status. No-op on rows that
    /// are no longer `PENDING`.
    async fn record_fail_reason(
        &self,
        id: u64,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), DatabaseError>;

    /// Applies a transition guarded by `status = 'PENDING'`. Returns
    /// affected rows; zero means another actor transitioned first.
    async fn conditional_transition(
        &self,
        id: u64,
        now: DateTime<Utc>,
        transition: Transition,
    ) -> Result<u64, DatabaseError>;

    /// Records a domain's first promotion to ACTIVE. Duplicate names are
    /// silently ignored.
    async fn mark_domain_active(&self, name: &str, now: DateTime<Utc>)
        -> Result<(), DatabaseError>;
}
