//! Boundary traits
//!
//! The billing service, workers and aggregator only see these; Postgres,
//! Redis and in-memory backends implement them.

use crate::models::{
    Artifact, Delivery, DiscountCode, EntryType, JobDescriptor, JobOutcome, LedgerEntry, NackOutcome,
    NewDiscountCode, Operation, OperationStatus, ProviderResult, ProviderStatus, QueueDepth,
    Reservation, ReservationDraft, Resolution, RetryPolicy, User, UserProfile, UserStatistics,
};
use crate::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Transactional store for users, balances, discount codes and operations.
///
/// `reserve` and `resolve` are each one atomic unit: either every row they
/// touch changes, or none does.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get or create a user by external id, refreshing profile fields.
    /// New users receive `starting_balance`.
    async fn upsert_user(&self, profile: &UserProfile, starting_balance: i64) -> AppResult<User>;

    async fn find_user(&self, user_id: i64) -> AppResult<Option<User>>;

    async fn find_user_by_external_id(&self, external_id: &str) -> AppResult<Option<User>>;

    /// Add `amount` (positive) to the balance and record it. Returns the new balance.
    async fn credit_balance(
        &self,
        user_id: i64,
        amount: i64,
        entry_type: EntryType,
    ) -> AppResult<i64>;

    async fn grant_free_operations(&self, user_id: i64, count: i32) -> AppResult<User>;

    async fn set_free_access(&self, user_id: i64, enabled: bool) -> AppResult<User>;

    /// Insert a prepared (normalized, validated) code
    async fn create_discount_code(&self, code: &NewDiscountCode) -> AppResult<DiscountCode>;

    async fn find_discount_code(&self, code: &str) -> AppResult<Option<DiscountCode>>;

    /// Lock user then code, quote, debit, count the redemption and insert a
    /// `Reserved` operation.
    async fn reserve(&self, draft: &ReservationDraft) -> AppResult<Reservation>;

    /// Lock operation then user and move `Reserved -> target`, crediting the
    /// price back when `target` returns funds.
    async fn resolve(
        &self,
        operation_id: Uuid,
        target: OperationStatus,
        reason: Option<&str>,
    ) -> AppResult<Resolution>;

    async fn find_operation(&self, operation_id: Uuid) -> AppResult<Option<Operation>>;

    /// Newest first
    async fn list_operations(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Operation>>;

    /// `Reserved` operations created before `older_than`, oldest first
    async fn stale_reservations(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Operation>>;

    /// Newest first
    async fn ledger_entries(&self, user_id: i64, limit: i64) -> AppResult<Vec<LedgerEntry>>;

    /// Users owning at least one `Charged` operation
    async fn charged_user_ids(&self) -> AppResult<Vec<i64>>;

    async fn charged_operations(&self, user_id: i64) -> AppResult<Vec<Operation>>;

    /// Replace the statistics row for `stats.user_id`
    async fn upsert_statistics(&self, stats: &UserStatistics) -> AppResult<()>;

    async fn user_statistics(&self, user_id: i64) -> AppResult<Option<UserStatistics>>;
}

/// At-least-once job queue with lease-based redelivery
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &JobDescriptor) -> AppResult<()>;

    /// Lease the next ready job for `lease`, or `None` when nothing is ready
    async fn dequeue(&self, lease: Duration) -> AppResult<Option<Delivery>>;

    /// Remove the job. `false` when the token no longer holds the lease.
    async fn ack(&self, job_id: Uuid, lease_token: Uuid) -> AppResult<bool>;

    async fn nack(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        policy: &RetryPolicy,
    ) -> AppResult<NackOutcome>;

    async fn extend_lease(&self, job_id: Uuid, lease_token: Uuid, lease: Duration)
        -> AppResult<bool>;

    async fn depth(&self) -> AppResult<QueueDepth>;
}

/// External media generation provider.
///
/// Errors must be `ProviderRetryable` or `ProviderTerminal`.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn submit(&self, job: &JobDescriptor) -> AppResult<String>;

    async fn poll(&self, task_id: &str) -> AppResult<ProviderStatus>;

    /// Fetch one result; the artifact carries the best known content type
    async fn download(&self, result: &ProviderResult) -> AppResult<Artifact>;
}

/// Delivers the eventual outcome to the requester, keyed by operation id
#[async_trait]
pub trait OutcomeNotifier: Send + Sync {
    async fn notify(&self, outcome: &JobOutcome) -> AppResult<()>;
}
