//! Business logic services for Media Lab
//!
//! This crate orchestrates billing and job processing on top of the store and
//! queue traits from `medialab-core`.
//!
//! # Architecture
//!
//! Services are designed to be composable and testable:
//! - Each service owns its dependencies behind `Arc`
//! - Correctness rests on store transactions, never on worker coordination
//! - All operations are instrumented with tracing
//!
//! # Services
//!
//! - `BillingService` - reserve, confirm, refund and fail, plus account upkeep
//! - `JobDispatcher` - reserve then enqueue, refunding if the enqueue fails
//! - `Worker` / `WorkerPool` - lease jobs, call the provider, resolve billing
//! - `StatisticsAggregator` - recompute per-user statistics
//! - `HttpGenerationProvider` - HTTP adapter for the generation provider
//! - `RedisOutcomePublisher` - store artifacts and publish outcomes

pub mod billing;
pub mod dispatcher;
pub mod notifier;
pub mod provider;
pub mod statistics;
pub mod worker;

pub use billing::{BillingService, ReserveRequest};
pub use dispatcher::{JobDispatcher, Submission};
pub use notifier::RedisOutcomePublisher;
pub use provider::HttpGenerationProvider;
pub use statistics::{AggregationReport, StatisticsAggregator};
pub use worker::{ProcessOutcome, Worker, WorkerPool, WorkerSettings};

/// Business logic constants
pub mod constants {
    /// Reason recorded on reservations failed by the sweeper
    pub const RESERVATION_EXPIRED_REASON: &str = "reservation expired";

    /// Reason recorded when a job is delivered more times than allowed
    pub const ATTEMPTS_EXHAUSTED_REASON: &str = "retry attempts exhausted";

    /// Stale reservations failed per sweeper query
    pub const SWEEP_BATCH_SIZE: i64 = 100;

    /// Default page size for operation history
    pub const DEFAULT_HISTORY_LIMIT: i64 = 20;

    /// Largest page size for operation history
    pub const MAX_HISTORY_LIMIT: i64 = 100;
}
