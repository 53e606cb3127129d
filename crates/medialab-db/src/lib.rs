//! Media Lab Ledger Store
//!
//! This crate provides the transactional store behind the billing service:
//!
//! - Connection pool management and embedded migrations with sqlx
//! - `PgLedgerStore`, row-locking PostgreSQL implementation of `LedgerStore`
//! - `MemoryLedgerStore`, a single-mutex implementation with the same
//!   semantics, used by tests and single-process runs

pub mod pool;
pub mod stores;

pub use pool::{create_pool, run_migrations};
pub use stores::{MemoryLedgerStore, PgLedgerStore};

// Re-export commonly used types
pub use medialab_core::{AppError, AppResult};
pub use sqlx::{PgPool, Postgres, Transaction};
