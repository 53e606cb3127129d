//! Ledger store implementations

pub mod memory;
pub mod pg;

pub use memory::MemoryLedgerStore;
pub use pg::PgLedgerStore;
