//! Domain models for Media Lab
//!
//! This module contains all the core domain models used throughout the application.

pub mod discount;
pub mod job;
pub mod ledger;
pub mod operation;
pub mod quote;
pub mod statistics;
pub mod user;

pub use discount::{normalize_code, DiscountCode, NewDiscountCode};
pub use job::{
    Artifact, Delivery, JobDescriptor, JobOutcome, NackOutcome, ProviderResult, ProviderStatus,
    QueueDepth, RetryPolicy,
};
pub use ledger::{EntryType, LedgerEntry};
pub use operation::{
    truncate_prompt, FreeSource, Operation, OperationKind, OperationStatus, Reservation,
    ReservationDraft, Resolution, Transition, MAX_PROMPT_CHARS,
};
pub use quote::{apply_discount, Quote};
pub use statistics::UserStatistics;
pub use user::{User, UserProfile};
