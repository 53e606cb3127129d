//! Media Lab Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the Media Lab dispatch and billing subsystem. It includes:
//!
//! - Domain models (User, Operation, DiscountCode, JobDescriptor, etc.)
//! - The operation state machine and quote rules
//! - Store, queue, provider and notifier traits
//! - Unified error handling with HTTP response mapping
//! - Application configuration and the price table

pub mod config;
pub mod error;
pub mod models;
pub mod pricing;
pub mod traits;

pub use config::AppConfig;
pub use error::AppError;

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
