//! Billable operation models
//!
//! An operation is created `Reserved` when the price is debited and resolves
//! exactly once to `Charged`, `Refunded` or `Failed`.

use crate::error::AppError;
use crate::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum number of prompt characters kept on an operation
pub const MAX_PROMPT_CHARS: usize = 2000;

/// Kind of media operation a user can request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Generate,
    Edit,
    Merge,
    Retouch,
    Upscale,
    FaceSwap,
    PromptGeneration,
    AddText,
}

impl OperationKind {
    pub const ALL: [OperationKind; 8] = [
        OperationKind::Generate,
        OperationKind::Edit,
        OperationKind::Merge,
        OperationKind::Retouch,
        OperationKind::Upscale,
        OperationKind::FaceSwap,
        OperationKind::PromptGeneration,
        OperationKind::AddText,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Generate => "generate",
            OperationKind::Edit => "edit",
            OperationKind::Merge => "merge",
            OperationKind::Retouch => "retouch",
            OperationKind::Upscale => "upscale",
            OperationKind::FaceSwap => "face_swap",
            OperationKind::PromptGeneration => "prompt_generation",
            OperationKind::AddText => "add_text",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        OperationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| AppError::UnknownOperationKind(s.to_string()))
    }
}

/// Operation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Price debited, outcome pending
    #[default]
    Reserved,
    /// Job succeeded, debit is final
    Charged,
    /// Reservation returned to the balance
    Refunded,
    /// Job failed terminally, reservation returned to the balance
    Failed,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Reserved => write!(f, "reserved"),
            OperationStatus::Charged => write!(f, "charged"),
            OperationStatus::Refunded => write!(f, "refunded"),
            OperationStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Result of checking a requested status change against the current one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The change must be applied
    Apply,
    /// The operation is already in the requested state; nothing to do
    AlreadyApplied,
}

impl OperationStatus {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "reserved" => Some(OperationStatus::Reserved),
            "charged" => Some(OperationStatus::Charged),
            "refunded" => Some(OperationStatus::Refunded),
            "failed" => Some(OperationStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Reserved)
    }

    /// Whether reaching this status credits the reserved price back
    pub fn returns_funds(&self) -> bool {
        matches!(self, OperationStatus::Refunded | OperationStatus::Failed)
    }

    /// Validate `self -> target`.
    ///
    /// Only `Reserved` may move, and only to a terminal status. Asking for the
    /// status the operation already holds is reported as `AlreadyApplied` so
    /// redelivered confirmations and refunds are harmless.
    pub fn transition(self, target: OperationStatus, operation_id: Uuid) -> AppResult<Transition> {
        match (self, target) {
            (_, OperationStatus::Reserved) => Err(self.invalid(target, operation_id)),
            (OperationStatus::Reserved, _) => Ok(Transition::Apply),
            (current, target) if current == target => Ok(Transition::AlreadyApplied),
            _ => Err(self.invalid(target, operation_id)),
        }
    }

    fn invalid(self, target: OperationStatus, operation_id: Uuid) -> AppError {
        AppError::InvalidStateTransition {
            operation_id: operation_id.to_string(),
            from: self.to_string(),
            to: target.to_string(),
        }
    }
}

/// Why an operation was priced at zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FreeSource {
    /// User holds unlimited free access
    FreeAccess,
    /// A free-generation discount code was redeemed
    FreeCode,
    /// One of the user's free operation credits was spent
    FreeCredit,
}

impl fmt::Display for FreeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FreeSource::FreeAccess => write!(f, "free_access"),
            FreeSource::FreeCode => write!(f, "free_code"),
            FreeSource::FreeCredit => write!(f, "free_credit"),
        }
    }
}

impl FreeSource {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "free_access" => Some(FreeSource::FreeAccess),
            "free_code" => Some(FreeSource::FreeCode),
            "free_credit" => Some(FreeSource::FreeCredit),
            _ => None,
        }
    }
}

/// Billable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Generated at reservation time
    pub id: Uuid,

    pub user_id: i64,

    pub kind: OperationKind,

    /// Model requested, when the kind supports several
    pub model: Option<String>,

    pub status: OperationStatus,

    /// Price debited at reservation, in minor units. Never recomputed.
    pub price: i64,

    /// Base price before a percentage discount
    pub original_price: Option<i64>,

    pub discount_code_id: Option<i64>,

    pub discount_percent: Option<i32>,

    pub is_free: bool,

    pub free_source: Option<FreeSource>,

    pub prompt: Option<String>,

    pub image_count: i32,

    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    pub resolved_at: Option<DateTime<Utc>>,
}

/// Input for a reservation, already priced from the price table
#[derive(Debug, Clone)]
pub struct ReservationDraft {
    pub user_id: i64,
    pub kind: OperationKind,
    pub model: Option<String>,
    /// Base price from the price table, in minor units
    pub base_price: i64,
    pub discount_code: Option<String>,
    pub prompt: Option<String>,
    pub image_count: i32,
}

impl ReservationDraft {
    pub fn new(user_id: i64, kind: OperationKind, base_price: i64) -> Self {
        Self {
            user_id,
            kind,
            model: None,
            base_price,
            discount_code: None,
            prompt: None,
            image_count: 1,
        }
    }

    pub fn with_discount_code(mut self, code: impl Into<String>) -> Self {
        self.discount_code = Some(code.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Some(truncate_prompt(prompt));
        self
    }
}

/// Keep at most [`MAX_PROMPT_CHARS`] characters
pub fn truncate_prompt(prompt: &str) -> String {
    prompt.chars().take(MAX_PROMPT_CHARS).collect()
}

/// Outcome of a committed reservation
#[derive(Debug, Clone)]
pub struct Reservation {
    pub operation: Operation,
    /// Balance right after the debit
    pub balance_after: i64,
}

impl Reservation {
    pub fn operation_id(&self) -> Uuid {
        self.operation.id
    }

    pub fn price(&self) -> i64 {
        self.operation.price
    }
}

/// Outcome of a confirm, refund or fail call
#[derive(Debug, Clone)]
pub struct Resolution {
    pub operation: Operation,
    /// False when the operation already held the requested status
    pub applied: bool,
    /// Balance after the call
    pub balance_after: i64,
}
