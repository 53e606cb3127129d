//! Balance audit log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Ledger entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    /// Funds added by a payment
    TopUp,
    /// Price debited for a reservation
    Reserve,
    /// Reservation returned by refund
    Refund,
    /// Reservation returned after a terminal failure
    Fail,
    /// Initial balance for a new user
    StartingBonus,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryType::TopUp => write!(f, "top_up"),
            EntryType::Reserve => write!(f, "reserve"),
            EntryType::Refund => write!(f, "refund"),
            EntryType::Fail => write!(f, "fail"),
            EntryType::StartingBonus => write!(f, "starting_bonus"),
        }
    }
}

impl EntryType {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "top_up" => Some(EntryType::TopUp),
            "reserve" => Some(EntryType::Reserve),
            "refund" => Some(EntryType::Refund),
            "fail" => Some(EntryType::Fail),
            "starting_bonus" => Some(EntryType::StartingBonus),
            _ => None,
        }
    }
}

/// Immutable record of one balance delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: i64,
    pub operation_id: Option<Uuid>,
    pub entry_type: EntryType,
    /// Signed delta in minor units
    pub amount: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_debit(&self) -> bool {
        self.amount < 0
    }

    pub fn is_credit(&self) -> bool {
        self.amount > 0
    }
}
