//! Discount code models

use crate::error::AppError;
use crate::AppResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Redeemable discount code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscountCode {
    pub id: i64,

    /// Stored upper-case and trimmed
    pub code: String,

    /// 0..=100
    pub discount_percent: i32,

    /// Redeeming makes the operation free regardless of percent
    pub is_free_generation: bool,

    /// Unlimited when `None`
    pub max_uses: Option<i32>,

    pub current_uses: i32,

    pub is_active: bool,

    pub valid_from: Option<DateTime<Utc>>,

    pub valid_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl DiscountCode {
    pub fn is_exhausted(&self) -> bool {
        self.max_uses
            .map(|max| self.current_uses >= max)
            .unwrap_or(false)
    }

    pub fn is_within_window(&self, now: DateTime<Utc>) -> bool {
        let started = self.valid_from.map(|from| now >= from).unwrap_or(true);
        let not_expired = self.valid_until.map(|until| now <= until).unwrap_or(true);
        started && not_expired
    }

    /// Check the code can be redeemed once more at `now`
    pub fn ensure_redeemable(&self, now: DateTime<Utc>) -> AppResult<()> {
        if !self.is_active {
            return Err(AppError::InvalidDiscountCode(format!(
                "{} is not active",
                self.code
            )));
        }
        if !self.is_within_window(now) {
            return Err(AppError::InvalidDiscountCode(format!(
                "{} is outside its validity period",
                self.code
            )));
        }
        if self.is_exhausted() {
            return Err(AppError::InvalidDiscountCode(format!(
                "{} has no uses left",
                self.code
            )));
        }
        Ok(())
    }
}

/// Canonical form used for storage and lookup
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Request to create a discount code
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewDiscountCode {
    #[validate(length(min = 3, max = 64))]
    pub code: String,

    #[validate(range(min = 0, max = 100))]
    pub discount_percent: i32,

    #[serde(default)]
    pub is_free_generation: bool,

    #[validate(range(min = 1))]
    pub max_uses: Option<i32>,

    pub valid_from: Option<DateTime<Utc>>,

    pub valid_until: Option<DateTime<Utc>>,
}

impl NewDiscountCode {
    pub fn percent(code: &str, discount_percent: i32) -> Self {
        Self {
            code: code.to_string(),
            discount_percent,
            is_free_generation: false,
            max_uses: None,
            valid_from: None,
            valid_until: None,
        }
    }

    pub fn free_generation(code: &str) -> Self {
        Self {
            is_free_generation: true,
            ..Self::percent(code, 0)
        }
    }

    pub fn with_max_uses(mut self, max_uses: i32) -> Self {
        self.max_uses = Some(max_uses);
        self
    }

    /// Validate field ranges and normalize the code
    pub fn prepare(&self) -> AppResult<NewDiscountCode> {
        let mut prepared = self.clone();
        prepared.code = normalize_code(&self.code);
        prepared.validate()?;
        if let (Some(from), Some(until)) = (prepared.valid_from, prepared.valid_until) {
            if until < from {
                return Err(AppError::Validation(
                    "valid_until precedes valid_from".to_string(),
                ));
            }
        }
        Ok(prepared)
    }
}
