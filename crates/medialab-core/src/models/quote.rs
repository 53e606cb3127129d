//! Price quote for a single reservation
//!
//! Precedence, first match wins:
//! 1. free access on the user
//! 2. free-generation code
//! 3. percentage code
//! 4. a free operation credit, only when no code was supplied
//! 5. base price

use super::{DiscountCode, FreeSource, User};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Amount to debit, in minor units
    pub price: i64,
    pub original_price: Option<i64>,
    pub discount_percent: Option<i32>,
    pub free_source: Option<FreeSource>,
    /// Redeeming increments the code's `current_uses`
    pub consumes_code: bool,
    /// Redeeming spends one of the user's free operation credits
    pub consumes_credit: bool,
}

impl Quote {
    /// Price `base_price` for `user`, with `code` already validated as redeemable
    pub fn compute(base_price: i64, user: &User, code: Option<&DiscountCode>) -> Self {
        if user.has_free_access {
            return Self::free(base_price, FreeSource::FreeAccess, false, false);
        }

        match code {
            Some(code) if code.is_free_generation => {
                Self::free(base_price, FreeSource::FreeCode, true, false)
            }
            Some(code) => {
                let price = apply_discount(base_price, code.discount_percent);
                Self {
                    price,
                    original_price: Some(base_price),
                    discount_percent: Some(code.discount_percent),
                    free_source: None,
                    consumes_code: true,
                    consumes_credit: false,
                }
            }
            None if user.free_operations_left > 0 => {
                Self::free(base_price, FreeSource::FreeCredit, false, true)
            }
            None => Self {
                price: base_price,
                original_price: None,
                discount_percent: None,
                free_source: None,
                consumes_code: false,
                consumes_credit: false,
            },
        }
    }

    fn free(base_price: i64, source: FreeSource, consumes_code: bool, consumes_credit: bool) -> Self {
        Self {
            price: 0,
            original_price: Some(base_price),
            discount_percent: None,
            free_source: Some(source),
            consumes_code,
            consumes_credit,
        }
    }

    pub fn is_free(&self) -> bool {
        self.price == 0
    }
}

/// `round_half_up(base * (100 - percent) / 100)`, at least one minor unit
/// unless the discount is total.
pub fn apply_discount(base_price: i64, percent: i32) -> i64 {
    let percent = percent.clamp(0, 100);
    if percent == 100 || base_price == 0 {
        return 0;
    }

    let discounted = Decimal::from(base_price) * Decimal::from(100 - percent) / Decimal::from(100);
    let rounded = discounted
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(base_price);

    rounded.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(free_access: bool, credits: i32) -> User {
        let now = Utc::now();
        User {
            id: 1,
            external_id: "1".to_string(),
            username: None,
            first_name: None,
            last_name: None,
            language_code: None,
            is_premium: false,
            has_free_access: free_access,
            free_operations_left: credits,
            balance: 0,
            last_activity_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn code(percent: i32, free: bool) -> DiscountCode {
        DiscountCode {
            id: 7,
            code: "CODE".to_string(),
            discount_percent: percent,
            is_free_generation: free,
            max_uses: None,
            current_uses: 0,
            is_active: true,
            valid_from: None,
            valid_until: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_percentage_discount() {
        let q = Quote::compute(50, &user(false, 0), Some(&code(20, false)));
        assert_eq!(q.price, 40);
        assert_eq!(q.original_price, Some(50));
        assert_eq!(q.discount_percent, Some(20));
        assert!(q.consumes_code);
    }

    #[test]
    fn test_rounding_half_up_with_floor() {
        assert_eq!(apply_discount(5, 50), 3);
        assert_eq!(apply_discount(900, 33), 603);
        assert_eq!(apply_discount(1, 99), 1);
        assert_eq!(apply_discount(900, 100), 0);
    }

    #[test]
    fn test_free_access_wins_and_keeps_code() {
        let q = Quote::compute(900, &user(true, 3), Some(&code(20, false)));
        assert!(q.is_free());
        assert_eq!(q.free_source, Some(FreeSource::FreeAccess));
        assert!(!q.consumes_code);
        assert!(!q.consumes_credit);
    }

    #[test]
    fn test_free_code_before_credit() {
        let q = Quote::compute(900, &user(false, 2), Some(&code(0, true)));
        assert_eq!(q.free_source, Some(FreeSource::FreeCode));
        assert!(q.consumes_code);
        assert!(!q.consumes_credit);
    }

    #[test]
    fn test_credit_only_without_code() {
        let q = Quote::compute(900, &user(false, 1), None);
        assert_eq!(q.free_source, Some(FreeSource::FreeCredit));
        assert!(q.consumes_credit);

        let q = Quote::compute(900, &user(false, 1), Some(&code(10, false)));
        assert_eq!(q.price, 810);
        assert!(!q.consumes_credit);
    }

    #[test]
    fn test_base_price() {
        let q = Quote::compute(900, &user(false, 0), None);
        assert_eq!(q.price, 900);
        assert_eq!(q.original_price, None);
        assert_eq!(q.free_source, None);
    }
}
