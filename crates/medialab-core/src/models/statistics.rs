//! Derived per-user statistics
//!
//! Always recomputed from the full set of charged operations, so folding the
//! same history twice yields the same row.

use super::{Operation, OperationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStatistics {
    pub user_id: i64,
    pub total_operations: i64,
    /// Sum of charged prices, in minor units
    pub total_spent: i64,
    pub operations_by_type: BTreeMap<String, i64>,
    pub models_used: BTreeMap<String, i64>,
    pub first_operation_at: Option<DateTime<Utc>>,
    pub last_operation_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl UserStatistics {
    pub fn empty(user_id: i64) -> Self {
        Self {
            user_id,
            total_operations: 0,
            total_spent: 0,
            operations_by_type: BTreeMap::new(),
            models_used: BTreeMap::new(),
            first_operation_at: None,
            last_operation_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Fold `operations` into a fresh row. Anything not `Charged` is ignored.
    pub fn from_operations<'a, I>(user_id: i64, operations: I) -> Self
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        let mut stats = Self::empty(user_id);

        for op in operations
            .into_iter()
            .filter(|op| op.user_id == user_id && op.status == OperationStatus::Charged)
        {
            stats.total_operations += 1;
            stats.total_spent += op.price;
            *stats
                .operations_by_type
                .entry(op.kind.to_string())
                .or_insert(0) += 1;
            if let Some(model) = &op.model {
                *stats.models_used.entry(model.clone()).or_insert(0) += 1;
            }
            stats.first_operation_at = Some(match stats.first_operation_at {
                Some(first) => first.min(op.created_at),
                None => op.created_at,
            });
            stats.last_operation_at = Some(match stats.last_operation_at {
                Some(last) => last.max(op.created_at),
                None => op.created_at,
            });
        }

        stats
    }

    /// Compare aggregates, ignoring `updated_at`
    pub fn same_totals(&self, other: &UserStatistics) -> bool {
        self.user_id == other.user_id
            && self.total_operations == other.total_operations
            && self.total_spent == other.total_spent
            && self.operations_by_type == other.operations_by_type
            && self.models_used == other.models_used
            && self.first_operation_at == other.first_operation_at
            && self.last_operation_at == other.last_operation_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OperationKind;
    use chrono::Duration;
    use uuid::Uuid;

    fn op(kind: OperationKind, status: OperationStatus, price: i64, age_mins: i64) -> Operation {
        Operation {
            id: Uuid::now_v7(),
            user_id: 1,
            kind,
            model: Some("seedream".to_string()),
            status,
            price,
            original_price: None,
            discount_code_id: None,
            discount_percent: None,
            is_free: price == 0,
            free_source: None,
            prompt: None,
            image_count: 1,
            failure_reason: None,
            created_at: Utc::now() - Duration::minutes(age_mins),
            resolved_at: None,
        }
    }

    #[test]
    fn test_only_charged_counted() {
        let ops = vec![
            op(OperationKind::Generate, OperationStatus::Charged, 900, 10),
            op(OperationKind::Generate, OperationStatus::Refunded, 900, 9),
            op(OperationKind::Edit, OperationStatus::Charged, 0, 5),
            op(OperationKind::Upscale, OperationStatus::Reserved, 900, 1),
        ];

        let stats = UserStatistics::from_operations(1, &ops);
        assert_eq!(stats.total_operations, 2);
        assert_eq!(stats.total_spent, 900);
        assert_eq!(stats.operations_by_type["generate"], 1);
        assert_eq!(stats.operations_by_type["edit"], 1);
        assert_eq!(stats.models_used["seedream"], 2);
        assert_eq!(stats.first_operation_at, Some(ops[0].created_at));
        assert_eq!(stats.last_operation_at, Some(ops[2].created_at));
    }

    #[test]
    fn test_recompute_is_stable() {
        let ops = vec![op(OperationKind::Merge, OperationStatus::Charged, 750, 3)];
        let first = UserStatistics::from_operations(1, &ops);
        let second = UserStatistics::from_operations(1, &ops);
        assert!(first.same_totals(&second));
    }
}
