//! In-process ledger store
//!
//! Every call runs under one mutex, which makes each call a serialisable
//! transaction. Semantics match [`PgLedgerStore`](super::PgLedgerStore).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medialab_core::{
    models::{
        normalize_code, DiscountCode, EntryType, FreeSource, LedgerEntry, NewDiscountCode,
        Operation, OperationStatus, Quote, Reservation, ReservationDraft, Resolution, Transition,
        User, UserProfile, UserStatistics,
    },
    traits::LedgerStore,
    AppError, AppResult,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, instrument};
use uuid::Uuid;

#[derive(Default)]
struct State {
    users: HashMap<i64, User>,
    external_ids: HashMap<String, i64>,
    codes: HashMap<String, DiscountCode>,
    operations: HashMap<Uuid, Operation>,
    ledger: Vec<LedgerEntry>,
    statistics: HashMap<i64, UserStatistics>,
    next_user_id: i64,
    next_code_id: i64,
    next_entry_id: i64,
}

impl State {
    fn user_mut(&mut self, user_id: i64) -> AppResult<&mut User> {
        self.users
            .get_mut(&user_id)
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
    }

    fn record(
        &mut self,
        user_id: i64,
        operation_id: Option<Uuid>,
        entry_type: EntryType,
        amount: i64,
        balance_after: i64,
    ) {
        if amount == 0 {
            return;
        }
        self.next_entry_id += 1;
        self.ledger.push(LedgerEntry {
            id: self.next_entry_id,
            user_id,
            operation_id,
            entry_type,
            amount,
            balance_after,
            created_at: Utc::now(),
        });
    }
}

/// Ledger store held entirely in memory
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<State>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of every recorded balance delta for a user
    pub fn ledger_sum(&self, user_id: i64) -> i64 {
        self.state
            .lock()
            .ledger
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.amount)
            .sum()
    }

    /// Backdate an operation, for exercising the stale-reservation sweep
    pub fn set_operation_created_at(&self, operation_id: Uuid, created_at: DateTime<Utc>) {
        if let Some(op) = self.state.lock().operations.get_mut(&operation_id) {
            op.created_at = created_at;
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    #[instrument(skip(self, profile), fields(external_id = %profile.external_id))]
    async fn upsert_user(&self, profile: &UserProfile, starting_balance: i64) -> AppResult<User> {
        let mut state = self.state.lock();
        let now = Utc::now();

        if let Some(id) = state.external_ids.get(&profile.external_id).copied() {
            let user = state.user_mut(id)?;
            user.username = profile.username.clone();
            user.first_name = profile.first_name.clone();
            user.last_name = profile.last_name.clone();
            user.language_code = profile.language_code.clone();
            user.is_premium = profile.is_premium;
            user.last_activity_at = now;
            user.updated_at = now;
            return Ok(user.clone());
        }

        state.next_user_id += 1;
        let id = state.next_user_id;
        let user = User {
            id,
            external_id: profile.external_id.clone(),
            username: profile.username.clone(),
            first_name: profile.first_name.clone(),
            last_name: profile.last_name.clone(),
            language_code: profile.language_code.clone(),
            is_premium: profile.is_premium,
            has_free_access: false,
            free_operations_left: 0,
            balance: starting_balance,
            last_activity_at: now,
            created_at: now,
            updated_at: now,
        };
        state.users.insert(id, user.clone());
        state.external_ids.insert(profile.external_id.clone(), id);
        state.record(id, None, EntryType::StartingBonus, starting_balance, starting_balance);

        debug!("Created user {} with balance {}", id, starting_balance);
        Ok(user)
    }

    async fn find_user(&self, user_id: i64) -> AppResult<Option<User>> {
        Ok(self.state.lock().users.get(&user_id).cloned())
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> AppResult<Option<User>> {
        let state = self.state.lock();
        Ok(state
            .external_ids
            .get(external_id)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    #[instrument(skip(self))]
    async fn credit_balance(
        &self,
        user_id: i64,
        amount: i64,
        entry_type: EntryType,
    ) -> AppResult<i64> {
        if amount <= 0 {
            return Err(AppError::InvalidInput(format!(
                "credit amount must be positive, got {}",
                amount
            )));
        }

        let mut state = self.state.lock();
        let user = state.user_mut(user_id)?;
        user.balance += amount;
        user.updated_at = Utc::now();
        let balance = user.balance;
        state.record(user_id, None, entry_type, amount, balance);
        Ok(balance)
    }

    async fn grant_free_operations(&self, user_id: i64, count: i32) -> AppResult<User> {
        let mut state = self.state.lock();
        let user = state.user_mut(user_id)?;
        user.free_operations_left = (user.free_operations_left + count).max(0);
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn set_free_access(&self, user_id: i64, enabled: bool) -> AppResult<User> {
        let mut state = self.state.lock();
        let user = state.user_mut(user_id)?;
        user.has_free_access = enabled;
        user.updated_at = Utc::now();
        Ok(user.clone())
    }

    async fn create_discount_code(&self, code: &NewDiscountCode) -> AppResult<DiscountCode> {
        let mut state = self.state.lock();
        if state.codes.contains_key(&code.code) {
            return Err(AppError::AlreadyExists(format!(
                "discount code {}",
                code.code
            )));
        }

        state.next_code_id += 1;
        let created = DiscountCode {
            id: state.next_code_id,
            code: code.code.clone(),
            discount_percent: code.discount_percent,
            is_free_generation: code.is_free_generation,
            max_uses: code.max_uses,
            current_uses: 0,
            is_active: true,
            valid_from: code.valid_from,
            valid_until: code.valid_until,
            created_at: Utc::now(),
        };
        state.codes.insert(created.code.clone(), created.clone());
        Ok(created)
    }

    async fn find_discount_code(&self, code: &str) -> AppResult<Option<DiscountCode>> {
        Ok(self.state.lock().codes.get(&normalize_code(code)).cloned())
    }

    #[instrument(skip(self, draft), fields(user_id = draft.user_id, kind = %draft.kind))]
    async fn reserve(&self, draft: &ReservationDraft) -> AppResult<Reservation> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let user = state
            .users
            .get(&draft.user_id)
            .cloned()
            .ok_or_else(|| AppError::UserNotFound(draft.user_id.to_string()))?;

        let code = match &draft.discount_code {
            Some(raw) => {
                let normalized = normalize_code(raw);
                let code = state
                    .codes
                    .get(&normalized)
                    .cloned()
                    .ok_or_else(|| AppError::InvalidDiscountCode(format!("{} not found", normalized)))?;
                code.ensure_redeemable(now)?;
                Some(code)
            }
            None => None,
        };

        let quote = Quote::compute(draft.base_price, &user, code.as_ref());
        if !quote.is_free() && user.balance < quote.price {
            return Err(AppError::InsufficientBalance {
                required: quote.price,
                available: user.balance,
            });
        }

        let discount_code_id = match (&code, quote.consumes_code) {
            (Some(code), true) => {
                if let Some(stored) = state.codes.get_mut(&code.code) {
                    stored.current_uses += 1;
                }
                Some(code.id)
            }
            _ => None,
        };

        let user = state.user_mut(draft.user_id)?;
        user.balance -= quote.price;
        if quote.consumes_credit {
            user.free_operations_left -= 1;
        }
        user.updated_at = now;
        let balance_after = user.balance;

        let operation = Operation {
            id: Uuid::now_v7(),
            user_id: draft.user_id,
            kind: draft.kind,
            model: draft.model.clone(),
            status: OperationStatus::Reserved,
            price: quote.price,
            original_price: quote.original_price,
            discount_code_id,
            discount_percent: quote.discount_percent,
            is_free: quote.is_free(),
            free_source: quote.free_source,
            prompt: draft.prompt.clone(),
            image_count: draft.image_count,
            failure_reason: None,
            created_at: now,
            resolved_at: None,
        };
        state.operations.insert(operation.id, operation.clone());
        state.record(
            draft.user_id,
            Some(operation.id),
            EntryType::Reserve,
            -quote.price,
            balance_after,
        );

        Ok(Reservation {
            operation,
            balance_after,
        })
    }

    #[instrument(skip(self))]
    async fn resolve(
        &self,
        operation_id: Uuid,
        target: OperationStatus,
        reason: Option<&str>,
    ) -> AppResult<Resolution> {
        let mut state = self.state.lock();

        let mut operation = state
            .operations
            .get(&operation_id)
            .cloned()
            .ok_or_else(|| AppError::OperationNotFound(operation_id.to_string()))?;

        let transition = operation.status.transition(target, operation_id)?;
        let user = state.user_mut(operation.user_id)?;

        if transition == Transition::AlreadyApplied {
            return Ok(Resolution {
                operation,
                applied: false,
                balance_after: user.balance,
            });
        }

        let now = Utc::now();
        if target.returns_funds() {
            user.balance += operation.price;
            if operation.free_source == Some(FreeSource::FreeCredit) {
                user.free_operations_left += 1;
            }
            user.updated_at = now;
        }
        let balance_after = user.balance;

        operation.status = target;
        operation.resolved_at = Some(now);
        if target == OperationStatus::Failed {
            operation.failure_reason = reason.map(str::to_string);
        }
        state.operations.insert(operation_id, operation.clone());

        match target {
            OperationStatus::Refunded => state.record(
                operation.user_id,
                Some(operation_id),
                EntryType::Refund,
                operation.price,
                balance_after,
            ),
            OperationStatus::Failed => state.record(
                operation.user_id,
                Some(operation_id),
                EntryType::Fail,
                operation.price,
                balance_after,
            ),
            _ => {}
        }

        Ok(Resolution {
            operation,
            applied: true,
            balance_after,
        })
    }

    async fn find_operation(&self, operation_id: Uuid) -> AppResult<Option<Operation>> {
        Ok(self.state.lock().operations.get(&operation_id).cloned())
    }

    async fn list_operations(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Operation>> {
        let state = self.state.lock();
        let mut ops: Vec<Operation> = state
            .operations
            .values()
            .filter(|op| op.user_id == user_id)
            .cloned()
            .collect();
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(ops
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn stale_reservations(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Operation>> {
        let state = self.state.lock();
        let mut ops: Vec<Operation> = state
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Reserved && op.created_at < older_than)
            .cloned()
            .collect();
        ops.sort_by_key(|op| op.created_at);
        ops.truncate(limit.max(0) as usize);
        Ok(ops)
    }

    async fn ledger_entries(&self, user_id: i64, limit: i64) -> AppResult<Vec<LedgerEntry>> {
        let state = self.state.lock();
        Ok(state
            .ledger
            .iter()
            .rev()
            .filter(|entry| entry.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn charged_user_ids(&self) -> AppResult<Vec<i64>> {
        let state = self.state.lock();
        let mut ids: Vec<i64> = state
            .operations
            .values()
            .filter(|op| op.status == OperationStatus::Charged)
            .map(|op| op.user_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    async fn charged_operations(&self, user_id: i64) -> AppResult<Vec<Operation>> {
        let state = self.state.lock();
        Ok(state
            .operations
            .values()
            .filter(|op| op.user_id == user_id && op.status == OperationStatus::Charged)
            .cloned()
            .collect())
    }

    async fn upsert_statistics(&self, stats: &UserStatistics) -> AppResult<()> {
        self.state
            .lock()
            .statistics
            .insert(stats.user_id, stats.clone());
        Ok(())
    }

    async fn user_statistics(&self, user_id: i64) -> AppResult<Option<UserStatistics>> {
        Ok(self.state.lock().statistics.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medialab_core::models::OperationKind;

    async fn store_with_user(balance: i64) -> (MemoryLedgerStore, User) {
        let store = MemoryLedgerStore::new();
        let user = store
            .upsert_user(&UserProfile::new("tg-1"), balance)
            .await
            .unwrap();
        (store, user)
    }

    #[tokio::test]
    async fn test_upsert_is_get_or_create() {
        let (store, user) = store_with_user(3000).await;
        let mut profile = UserProfile::new("tg-1");
        profile.username = Some("ada".to_string());

        let again = store.upsert_user(&profile, 3000).await.unwrap();
        assert_eq!(again.id, user.id);
        assert_eq!(again.balance, 3000);
        assert_eq!(again.username.as_deref(), Some("ada"));
        assert_eq!(store.ledger_sum(user.id), 3000);
    }

    #[tokio::test]
    async fn test_reserve_and_refund_restore_balance() {
        let (store, user) = store_with_user(100).await;
        let draft = ReservationDraft::new(user.id, OperationKind::Generate, 30);

        let reservation = store.reserve(&draft).await.unwrap();
        assert_eq!(reservation.balance_after, 70);

        let resolution = store
            .resolve(reservation.operation_id(), OperationStatus::Refunded, None)
            .await
            .unwrap();
        assert!(resolution.applied);
        assert_eq!(resolution.balance_after, 100);

        let again = store
            .resolve(reservation.operation_id(), OperationStatus::Refunded, None)
            .await
            .unwrap();
        assert!(!again.applied);
        assert_eq!(again.balance_after, 100);
    }

    #[tokio::test]
    async fn test_insufficient_balance_leaves_no_trace() {
        let (store, user) = store_with_user(10).await;
        let draft = ReservationDraft::new(user.id, OperationKind::Generate, 30);

        let err = store.reserve(&draft).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::InsufficientBalance {
                required: 30,
                available: 10
            }
        ));
        assert!(store.list_operations(user.id, 10, 0).await.unwrap().is_empty());
        assert_eq!(store.find_user(user.id).await.unwrap().unwrap().balance, 10);
    }

    #[tokio::test]
    async fn test_free_credit_returned_on_failure() {
        let (store, user) = store_with_user(0).await;
        store.grant_free_operations(user.id, 1).await.unwrap();

        let reservation = store
            .reserve(&ReservationDraft::new(user.id, OperationKind::Edit, 900))
            .await
            .unwrap();
        assert_eq!(reservation.operation.free_source, Some(FreeSource::FreeCredit));
        assert_eq!(
            store.find_user(user.id).await.unwrap().unwrap().free_operations_left,
            0
        );

        store
            .resolve(reservation.operation_id(), OperationStatus::Failed, Some("nsfw"))
            .await
            .unwrap();
        let user = store.find_user(user.id).await.unwrap().unwrap();
        assert_eq!(user.free_operations_left, 1);
        assert_eq!(user.balance, 0);
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let store = MemoryLedgerStore::new();
        let err = store
            .resolve(Uuid::now_v7(), OperationStatus::Charged, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OperationNotFound(_)));
    }
}
