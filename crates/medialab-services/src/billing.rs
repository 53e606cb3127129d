//! Billing service
//!
//! Owns every balance and operation mutation:
//! - Reserve the price of an operation before any work is queued
//! - Confirm it when the job succeeds
//! - Refund or fail it, returning the reserved price exactly once
//! - Account upkeep: registration, top-ups, free operations, discount codes
//!
//! Confirm, refund and fail are idempotent per operation id, so queue
//! redeliveries can call them again without touching the balance twice.

use chrono::Utc;
use medialab_core::{
    config::BillingConfig,
    models::{
        DiscountCode, EntryType, LedgerEntry, NewDiscountCode, Operation, OperationKind,
        OperationStatus, Reservation, ReservationDraft, Resolution, User, UserProfile,
        UserStatistics,
    },
    pricing::PriceTable,
    traits::LedgerStore,
    AppError, AppResult,
};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::constants::{
    DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT, RESERVATION_EXPIRED_REASON, SWEEP_BATCH_SIZE,
};

/// Request to reserve one operation
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    pub user_id: i64,
    pub kind: String,
    pub model: Option<String>,
    pub discount_code: Option<String>,
    pub prompt: Option<String>,
    pub image_count: i32,
}

impl ReserveRequest {
    pub fn new(user_id: i64, kind: impl Into<String>) -> Self {
        Self {
            user_id,
            kind: kind.into(),
            model: None,
            discount_code: None,
            prompt: None,
            image_count: 1,
        }
    }

    pub fn discount_code(mut self, code: impl Into<String>) -> Self {
        self.discount_code = Some(code.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }
}

/// Billing service
pub struct BillingService<S: LedgerStore> {
    store: Arc<S>,
    prices: PriceTable,
    config: BillingConfig,
}

impl<S: LedgerStore> BillingService<S> {
    /// Create a new billing service
    pub fn new(store: Arc<S>, prices: PriceTable, config: BillingConfig) -> Self {
        Self {
            store,
            prices,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn prices(&self) -> &PriceTable {
        &self.prices
    }

    /// Reserve the price of `kind` for `user_id`, optionally redeeming a code
    pub async fn reserve(
        &self,
        user_id: i64,
        kind: &str,
        discount_code: Option<&str>,
    ) -> AppResult<Reservation> {
        let mut request = ReserveRequest::new(user_id, kind);
        request.discount_code = discount_code.map(str::to_string);
        self.reserve_request(&request).await
    }

    /// Reserve with the full request: model, prompt and image count
    ///
    /// # Errors
    ///
    /// - `UnknownOperationKind` before any store access
    /// - `InvalidDiscountCode` if the code is unknown, inactive, expired or used up
    /// - `InsufficientBalance` if the quoted price exceeds the balance
    #[instrument(skip(self, request), fields(user_id = request.user_id, kind = %request.kind))]
    pub async fn reserve_request(&self, request: &ReserveRequest) -> AppResult<Reservation> {
        let kind = OperationKind::from_str(&request.kind)?;
        let base_price = self.prices.base_price(kind, request.model.as_deref())?;

        let mut draft = ReservationDraft::new(request.user_id, kind, base_price);
        draft.model = request.model.clone();
        draft.image_count = request.image_count.max(1);
        if let Some(code) = request.discount_code.as_deref() {
            if !code.trim().is_empty() {
                draft = draft.with_discount_code(code);
            }
        }
        if let Some(prompt) = request.prompt.as_deref() {
            draft = draft.with_prompt(prompt);
        }

        match self.store.reserve(&draft).await {
            Ok(reservation) => {
                info!(
                    operation_id = %reservation.operation_id(),
                    price = reservation.price(),
                    base_price,
                    balance = reservation.balance_after,
                    "Reserved operation"
                );
                Ok(reservation)
            }
            Err(e @ AppError::InsufficientBalance { .. })
            | Err(e @ AppError::InvalidDiscountCode(_)) => {
                info!("Reservation rejected: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("Reservation failed: {}", e);
                Err(e)
            }
        }
    }

    /// `Reserved -> Charged`. A repeated confirm is a no-op success.
    pub async fn confirm(&self, operation_id: Uuid) -> AppResult<Resolution> {
        self.transition(operation_id, OperationStatus::Charged, None)
            .await
    }

    /// `Reserved -> Refunded`, returning the reserved price once
    pub async fn refund(&self, operation_id: Uuid) -> AppResult<Resolution> {
        self.transition(operation_id, OperationStatus::Refunded, None)
            .await
    }

    /// `Reserved -> Failed`, returning the reserved price once and keeping `reason`
    pub async fn fail(&self, operation_id: Uuid, reason: &str) -> AppResult<Resolution> {
        self.transition(operation_id, OperationStatus::Failed, Some(reason))
            .await
    }

    #[instrument(skip(self))]
    async fn transition(
        &self,
        operation_id: Uuid,
        target: OperationStatus,
        reason: Option<&str>,
    ) -> AppResult<Resolution> {
        match self.store.resolve(operation_id, target, reason).await {
            Ok(resolution) if resolution.applied => {
                info!(
                    user_id = resolution.operation.user_id,
                    price = resolution.operation.price,
                    balance = resolution.balance_after,
                    "Operation {} -> {}",
                    operation_id,
                    target
                );
                Ok(resolution)
            }
            Ok(resolution) => {
                debug!("Operation {} already {}", operation_id, target);
                Ok(resolution)
            }
            Err(e) if e.is_ledger_anomaly() => {
                error!(
                    error_code = e.error_code(),
                    "Rejected {} for operation {}: {}", target, operation_id, e
                );
                Err(e)
            }
            Err(e) => {
                error!("Failed to move operation {} to {}: {}", operation_id, target, e);
                Err(e)
            }
        }
    }

    /// Get or create the user for `profile`; new users receive the starting balance
    #[instrument(skip(self, profile), fields(external_id = %profile.external_id))]
    pub async fn register_user(&self, profile: &UserProfile) -> AppResult<User> {
        if profile.external_id.trim().is_empty() {
            return Err(AppError::Validation("external_id is required".to_string()));
        }
        self.store
            .upsert_user(profile, self.config.starting_balance)
            .await
    }

    /// Credit a payment to the balance, returning the new balance
    #[instrument(skip(self))]
    pub async fn top_up(&self, user_id: i64, amount: i64) -> AppResult<i64> {
        if amount <= 0 {
            return Err(AppError::InvalidInput(format!(
                "top-up amount must be positive, got {}",
                amount
            )));
        }

        let balance = self
            .store
            .credit_balance(user_id, amount, EntryType::TopUp)
            .await?;
        info!("Topped up user {} by {}, balance {}", user_id, amount, balance);
        Ok(balance)
    }

    pub async fn balance(&self, user_id: i64) -> AppResult<i64> {
        Ok(self.user(user_id).await?.balance)
    }

    pub async fn user(&self, user_id: i64) -> AppResult<User> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
    }

    pub async fn operation(&self, operation_id: Uuid) -> AppResult<Operation> {
        self.store
            .find_operation(operation_id)
            .await?
            .ok_or_else(|| AppError::OperationNotFound(operation_id.to_string()))
    }

    /// Newest operations first; `limit` defaults to 20, at most 100
    pub async fn history(
        &self,
        user_id: i64,
        limit: Option<i64>,
        offset: i64,
    ) -> AppResult<Vec<Operation>> {
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        self.store
            .list_operations(user_id, limit, offset.max(0))
            .await
    }

    pub async fn ledger(&self, user_id: i64, limit: i64) -> AppResult<Vec<LedgerEntry>> {
        self.store
            .ledger_entries(user_id, limit.clamp(1, MAX_HISTORY_LIMIT))
            .await
    }

    pub async fn statistics(&self, user_id: i64) -> AppResult<Option<UserStatistics>> {
        self.store.user_statistics(user_id).await
    }

    #[instrument(skip(self, code), fields(code = %code.code))]
    pub async fn create_discount_code(&self, code: &NewDiscountCode) -> AppResult<DiscountCode> {
        let prepared = code.prepare()?;
        let created = self.store.create_discount_code(&prepared).await?;
        info!(
            "Created discount code {} ({}%, free: {})",
            created.code, created.discount_percent, created.is_free_generation
        );
        Ok(created)
    }

    #[instrument(skip(self))]
    pub async fn grant_free_operations(&self, user_id: i64, count: i32) -> AppResult<User> {
        if count <= 0 {
            return Err(AppError::InvalidInput(format!(
                "free operation count must be positive, got {}",
                count
            )));
        }
        self.store.grant_free_operations(user_id, count).await
    }

    #[instrument(skip(self))]
    pub async fn set_free_access(&self, user_id: i64, enabled: bool) -> AppResult<User> {
        self.store.set_free_access(user_id, enabled).await
    }

    /// Fail every reservation older than the configured TTL, returning how
    /// many were failed. A job still queued for one of them is later dropped
    /// by the worker as stale.
    #[instrument(skip(self))]
    pub async fn sweep_stale_reservations(&self) -> AppResult<usize> {
        let ttl = chrono::Duration::from_std(self.config.reservation_ttl())
            .map_err(|e| AppError::Config(format!("invalid reservation TTL: {}", e)))?;
        let cutoff = Utc::now() - ttl;
        let mut swept = 0;

        loop {
            let stale = self
                .store
                .stale_reservations(cutoff, SWEEP_BATCH_SIZE)
                .await?;
            let batch = stale.len();
            let mut progressed = false;

            for op in stale {
                match self.fail(op.id, RESERVATION_EXPIRED_REASON).await {
                    Ok(resolution) if resolution.applied => {
                        swept += 1;
                        progressed = true;
                    }
                    Ok(_) => progressed = true,
                    // resolved concurrently by a worker
                    Err(AppError::InvalidStateTransition { .. }) => progressed = true,
                    Err(e) => warn!("Failed to expire reservation {}: {}", op.id, e),
                }
            }

            if (batch as i64) < SWEEP_BATCH_SIZE || !progressed {
                break;
            }
        }

        if swept > 0 {
            warn!("Expired {} stale reservations", swept);
        }
        Ok(swept)
    }
}
