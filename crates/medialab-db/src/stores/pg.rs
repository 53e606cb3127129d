//! PostgreSQL ledger store
//!
//! Each mutating call is one transaction. Rows are locked with
//! `SELECT ... FOR UPDATE` in a fixed order:
//!
//! - reserve: user (with balance), then discount code
//! - resolve: operation, then user (with balance)
//!
//! The user row is always locked before its balance row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medialab_core::{
    models::{
        normalize_code, DiscountCode, EntryType, FreeSource, LedgerEntry, NewDiscountCode,
        Operation, OperationKind, OperationStatus, Quote, Reservation, ReservationDraft,
        Resolution, Transition, User, UserProfile, UserStatistics,
    },
    traits::LedgerStore,
    AppError, AppResult,
};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// PostgreSQL implementation of `LedgerStore`
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Create a new ledger store
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Convert database entry type string to enum
    fn parse_entry_type(s: &str) -> AppResult<EntryType> {
        EntryType::from_str(s)
            .ok_or_else(|| AppError::Database(format!("unknown ledger entry type: {}", s)))
    }
}

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| {
        error!("Database error ({}): {}", context, e);
        AppError::Database(format!("Failed to {}: {}", context, e))
    }
}

async fn insert_ledger_entry(
    conn: &mut PgConnection,
    user_id: i64,
    operation_id: Option<Uuid>,
    entry_type: EntryType,
    amount: i64,
    balance_after: i64,
) -> AppResult<()> {
    if amount == 0 {
        return Ok(());
    }

    sqlx::query(
        r#"
        INSERT INTO ledger_entries (user_id, operation_id, entry_type, amount, balance_after)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(user_id)
    .bind(operation_id)
    .bind(entry_type.to_string())
    .bind(amount)
    .bind(balance_after)
    .execute(conn)
    .await
    .map_err(db_error("record ledger entry"))?;

    Ok(())
}

async fn fetch_user(conn: &mut PgConnection, user_id: i64) -> AppResult<Option<User>> {
    let row = sqlx::query_as::<sqlx::Postgres, UserRow>(
        r#"
        SELECT u.id, u.external_id, u.username, u.first_name, u.last_name,
               u.language_code, u.is_premium, u.has_free_access, u.free_operations_left,
               b.balance, u.last_activity_at, u.created_at, u.updated_at
        FROM users u
        JOIN balances b ON b.user_id = u.id
        WHERE u.id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(conn)
    .await
    .map_err(db_error("find user"))?;

    Ok(row.map(User::from))
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    #[instrument(skip(self, profile), fields(external_id = %profile.external_id))]
    async fn upsert_user(&self, profile: &UserProfile, starting_balance: i64) -> AppResult<User> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        // xmax = 0 only for a freshly inserted row
        let (user_id, inserted) = sqlx::query_as::<sqlx::Postgres, (i64, bool)>(
            r#"
            INSERT INTO users (external_id, username, first_name, last_name, language_code, is_premium)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (external_id) DO UPDATE
            SET username = EXCLUDED.username,
                first_name = EXCLUDED.first_name,
                last_name = EXCLUDED.last_name,
                language_code = EXCLUDED.language_code,
                is_premium = EXCLUDED.is_premium,
                last_activity_at = NOW(),
                updated_at = NOW()
            RETURNING id, (xmax = 0) AS inserted
            "#,
        )
        .bind(&profile.external_id)
        .bind(&profile.username)
        .bind(&profile.first_name)
        .bind(&profile.last_name)
        .bind(&profile.language_code)
        .bind(profile.is_premium)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("upsert user"))?;

        if inserted {
            sqlx::query("INSERT INTO balances (user_id, balance) VALUES ($1, $2)")
                .bind(user_id)
                .bind(starting_balance)
                .execute(&mut *tx)
                .await
                .map_err(db_error("create balance"))?;

            insert_ledger_entry(
                &mut tx,
                user_id,
                None,
                EntryType::StartingBonus,
                starting_balance,
                starting_balance,
            )
            .await?;

            info!("Registered user {} with balance {}", user_id, starting_balance);
        }

        let user = fetch_user(&mut tx, user_id)
            .await?
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(user)
    }

    #[instrument(skip(self))]
    async fn find_user(&self, user_id: i64) -> AppResult<Option<User>> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            error!("Failed to acquire connection: {}", e);
            AppError::Pool(format!("Failed to acquire connection: {}", e))
        })?;
        fetch_user(&mut conn, user_id).await
    }

    #[instrument(skip(self))]
    async fn find_user_by_external_id(&self, external_id: &str) -> AppResult<Option<User>> {
        let row = sqlx::query_as::<sqlx::Postgres, UserRow>(
            r#"
            SELECT u.id, u.external_id, u.username, u.first_name, u.last_name,
                   u.language_code, u.is_premium, u.has_free_access, u.free_operations_left,
                   b.balance, u.last_activity_at, u.created_at, u.updated_at
            FROM users u
            JOIN balances b ON b.user_id = u.id
            WHERE u.external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find user by external id"))?;

        Ok(row.map(User::from))
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

        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        let balance: i64 = sqlx::query_scalar(
            r#"
            UPDATE balances
            SET balance = balance + $2,
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING balance
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("credit balance"))?
        .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))?;

        insert_ledger_entry(&mut tx, user_id, None, entry_type, amount, balance).await?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(balance)
    }

    #[instrument(skip(self))]
    async fn grant_free_operations(&self, user_id: i64, count: i32) -> AppResult<User> {
        let updated = sqlx::query(
            r#"
            UPDATE users
            SET free_operations_left = GREATEST(free_operations_left + $2, 0),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(count)
        .execute(&self.pool)
        .await
        .map_err(db_error("grant free operations"))?;

        if updated.rows_affected() == 0 {
            return Err(AppError::UserNotFound(user_id.to_string()));
        }

        self.find_user(user_id)
            .await?
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
    }

    #[instrument(skip(self))]
    async fn set_free_access(&self, user_id: i64, enabled: bool) -> AppResult<User> {
        let updated = sqlx::query(
            "UPDATE users SET has_free_access = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id)
        .bind(enabled)
        .execute(&self.pool)
        .await
        .map_err(db_error("set free access"))?;

        if updated.rows_affected() == 0 {
            return Err(AppError::UserNotFound(user_id.to_string()));
        }

        self.find_user(user_id)
            .await?
            .ok_or_else(|| AppError::UserNotFound(user_id.to_string()))
    }

    #[instrument(skip(self, code), fields(code = %code.code))]
    async fn create_discount_code(&self, code: &NewDiscountCode) -> AppResult<DiscountCode> {
        let row = sqlx::query_as::<sqlx::Postgres, DiscountCodeRow>(
            r#"
            INSERT INTO discount_codes (
                code, discount_percent, is_free_generation, max_uses, valid_from, valid_until
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id, code, discount_percent, is_free_generation, max_uses,
                      current_uses, is_active, valid_from, valid_until, created_at
            "#,
        )
        .bind(&code.code)
        .bind(code.discount_percent)
        .bind(code.is_free_generation)
        .bind(code.max_uses)
        .bind(code.valid_from)
        .bind(code.valid_until)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::AlreadyExists(format!("discount code {}", code.code))
            }
            e => db_error("create discount code")(e),
        })?;

        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn find_discount_code(&self, code: &str) -> AppResult<Option<DiscountCode>> {
        let row = sqlx::query_as::<sqlx::Postgres, DiscountCodeRow>(
            r#"
            SELECT id, code, discount_percent, is_free_generation, max_uses,
                   current_uses, is_active, valid_from, valid_until, created_at
            FROM discount_codes
            WHERE code = $1
            "#,
        )
        .bind(normalize_code(code))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find discount code"))?;

        Ok(row.map(DiscountCode::from))
    }

    #[instrument(skip(self, draft), fields(user_id = draft.user_id, kind = %draft.kind))]
    async fn reserve(&self, draft: &ReservationDraft) -> AppResult<Reservation> {
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        // Lock user and balance rows
        let user: User = sqlx::query_as::<sqlx::Postgres, UserRow>(
            r#"
            SELECT u.id, u.external_id, u.username, u.first_name, u.last_name,
                   u.language_code, u.is_premium, u.has_free_access, u.free_operations_left,
                   b.balance, u.last_activity_at, u.created_at, u.updated_at
            FROM users u
            JOIN balances b ON b.user_id = u.id
            WHERE u.id = $1
            FOR UPDATE
            "#,
        )
        .bind(draft.user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock user"))?
        .ok_or_else(|| AppError::UserNotFound(draft.user_id.to_string()))?
        .into();

        // Lock the discount code row
        let code = match &draft.discount_code {
            Some(raw) => {
                let normalized = normalize_code(raw);
                let code: DiscountCode = sqlx::query_as::<sqlx::Postgres, DiscountCodeRow>(
                    r#"
                    SELECT id, code, discount_percent, is_free_generation, max_uses,
                           current_uses, is_active, valid_from, valid_until, created_at
                    FROM discount_codes
                    WHERE code = $1
                    FOR UPDATE
                    "#,
                )
                .bind(&normalized)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("lock discount code"))?
                .ok_or_else(|| AppError::InvalidDiscountCode(format!("{} not found", normalized)))?
                .into();

                code.ensure_redeemable(Utc::now())?;
                Some(code)
            }
            None => None,
        };

        let quote = Quote::compute(draft.base_price, &user, code.as_ref());
        debug!(
            "Quoted {} for user {}: price {}, free source {:?}",
            draft.kind, user.id, quote.price, quote.free_source
        );

        if !quote.is_free() && user.balance < quote.price {
            warn!(
                "Insufficient balance for user {}: required {}, available {}",
                user.id, quote.price, user.balance
            );
            return Err(AppError::InsufficientBalance {
                required: quote.price,
                available: user.balance,
            });
        }

        let discount_code_id = match (&code, quote.consumes_code) {
            (Some(code), true) => {
                sqlx::query(
                    "UPDATE discount_codes SET current_uses = current_uses + 1 WHERE id = $1",
                )
                .bind(code.id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("redeem discount code"))?;
                Some(code.id)
            }
            _ => None,
        };

        let balance_after: i64 = sqlx::query_scalar(
            r#"
            UPDATE balances
            SET balance = balance - $2,
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING balance
            "#,
        )
        .bind(user.id)
        .bind(quote.price)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("debit balance"))?;

        if quote.consumes_credit {
            sqlx::query(
                r#"
                UPDATE users
                SET free_operations_left = free_operations_left - 1,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(user.id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("consume free operation"))?;
        }

        let operation: Operation = sqlx::query_as::<sqlx::Postgres, OperationRow>(
            r#"
            INSERT INTO operations (
                id, user_id, kind, model, status, price, original_price,
                discount_code_id, discount_percent, is_free, free_source,
                prompt, image_count
            )
            VALUES ($1, $2, $3, $4, 'reserved', $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING id, user_id, kind, model, status, price, original_price,
                      discount_code_id, discount_percent, is_free, free_source,
                      prompt, image_count, failure_reason, created_at, resolved_at
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(user.id)
        .bind(draft.kind.to_string())
        .bind(&draft.model)
        .bind(quote.price)
        .bind(quote.original_price)
        .bind(discount_code_id)
        .bind(quote.discount_percent)
        .bind(quote.is_free())
        .bind(quote.free_source.map(|s| s.to_string()))
        .bind(&draft.prompt)
        .bind(draft.image_count)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("create operation"))?
        .try_into()?;

        insert_ledger_entry(
            &mut tx,
            user.id,
            Some(operation.id),
            EntryType::Reserve,
            -quote.price,
            balance_after,
        )
        .await?;

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

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
        let mut tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to start transaction: {}", e);
            AppError::Transaction(format!("Failed to start transaction: {}", e))
        })?;

        // Lock operation row
        let operation: Operation = sqlx::query_as::<sqlx::Postgres, OperationRow>(
            r#"
            SELECT id, user_id, kind, model, status, price, original_price,
                   discount_code_id, discount_percent, is_free, free_source,
                   prompt, image_count, failure_reason, created_at, resolved_at
            FROM operations
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(operation_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("lock operation"))?
        .ok_or_else(|| AppError::OperationNotFound(operation_id.to_string()))?
        .try_into()?;

        let transition = operation.status.transition(target, operation_id)?;

        // Lock owner and balance rows in the same order reserve does
        let balance: i64 = sqlx::query_scalar(
            r#"
            SELECT b.balance
            FROM users u
            JOIN balances b ON b.user_id = u.id
            WHERE u.id = $1
            FOR UPDATE
            "#,
        )
        .bind(operation.user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("lock user"))?;

        if transition == Transition::AlreadyApplied {
            tx.commit().await.map_err(|e| {
                error!("Failed to commit transaction: {}", e);
                AppError::Transaction(format!("Failed to commit transaction: {}", e))
            })?;
            return Ok(Resolution {
                operation,
                applied: false,
                balance_after: balance,
            });
        }

        let balance_after = if target.returns_funds() {
            let balance_after: i64 = sqlx::query_scalar(
                r#"
                UPDATE balances
                SET balance = balance + $2,
                    updated_at = NOW()
                WHERE user_id = $1
                RETURNING balance
                "#,
            )
            .bind(operation.user_id)
            .bind(operation.price)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("credit balance"))?;

            if operation.free_source == Some(FreeSource::FreeCredit) {
                sqlx::query(
                    r#"
                    UPDATE users
                    SET free_operations_left = free_operations_left + 1,
                        updated_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(operation.user_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("return free operation"))?;
            }

            balance_after
        } else {
            balance
        };

        let failure_reason = match target {
            OperationStatus::Failed => reason,
            _ => None,
        };

        let operation: Operation = sqlx::query_as::<sqlx::Postgres, OperationRow>(
            r#"
            UPDATE operations
            SET status = $2,
                failure_reason = COALESCE($3, failure_reason),
                resolved_at = NOW()
            WHERE id = $1
            RETURNING id, user_id, kind, model, status, price, original_price,
                      discount_code_id, discount_percent, is_free, free_source,
                      prompt, image_count, failure_reason, created_at, resolved_at
            "#,
        )
        .bind(operation_id)
        .bind(target.to_string())
        .bind(failure_reason)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_error("update operation status"))?
        .try_into()?;

        let entry_type = match target {
            OperationStatus::Refunded => Some(EntryType::Refund),
            OperationStatus::Failed => Some(EntryType::Fail),
            _ => None,
        };
        if let Some(entry_type) = entry_type {
            insert_ledger_entry(
                &mut tx,
                operation.user_id,
                Some(operation_id),
                entry_type,
                operation.price,
                balance_after,
            )
            .await?;
        }

        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            AppError::Transaction(format!("Failed to commit transaction: {}", e))
        })?;

        Ok(Resolution {
            operation,
            applied: true,
            balance_after,
        })
    }

    #[instrument(skip(self))]
    async fn find_operation(&self, operation_id: Uuid) -> AppResult<Option<Operation>> {
        let row = sqlx::query_as::<sqlx::Postgres, OperationRow>(
            r#"
            SELECT id, user_id, kind, model, status, price, original_price,
                   discount_code_id, discount_percent, is_free, free_source,
                   prompt, image_count, failure_reason, created_at, resolved_at
            FROM operations
            WHERE id = $1
            "#,
        )
        .bind(operation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find operation"))?;

        row.map(Operation::try_from).transpose()
    }

    #[instrument(skip(self))]
    async fn list_operations(
        &self,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<Operation>> {
        let rows = sqlx::query_as::<sqlx::Postgres, OperationRow>(
            r#"
            SELECT id, user_id, kind, model, status, price, original_price,
                   discount_code_id, discount_percent, is_free, free_source,
                   prompt, image_count, failure_reason, created_at, resolved_at
            FROM operations
            WHERE user_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list operations"))?;

        rows.into_iter().map(Operation::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn stale_reservations(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> AppResult<Vec<Operation>> {
        let rows = sqlx::query_as::<sqlx::Postgres, OperationRow>(
            r#"
            SELECT id, user_id, kind, model, status, price, original_price,
                   discount_code_id, discount_percent, is_free, free_source,
                   prompt, image_count, failure_reason, created_at, resolved_at
            FROM operations
            WHERE status = 'reserved' AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("find stale reservations"))?;

        rows.into_iter().map(Operation::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn ledger_entries(&self, user_id: i64, limit: i64) -> AppResult<Vec<LedgerEntry>> {
        let rows = sqlx::query_as::<sqlx::Postgres, LedgerEntryRow>(
            r#"
            SELECT id, user_id, operation_id, entry_type, amount, balance_after, created_at
            FROM ledger_entries
            WHERE user_id = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list ledger entries"))?;

        rows.into_iter()
            .map(|row| {
                Ok(LedgerEntry {
                    id: row.id,
                    user_id: row.user_id,
                    operation_id: row.operation_id,
                    entry_type: Self::parse_entry_type(&row.entry_type)?,
                    amount: row.amount,
                    balance_after: row.balance_after,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    #[instrument(skip(self))]
    async fn charged_user_ids(&self) -> AppResult<Vec<i64>> {
        sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM operations WHERE status = 'charged' ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list charged users"))
    }

    #[instrument(skip(self))]
    async fn charged_operations(&self, user_id: i64) -> AppResult<Vec<Operation>> {
        let rows = sqlx::query_as::<sqlx::Postgres, OperationRow>(
            r#"
            SELECT id, user_id, kind, model, status, price, original_price,
                   discount_code_id, discount_percent, is_free, free_source,
                   prompt, image_count, failure_reason, created_at, resolved_at
            FROM operations
            WHERE user_id = $1 AND status = 'charged'
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("list charged operations"))?;

        rows.into_iter().map(Operation::try_from).collect()
    }

    #[instrument(skip(self, stats), fields(user_id = stats.user_id))]
    async fn upsert_statistics(&self, stats: &UserStatistics) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO user_statistics (
                user_id, total_operations, total_spent, operations_by_type,
                models_used, first_operation_at, last_operation_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (user_id) DO UPDATE
            SET total_operations = EXCLUDED.total_operations,
                total_spent = EXCLUDED.total_spent,
                operations_by_type = EXCLUDED.operations_by_type,
                models_used = EXCLUDED.models_used,
                first_operation_at = EXCLUDED.first_operation_at,
                last_operation_at = EXCLUDED.last_operation_at,
                updated_at = NOW()
            "#,
        )
        .bind(stats.user_id)
        .bind(stats.total_operations)
        .bind(stats.total_spent)
        .bind(Json(&stats.operations_by_type))
        .bind(Json(&stats.models_used))
        .bind(stats.first_operation_at)
        .bind(stats.last_operation_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("upsert user statistics"))?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn user_statistics(&self, user_id: i64) -> AppResult<Option<UserStatistics>> {
        let row = sqlx::query_as::<sqlx::Postgres, StatisticsRow>(
            r#"
            SELECT user_id, total_operations, total_spent, operations_by_type,
                   models_used, first_operation_at, last_operation_at, updated_at
            FROM user_statistics
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("find user statistics"))?;

        Ok(row.map(|row| UserStatistics {
            user_id: row.user_id,
            total_operations: row.total_operations,
            total_spent: row.total_spent,
            operations_by_type: row.operations_by_type.0,
            models_used: row.models_used.0,
            first_operation_at: row.first_operation_at,
            last_operation_at: row.last_operation_at,
            updated_at: row.updated_at,
        }))
    }
}

/// Helper structs for mapping database rows
#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    external_id: String,
    username: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    language_code: Option<String>,
    is_premium: bool,
    has_free_access: bool,
    free_operations_left: i32,
    balance: i64,
    last_activity_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        Self {
            id: row.id,
            external_id: row.external_id,
            username: row.username,
            first_name: row.first_name,
            last_name: row.last_name,
            language_code: row.language_code,
            is_premium: row.is_premium,
            has_free_access: row.has_free_access,
            free_operations_left: row.free_operations_left,
            balance: row.balance,
            last_activity_at: row.last_activity_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct DiscountCodeRow {
    id: i64,
    code: String,
    discount_percent: i32,
    is_free_generation: bool,
    max_uses: Option<i32>,
    current_uses: i32,
    is_active: bool,
    valid_from: Option<DateTime<Utc>>,
    valid_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<DiscountCodeRow> for DiscountCode {
    fn from(row: DiscountCodeRow) -> Self {
        Self {
            id: row.id,
            code: row.code,
            discount_percent: row.discount_percent,
            is_free_generation: row.is_free_generation,
            max_uses: row.max_uses,
            current_uses: row.current_uses,
            is_active: row.is_active,
            valid_from: row.valid_from,
            valid_until: row.valid_until,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OperationRow {
    id: Uuid,
    user_id: i64,
    kind: String,
    model: Option<String>,
    status: String,
    price: i64,
    original_price: Option<i64>,
    discount_code_id: Option<i64>,
    discount_percent: Option<i32>,
    is_free: bool,
    free_source: Option<String>,
    prompt: Option<String>,
    image_count: i32,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TryFrom<OperationRow> for Operation {
    type Error = AppError;

    fn try_from(row: OperationRow) -> Result<Self, Self::Error> {
        let kind = OperationKind::from_str(&row.kind)?;
        let status = OperationStatus::from_str(&row.status).ok_or_else(|| {
            AppError::Database(format!(
                "operation {} has unknown status {}",
                row.id, row.status
            ))
        })?;

        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            kind,
            model: row.model,
            status,
            price: row.price,
            original_price: row.original_price,
            discount_code_id: row.discount_code_id,
            discount_percent: row.discount_percent,
            is_free: row.is_free,
            free_source: row.free_source.as_deref().and_then(FreeSource::from_str),
            prompt: row.prompt,
            image_count: row.image_count,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            resolved_at: row.resolved_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerEntryRow {
    id: i64,
    user_id: i64,
    operation_id: Option<Uuid>,
    entry_type: String,
    amount: i64,
    balance_after: i64,
    created_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct StatisticsRow {
    user_id: i64,
    total_operations: i64,
    total_spent: i64,
    operations_by_type: Json<BTreeMap<String, i64>>,
    models_used: Json<BTreeMap<String, i64>>,
    first_operation_at: Option<DateTime<Utc>>,
    last_operation_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entry_type() {
        assert_eq!(
            PgLedgerStore::parse_entry_type("refund").unwrap(),
            EntryType::Refund
        );
        assert!(PgLedgerStore::parse_entry_type("bonus").is_err());
    }

    #[test]
    fn test_operation_row_conversion() {
        let row = OperationRow {
            id: Uuid::now_v7(),
            user_id: 1,
            kind: "face_swap".to_string(),
            model: None,
            status: "charged".to_string(),
            price: 400,
            original_price: None,
            discount_code_id: None,
            discount_percent: None,
            is_free: false,
            free_source: Some("free_credit".to_string()),
            prompt: None,
            image_count: 1,
            failure_reason: None,
            created_at: Utc::now(),
            resolved_at: Some(Utc::now()),
        };

        let op = Operation::try_from(row).unwrap();
        assert_eq!(op.kind, OperationKind::FaceSwap);
        assert_eq!(op.status, OperationStatus::Charged);
        assert_eq!(op.free_source, Some(FreeSource::FreeCredit));
    }

    #[test]
    fn test_operation_row_rejects_unknown_status() {
        let row = OperationRow {
            id: Uuid::now_v7(),
            user_id: 1,
            kind: "generate".to_string(),
            model: None,
            status: "pending".to_string(),
            price: 900,
            original_price: None,
            discount_code_id: None,
            discount_percent: None,
            is_free: false,
            free_source: None,
            prompt: None,
            image_count: 1,
            failure_reason: None,
            created_at: Utc::now(),
            resolved_at: None,
        };

        assert!(matches!(
            Operation::try_from(row),
            Err(AppError::Database(_))
        ));
    }
}
