//! Billing service tests against the in-memory ledger store

mod common;

use chrono::{Duration, Utc};
use common::{billing, user_with_balance};
use medialab_core::models::{FreeSource, NewDiscountCode, OperationStatus, UserProfile};
use medialab_core::traits::LedgerStore;
use medialab_core::AppError;
use medialab_services::constants::RESERVATION_EXPIRED_REASON;
use uuid::Uuid;

#[tokio::test]
async fn test_reserve_then_confirm_keeps_debit() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 100).await;

    let reservation = billing.reserve(user_id, "generate", None).await.unwrap();
    assert_eq!(reservation.price(), 30);
    assert_eq!(reservation.balance_after, 70);
    assert_eq!(reservation.operation.status, OperationStatus::Reserved);

    let resolution = billing.confirm(reservation.operation_id()).await.unwrap();
    assert!(resolution.applied);
    assert_eq!(resolution.operation.status, OperationStatus::Charged);
    assert_eq!(billing.balance(user_id).await.unwrap(), 70);
}

#[tokio::test]
async fn test_terminal_failure_returns_price() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 100).await;
    let reservation = billing.reserve(user_id, "generate", None).await.unwrap();

    let resolution = billing
        .fail(reservation.operation_id(), "provider rejected prompt")
        .await
        .unwrap();

    assert_eq!(resolution.operation.status, OperationStatus::Failed);
    assert_eq!(
        resolution.operation.failure_reason.as_deref(),
        Some("provider rejected prompt")
    );
    assert_eq!(billing.balance(user_id).await.unwrap(), 100);
}

#[tokio::test]
async fn test_percentage_code_snapshots_discount() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 100).await;
    billing
        .create_discount_code(&NewDiscountCode::percent("SAVE20", 20))
        .await
        .unwrap();

    let reservation = billing
        .reserve(user_id, "edit", Some("save20"))
        .await
        .unwrap();
    let op = &reservation.operation;

    assert_eq!(op.price, 40);
    assert_eq!(op.original_price, Some(50));
    assert_eq!(op.discount_percent, Some(20));
    assert!(op.discount_code_id.is_some());
    assert_eq!(reservation.balance_after, 60);

    let code = billing
        .store()
        .find_discount_code("SAVE20")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(code.current_uses, 1);
}

#[tokio::test]
async fn test_insufficient_balance_creates_nothing() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 10).await;

    let err = billing.reserve(user_id, "generate", None).await.unwrap_err();
    assert!(matches!(
        err,
        AppError::InsufficientBalance {
            required: 30,
            available: 10
        }
    ));

    assert!(billing.history(user_id, None, 0).await.unwrap().is_empty());
    assert_eq!(billing.balance(user_id).await.unwrap(), 10);
}

#[tokio::test]
async fn test_confirm_and_refund_are_idempotent() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 100).await;

    let charged = billing.reserve(user_id, "generate", None).await.unwrap();
    assert!(billing.confirm(charged.operation_id()).await.unwrap().applied);
    assert!(!billing.confirm(charged.operation_id()).await.unwrap().applied);

    let refunded = billing.reserve(user_id, "generate", None).await.unwrap();
    assert!(billing.refund(refunded.operation_id()).await.unwrap().applied);
    let again = billing.refund(refunded.operation_id()).await.unwrap();
    assert!(!again.applied);

    // 100 - 30 charged; the refunded reservation nets to zero
    assert_eq!(again.balance_after, 70);
    assert_eq!(billing.balance(user_id).await.unwrap(), 70);
    assert_eq!(billing.store().ledger_sum(user_id), 70);
}

#[tokio::test]
async fn test_cross_terminal_transition_rejected() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 100).await;
    let reservation = billing.reserve(user_id, "generate", None).await.unwrap();
    billing.confirm(reservation.operation_id()).await.unwrap();

    let err = billing
        .refund(reservation.operation_id())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidStateTransition { .. }));
    assert!(err.is_ledger_anomaly());
    assert_eq!(billing.balance(user_id).await.unwrap(), 70);
}

#[tokio::test]
async fn test_unknown_operation_and_kind() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 100).await;

    assert!(matches!(
        billing.confirm(Uuid::now_v7()).await.unwrap_err(),
        AppError::OperationNotFound(_)
    ));
    assert!(matches!(
        billing.reserve(user_id, "teleport", None).await.unwrap_err(),
        AppError::UnknownOperationKind(_)
    ));
    assert_eq!(billing.balance(user_id).await.unwrap(), 100);
}

#[tokio::test]
async fn test_invalid_code_rejected_before_debit() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 100).await;

    let err = billing
        .reserve(user_id, "generate", Some("NOPE"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidDiscountCode(_)));
    assert_eq!(billing.balance(user_id).await.unwrap(), 100);

    // a blank code means no code
    let reservation = billing.reserve(user_id, "generate", Some("  ")).await.unwrap();
    assert_eq!(reservation.price(), 30);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_single_use_code() {
    let billing = billing();
    billing
        .create_discount_code(&NewDiscountCode::percent("ONCE", 50).with_max_uses(1))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let billing = billing.clone();
        handles.push(tokio::spawn(async move {
            let user_id = user_with_balance(billing.store(), 100).await;
            billing.reserve(user_id, "generate", Some("ONCE")).await
        }));
    }

    let results: Vec<_> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(AppError::InvalidDiscountCode(_))))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_free_credit_returned_on_failure() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 0).await;
    billing.grant_free_operations(user_id, 1).await.unwrap();

    let reservation = billing.reserve(user_id, "generate", None).await.unwrap();
    assert_eq!(reservation.price(), 0);
    assert!(reservation.operation.is_free);
    assert_eq!(reservation.operation.free_source, Some(FreeSource::FreeCredit));
    assert_eq!(billing.user(user_id).await.unwrap().free_operations_left, 0);

    billing
        .fail(reservation.operation_id(), "provider timeout")
        .await
        .unwrap();
    assert_eq!(billing.user(user_id).await.unwrap().free_operations_left, 1);
}

#[tokio::test]
async fn test_free_code_is_consumed_and_not_restored() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 0).await;
    billing
        .create_discount_code(&NewDiscountCode::free_generation("GIFT").with_max_uses(1))
        .await
        .unwrap();

    let reservation = billing
        .reserve(user_id, "generate", Some("gift"))
        .await
        .unwrap();
    assert_eq!(reservation.operation.free_source, Some(FreeSource::FreeCode));
    billing.refund(reservation.operation_id()).await.unwrap();

    let err = billing
        .reserve(user_id, "generate", Some("gift"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidDiscountCode(_)));
}

#[tokio::test]
async fn test_free_access_skips_debit() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 0).await;
    billing.set_free_access(user_id, true).await.unwrap();

    let reservation = billing.reserve(user_id, "edit", None).await.unwrap();
    assert_eq!(reservation.price(), 0);
    assert_eq!(reservation.operation.original_price, Some(50));
    assert_eq!(reservation.operation.free_source, Some(FreeSource::FreeAccess));
}

#[tokio::test]
async fn test_sweep_fails_stale_reservations() {
    let billing = billing();
    let user_id = user_with_balance(billing.store(), 100).await;

    let stale = billing.reserve(user_id, "generate", None).await.unwrap();
    let fresh = billing.reserve(user_id, "generate", None).await.unwrap();
    billing
        .store()
        .set_operation_created_at(stale.operation_id(), Utc::now() - Duration::days(2));

    assert_eq!(billing.sweep_stale_reservations().await.unwrap(), 1);
    assert_eq!(billing.sweep_stale_reservations().await.unwrap(), 0);

    let op = billing.operation(stale.operation_id()).await.unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.failure_reason.as_deref(), Some(RESERVATION_EXPIRED_REASON));
    assert_eq!(
        billing.operation(fresh.operation_id()).await.unwrap().status,
        OperationStatus::Reserved
    );
    assert_eq!(billing.balance(user_id).await.unwrap(), 70);
}

#[tokio::test]
async fn test_register_and_top_up() {
    let billing = billing();
    let profile = UserProfile::new("tg-100");

    let user = billing.register_user(&profile).await.unwrap();
    let again = billing.register_user(&profile).await.unwrap();
    assert_eq!(user.id, again.id);
    assert_eq!(again.balance, 3000);

    assert_eq!(billing.top_up(user.id, 500).await.unwrap(), 3500);
    assert!(matches!(
        billing.top_up(user.id, 0).await.unwrap_err(),
        AppError::InvalidInput(_)
    ));
    assert_eq!(billing.store().ledger_sum(user.id), 3500);

    let entries = billing.ledger(user.id, 10).await.unwrap();
    assert_eq!(entries.len(), 2);

    assert!(matches!(
        billing.register_user(&UserProfile::new(" ")).await.unwrap_err(),
        AppError::Validation(_)
    ));
}
