//! Balance conservation over arbitrary reserve/resolve sequences

mod common;

use common::{billing, user_with_balance};
use medialab_core::models::OperationStatus;
use proptest::prelude::*;

const KINDS: [&str; 3] = ["generate", "edit", "upscale"];
const START: i64 = 500;

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Confirm,
    Refund,
    Fail,
    Leave,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        Just(Outcome::Confirm),
        Just(Outcome::Refund),
        Just(Outcome::Fail),
        Just(Outcome::Leave),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn balance_delta_matches_charged_and_reserved(
        steps in prop::collection::vec((0..KINDS.len(), outcome(), 1..4usize), 0..25)
    ) {
        let (balance, ledger_sum, expected) = tokio_test::block_on(async {
            let billing = billing();
            let user_id = user_with_balance(billing.store(), START).await;

            for (kind, outcome, repeats) in steps {
                let Ok(reservation) = billing.reserve(user_id, KINDS[kind], None).await else {
                    continue;
                };
                let id = reservation.operation_id();

                // redelivered resolutions must not move the balance again
                for _ in 0..repeats {
                    match outcome {
                        Outcome::Confirm => { billing.confirm(id).await.unwrap(); }
                        Outcome::Refund => { billing.refund(id).await.unwrap(); }
                        Outcome::Fail => { billing.fail(id, "boom").await.unwrap(); }
                        Outcome::Leave => {}
                    }
                }
            }

            let held: i64 = billing
                .history(user_id, Some(100), 0)
                .await
                .unwrap()
                .iter()
                .filter(|op| {
                    matches!(op.status, OperationStatus::Charged | OperationStatus::Reserved)
                })
                .map(|op| op.price)
                .sum();

            (
                billing.balance(user_id).await.unwrap(),
                billing.store().ledger_sum(user_id),
                START - held,
            )
        });

        prop_assert_eq!(balance, expected);
        prop_assert_eq!(ledger_sum, balance);
        prop_assert!(balance >= 0);
    }
}
