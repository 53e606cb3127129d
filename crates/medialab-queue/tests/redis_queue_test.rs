//! Redis job queue tests
//!
//! Require a running Redis: `REDIS_URL=redis://... cargo test -- --ignored`

use chrono::Utc;
use medialab_core::models::{JobDescriptor, NackOutcome, OperationKind, RetryPolicy};
use medialab_core::traits::JobQueue;
use medialab_queue::RedisJobQueue;
use std::time::Duration;
use uuid::Uuid;

async fn queue() -> RedisJobQueue {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    // a fresh queue name per test keeps runs independent
    let name = format!("test-{}", Uuid::now_v7().simple());
    RedisJobQueue::new(&url, "medialab-test", &name)
        .await
        .expect("redis available")
}

fn job() -> JobDescriptor {
    JobDescriptor {
        job_id: Uuid::now_v7(),
        operation_id: Uuid::now_v7(),
        user_id: 7,
        kind: OperationKind::Upscale,
        params: serde_json::json!({"scale": 2}),
        enqueued_at: Utc::now(),
    }
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_enqueue_dequeue_ack() {
    let queue = queue().await;
    let j = job();
    queue.enqueue(&j).await.unwrap();

    let delivery = queue
        .dequeue(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.descriptor, j);
    assert_eq!(delivery.attempt, 1);
    assert_eq!(queue.depth().await.unwrap().in_flight, 1);

    assert!(queue.ack(j.job_id, delivery.lease_token).await.unwrap());
    assert_eq!(queue.depth().await.unwrap().total(), 0);
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_expired_lease_is_redelivered() {
    let queue = queue().await;
    let j = job();
    queue.enqueue(&j).await.unwrap();

    let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = queue
        .dequeue(Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(second.attempt, 2);
    assert!(!queue.ack(j.job_id, first.lease_token).await.unwrap());
    assert!(queue.ack(j.job_id, second.lease_token).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis
async fn test_nack_reschedules_then_exhausts() {
    let queue = queue().await;
    let policy = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };
    let j = job();
    queue.enqueue(&j).await.unwrap();

    let d1 = queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
    assert!(matches!(
        queue.nack(j.job_id, d1.lease_token, &policy).await.unwrap(),
        NackOutcome::Requeued { .. }
    ));

    let d2 = queue.dequeue(Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(d2.attempt, 2);
    assert_eq!(
        queue.nack(j.job_id, d2.lease_token, &policy).await.unwrap(),
        NackOutcome::Exhausted
    );
    assert_eq!(
        queue.nack(j.job_id, d1.lease_token, &policy).await.unwrap(),
        NackOutcome::LeaseLost
    );
    assert!(queue.ack(j.job_id, d2.lease_token).await.unwrap());
}
