//! In-process job queue with the same lease semantics as the Redis queue

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medialab_core::{
    models::{Delivery, JobDescriptor, NackOutcome, QueueDepth, RetryPolicy},
    traits::JobQueue,
    AppError, AppResult,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

struct Lease {
    token: Uuid,
    until: DateTime<Utc>,
}

struct Entry {
    descriptor: JobDescriptor,
    attempts: u32,
    lease: Option<Lease>,
    due_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Entry>,
    ready: VecDeque<Uuid>,
}

impl State {
    /// Move due delayed jobs to the back of the ready list and expired leases
    /// to the front
    fn promote(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, Uuid)> = Vec::new();
        let mut expired: Vec<(DateTime<Utc>, Uuid)> = Vec::new();

        for (id, entry) in self.jobs.iter_mut() {
            if let Some(at) = entry.due_at {
                if at <= now {
                    entry.due_at = None;
                    due.push((at, *id));
                }
            }
            if let Some(lease) = &entry.lease {
                if lease.until <= now {
                    expired.push((lease.until, *id));
                    entry.lease = None;
                }
            }
        }

        due.sort();
        self.ready.extend(due.into_iter().map(|(_, id)| id));

        expired.sort();
        for (_, id) in expired.into_iter().rev() {
            self.ready.push_front(id);
        }
    }

    fn leased_mut(&mut self, job_id: Uuid, token: Uuid) -> Option<&mut Entry> {
        self.jobs
            .get_mut(&job_id)
            .filter(|entry| entry.lease.as_ref().map(|l| l.token) == Some(token))
    }
}

/// Job queue held in memory
#[derive(Default)]
pub struct MemoryJobQueue {
    state: Mutex<State>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs not yet acked
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lease_deadline(now: DateTime<Utc>, lease: Duration) -> AppResult<DateTime<Utc>> {
    let lease = chrono::Duration::from_std(lease)
        .map_err(|e| AppError::InvalidInput(format!("lease out of range: {}", e)))?;
    Ok(now + lease)
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &JobDescriptor) -> AppResult<()> {
        let mut state = self.state.lock();
        state.jobs.insert(
            job.job_id,
            Entry {
                descriptor: job.clone(),
                attempts: 0,
                lease: None,
                due_at: None,
            },
        );
        state.ready.push_back(job.job_id);
        debug!("Enqueued job {}", job.job_id);
        Ok(())
    }

    async fn dequeue(&self, lease: Duration) -> AppResult<Option<Delivery>> {
        let now = Utc::now();
        let until = lease_deadline(now, lease)?;
        let mut state = self.state.lock();
        state.promote(now);

        while let Some(id) = state.ready.pop_front() {
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            // skip ids that were re-queued while still scheduled elsewhere
            if entry.lease.is_some() || entry.due_at.is_some() {
                continue;
            }

            let token = Uuid::new_v4();
            entry.attempts += 1;
            entry.lease = Some(Lease { token, until });

            return Ok(Some(Delivery {
                descriptor: entry.descriptor.clone(),
                attempt: entry.attempts,
                lease_token: token,
                leased_until: until,
            }));
        }

        Ok(None)
    }

    async fn ack(&self, job_id: Uuid, lease_token: Uuid) -> AppResult<bool> {
        let mut state = self.state.lock();
        if state.leased_mut(job_id, lease_token).is_none() {
            return Ok(false);
        }
        state.jobs.remove(&job_id);
        Ok(true)
    }

    async fn nack(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        policy: &RetryPolicy,
    ) -> AppResult<NackOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let Some(entry) = state.leased_mut(job_id, lease_token) else {
            return Ok(NackOutcome::LeaseLost);
        };

        if policy.is_exhausted(entry.attempts) {
            return Ok(NackOutcome::Exhausted);
        }

        let delay = policy.delay_for(entry.attempts);
        entry.lease = None;
        entry.due_at = Some(lease_deadline(now, delay)?);
        Ok(NackOutcome::Requeued { delay })
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        lease_token: Uuid,
        lease: Duration,
    ) -> AppResult<bool> {
        let until = lease_deadline(Utc::now(), lease)?;
        let mut state = self.state.lock();
        match state.leased_mut(job_id, lease_token) {
            Some(entry) => {
                if let Some(current) = entry.lease.as_mut() {
                    current.until = until;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn depth(&self) -> AppResult<QueueDepth> {
        let state = self.state.lock();
        let mut depth = QueueDepth::default();
        for entry in state.jobs.values() {
            if entry.lease.is_some() {
                depth.in_flight += 1;
            } else if entry.due_at.is_some() {
                depth.delayed += 1;
            } else {
                depth.ready += 1;
            }
        }
        Ok(depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medialab_core::models::OperationKind;

    fn job() -> JobDescriptor {
        JobDescriptor {
            job_id: Uuid::now_v7(),
            operation_id: Uuid::now_v7(),
            user_id: 1,
            kind: OperationKind::Generate,
            params: serde_json::json!({"prompt": "a cat"}),
            enqueued_at: Utc::now(),
        }
    }

    fn instant_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_fifo_and_single_consumer() {
        let queue = MemoryJobQueue::new();
        let (a, b) = (job(), job());
        queue.enqueue(&a).await.unwrap();
        queue.enqueue(&b).await.unwrap();

        let first = queue.dequeue(LEASE).await.unwrap().unwrap();
        let second = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert_eq!(first.job_id(), a.job_id);
        assert_eq!(second.job_id(), b.job_id);
        assert!(queue.dequeue(LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_redelivers_with_new_token() {
        let queue = MemoryJobQueue::new();
        let j = job();
        queue.enqueue(&j).await.unwrap();

        let first = queue.dequeue(Duration::ZERO).await.unwrap().unwrap();
        let second = queue.dequeue(LEASE).await.unwrap().unwrap();

        assert_eq!(second.job_id(), j.job_id);
        assert_eq!(second.attempt, 2);
        assert_ne!(first.lease_token, second.lease_token);

        // the stale consumer cannot remove the job
        assert!(!queue.ack(j.job_id, first.lease_token).await.unwrap());
        assert!(queue.ack(j.job_id, second.lease_token).await.unwrap());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_nack_until_exhausted() {
        let queue = MemoryJobQueue::new();
        let policy = instant_retry(2);
        let j = job();
        queue.enqueue(&j).await.unwrap();

        let d1 = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert!(matches!(
            queue.nack(j.job_id, d1.lease_token, &policy).await.unwrap(),
            NackOutcome::Requeued { .. }
        ));

        let d2 = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert_eq!(d2.attempt, 2);
        assert_eq!(
            queue.nack(j.job_id, d2.lease_token, &policy).await.unwrap(),
            NackOutcome::Exhausted
        );

        // still leased, so the holder can ack
        assert!(queue.dequeue(LEASE).await.unwrap().is_none());
        assert!(queue.ack(j.job_id, d2.lease_token).await.unwrap());
    }

    #[tokio::test]
    async fn test_nack_with_stale_token() {
        let queue = MemoryJobQueue::new();
        let j = job();
        queue.enqueue(&j).await.unwrap();
        queue.dequeue(LEASE).await.unwrap().unwrap();

        assert_eq!(
            queue
                .nack(j.job_id, Uuid::new_v4(), &instant_retry(3))
                .await
                .unwrap(),
            NackOutcome::LeaseLost
        );
    }

    #[tokio::test]
    async fn test_backoff_delays_redelivery() {
        let queue = MemoryJobQueue::new();
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
        };
        let j = job();
        queue.enqueue(&j).await.unwrap();

        let d = queue.dequeue(LEASE).await.unwrap().unwrap();
        assert_eq!(
            queue.nack(j.job_id, d.lease_token, &policy).await.unwrap(),
            NackOutcome::Requeued {
                delay: Duration::from_secs(30)
            }
        );
        assert!(queue.dequeue(LEASE).await.unwrap().is_none());
        assert_eq!(queue.depth().await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_extend_lease_requires_token() {
        let queue = MemoryJobQueue::new();
        let j = job();
        queue.enqueue(&j).await.unwrap();
        let d = queue.dequeue(LEASE).await.unwrap().unwrap();

        assert!(queue.extend_lease(j.job_id, d.lease_token, LEASE).await.unwrap());
        assert!(!queue
            .extend_lease(j.job_id, Uuid::new_v4(), LEASE)
            .await
            .unwrap());
        assert_eq!(queue.depth().await.unwrap().in_flight, 1);
    }
}
