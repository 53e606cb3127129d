//! Shared fixtures for service tests: in-memory store and queue, a scripted
//! provider and a notifier that records what it was told.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use medialab_core::config::{BillingConfig, PricingConfig};
use medialab_core::models::{
    Artifact, Delivery, JobDescriptor, JobOutcome, NackOutcome, ProviderResult, ProviderStatus, QueueDepth,
    RetryPolicy, UserProfile,
};
use medialab_core::pricing::PriceTable;
use medialab_core::traits::{GenerationProvider, JobQueue, LedgerStore, OutcomeNotifier};
use medialab_core::{AppError, AppResult};
use medialab_db::MemoryLedgerStore;
use medialab_queue::MemoryJobQueue;
use medialab_services::{BillingService, Worker, WorkerSettings};
use parking_lot::Mutex;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// generate = 30, edit = 50, upscale = 10 (minor units)
pub fn price_table() -> PriceTable {
    let mut kinds = HashMap::new();
    kinds.insert("generate".to_string(), dec!(0.30));
    kinds.insert("edit".to_string(), dec!(0.50));
    kinds.insert("upscale".to_string(), dec!(0.10));
    PriceTable::from_config(&PricingConfig {
        kinds,
        models: Vec::new(),
    })
    .expect("valid price table")
}

pub fn billing_with(store: Arc<MemoryLedgerStore>) -> Arc<BillingService<MemoryLedgerStore>> {
    Arc::new(BillingService::new(
        store,
        price_table(),
        BillingConfig::default(),
    ))
}

pub fn billing() -> Arc<BillingService<MemoryLedgerStore>> {
    billing_with(Arc::new(MemoryLedgerStore::new()))
}

/// Register a fresh user whose starting balance is `balance`
pub async fn user_with_balance(store: &MemoryLedgerStore, balance: i64) -> i64 {
    let profile = UserProfile::new(format!("tg-{}", Uuid::now_v7().simple()));
    store
        .upsert_user(&profile, balance)
        .await
        .expect("user created")
        .id
}

/// Settings with no waiting between polls or retries
pub fn fast_settings(max_attempts: u32) -> WorkerSettings {
    WorkerSettings {
        lease: Duration::from_secs(60),
        poll_interval: Duration::from_millis(5),
        job_timeout: Duration::from_secs(5),
        provider_poll_interval: Duration::from_millis(1),
        retry: RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    }
}

/// One scripted provider reaction per submit call; the last one repeats
#[derive(Debug, Clone)]
pub enum Script {
    Succeed,
    /// Stay pending for this many polls, then succeed
    PendingThenSucceed(usize),
    Retryable,
    Terminal(&'static str),
    /// Never finishes
    Hang,
}

pub struct FakeProvider {
    script: Mutex<VecDeque<Script>>,
    last: Mutex<Script>,
    tasks: Mutex<HashMap<String, (Script, usize)>>,
    pub submits: AtomicUsize,
}

impl FakeProvider {
    pub fn new(script: Vec<Script>) -> Arc<Self> {
        let last = script.last().cloned().unwrap_or(Script::Succeed);
        Arc::new(Self {
            script: Mutex::new(script.into()),
            last: Mutex::new(last),
            tasks: Mutex::new(HashMap::new()),
            submits: AtomicUsize::new(0),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new(vec![Script::Succeed])
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationProvider for FakeProvider {
    async fn submit(&self, _job: &JobDescriptor) -> AppResult<String> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.last.lock().clone());

        match step {
            Script::Retryable => Err(AppError::ProviderRetryable("503 from provider".into())),
            Script::Terminal(reason) => Err(AppError::ProviderTerminal(reason.to_string())),
            other => {
                let task_id = Uuid::new_v4().to_string();
                self.tasks.lock().insert(task_id.clone(), (other, 0));
                Ok(task_id)
            }
        }
    }

    async fn poll(&self, task_id: &str) -> AppResult<ProviderStatus> {
        let mut tasks = self.tasks.lock();
        let Some((step, polls)) = tasks.get_mut(task_id) else {
            return Err(AppError::ProviderTerminal("unknown task".into()));
        };
        *polls += 1;

        let done = match step {
            Script::Succeed => true,
            Script::PendingThenSucceed(n) => *polls > *n,
            _ => false,
        };
        if !done {
            return Ok(ProviderStatus::Pending);
        }

        Ok(ProviderStatus::Completed(vec![ProviderResult {
            task_id: task_id.to_string(),
            url: format!("https://cdn.test/{}.png", task_id),
            content_type: Some("image/png".to_string()),
        }]))
    }

    async fn download(&self, result: &ProviderResult) -> AppResult<Artifact> {
        Ok(Artifact {
            content_type: result.content_type.clone(),
            bytes: Bytes::from_static(b"\x89PNG"),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub outcomes: Mutex<Vec<JobOutcome>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.outcomes.lock().len()
    }

    pub fn successes(&self) -> usize {
        self.outcomes.lock().iter().filter(|o| o.is_success()).count()
    }
}

#[async_trait]
impl OutcomeNotifier for RecordingNotifier {
    async fn notify(&self, outcome: &JobOutcome) -> AppResult<()> {
        self.outcomes.lock().push(outcome.clone());
        Ok(())
    }
}

/// Queue whose enqueue always fails
#[derive(Default)]
pub struct BrokenQueue;

#[async_trait]
impl JobQueue for BrokenQueue {
    async fn enqueue(&self, _job: &JobDescriptor) -> AppResult<()> {
        Err(AppError::QueueConnection("connection refused".into()))
    }

    async fn dequeue(&self, _lease: Duration) -> AppResult<Option<Delivery>> {
        Ok(None)
    }

    async fn ack(&self, _job_id: Uuid, _lease_token: Uuid) -> AppResult<bool> {
        Ok(false)
    }

    async fn nack(
        &self,
        _job_id: Uuid,
        _lease_token: Uuid,
        _policy: &RetryPolicy,
    ) -> AppResult<NackOutcome> {
        Ok(NackOutcome::LeaseLost)
    }

    async fn extend_lease(
        &self,
        _job_id: Uuid,
        _lease_token: Uuid,
        _lease: Duration,
    ) -> AppResult<bool> {
        Ok(false)
    }

    async fn depth(&self) -> AppResult<QueueDepth> {
        Ok(QueueDepth::default())
    }
}

pub fn worker(
    billing: Arc<BillingService<MemoryLedgerStore>>,
    queue: Arc<MemoryJobQueue>,
    provider: Arc<FakeProvider>,
    notifier: Arc<RecordingNotifier>,
    settings: WorkerSettings,
) -> Worker<MemoryLedgerStore> {
    Worker::new(0, billing, queue, provider, notifier, settings)
}
