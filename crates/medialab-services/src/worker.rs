//! Worker pool
//!
//! Each worker leases one job at a time, drives the provider call and settles
//! billing before it acks. Workers keep no state between jobs; every decision
//! about money goes through `BillingService`, whose transitions are
//! idempotent, so a job redelivered after a crash is charged at most once.

use crate::billing::BillingService;
use crate::constants::ATTEMPTS_EXHAUSTED_REASON;
use medialab_core::{
    config::{QueueConfig, WorkerConfig},
    models::{
        Artifact, Delivery, JobOutcome, NackOutcome, OperationStatus, ProviderStatus, RetryPolicy,
    },
    traits::{GenerationProvider, JobQueue, LedgerStore, OutcomeNotifier},
    AppError, AppResult,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Timing and retry settings shared by all workers
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub lease: Duration,
    pub poll_interval: Duration,
    pub job_timeout: Duration,
    pub provider_poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_config(queue: &QueueConfig, worker: &WorkerConfig) -> Self {
        Self {
            lease: queue.lease(),
            poll_interval: queue.poll_interval(),
            job_timeout: worker.job_timeout(),
            provider_poll_interval: worker.provider_poll_interval(),
            retry: RetryPolicy::from(queue),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default(), &WorkerConfig::default())
    }
}

/// What happened to one dequeue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Queue was empty
    Idle,
    /// Charged and acked
    Completed,
    /// Nacked for another attempt
    Retried { delay: Duration },
    /// Failed with the price returned, then acked
    Failed,
    /// Operation already resolved; duplicate delivery acked
    Stale,
    /// Lease moved to another worker mid-job; nothing settled
    LeaseLost,
}

enum ProviderRun {
    Completed(Vec<Artifact>),
    LeaseLost,
}

pub struct Worker<S: LedgerStore> {
    id: usize,
    billing: Arc<BillingService<S>>,
    queue: Arc<dyn JobQueue>,
    provider: Arc<dyn GenerationProvider>,
    notifier: Arc<dyn OutcomeNotifier>,
    settings: WorkerSettings,
}

impl<S: LedgerStore> Worker<S> {
    pub fn new(
        id: usize,
        billing: Arc<BillingService<S>>,
        queue: Arc<dyn JobQueue>,
        provider: Arc<dyn GenerationProvider>,
        notifier: Arc<dyn OutcomeNotifier>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            id,
            billing,
            queue,
            provider,
            notifier,
            settings,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Process jobs until `shutdown` fires. A job in progress is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = self.id, "Worker started");

        while !shutdown.is_cancelled() {
            let pause = match self.process_next().await {
                Ok(ProcessOutcome::Idle) => Some(self.settings.poll_interval),
                Ok(outcome) => {
                    debug!(worker = self.id, ?outcome, "Job processed");
                    None
                }
                Err(e) => {
                    error!(worker = self.id, "Job processing error: {}", e);
                    Some(self.settings.poll_interval)
                }
            };

            if let Some(pause) = pause {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        info!(worker = self.id, "Worker stopped");
    }

    /// Lease and process at most one job
    pub async fn process_next(&self) -> AppResult<ProcessOutcome> {
        match self.queue.dequeue(self.settings.lease).await? {
            Some(delivery) => self.process(&delivery).await,
            None => Ok(ProcessOutcome::Idle),
        }
    }

    #[instrument(skip(self, delivery), fields(
        worker = self.id,
        job_id = %delivery.job_id(),
        operation_id = %delivery.operation_id(),
        attempt = delivery.attempt
    ))]
    async fn process(&self, delivery: &Delivery) -> AppResult<ProcessOutcome> {
        let operation = self
            .billing
            .store()
            .find_operation(delivery.operation_id())
            .await?;

        match operation {
            Some(op) if op.status == OperationStatus::Reserved => {}
            Some(op) => {
                debug!("Operation already {}, dropping duplicate delivery", op.status);
                self.ack(delivery).await?;
                return Ok(ProcessOutcome::Stale);
            }
            None => {
                warn!("No operation for job, dropping it");
                self.ack(delivery).await?;
                return Ok(ProcessOutcome::Stale);
            }
        }

        if delivery.attempt > self.settings.retry.max_attempts {
            return self.settle_failure(delivery, ATTEMPTS_EXHAUSTED_REASON).await;
        }

        let run = match tokio::time::timeout(self.settings.job_timeout, self.call_provider(delivery))
            .await
        {
            Ok(run) => run,
            Err(_) => Err(AppError::ProviderRetryable(format!(
                "job timed out after {}s",
                self.settings.job_timeout.as_secs()
            ))),
        };

        match run {
            Ok(ProviderRun::Completed(artifacts)) => self.settle_success(delivery, artifacts).await,
            Ok(ProviderRun::LeaseLost) => {
                warn!("Lease lost while waiting on provider");
                Ok(ProcessOutcome::LeaseLost)
            }
            Err(e) if e.is_retryable() => {
                warn!("Retryable provider failure: {}", e);
                match self
                    .queue
                    .nack(delivery.job_id(), delivery.lease_token, &self.settings.retry)
                    .await?
                {
                    NackOutcome::Requeued { delay } => Ok(ProcessOutcome::Retried { delay }),
                    NackOutcome::Exhausted => {
                        self.settle_failure(delivery, &e.to_string()).await
                    }
                    NackOutcome::LeaseLost => Ok(ProcessOutcome::LeaseLost),
                }
            }
            Err(AppError::ProviderTerminal(reason)) => {
                self.settle_failure(delivery, &reason).await
            }
            // lease expiry redelivers the job
            Err(e) => Err(e),
        }
    }

    async fn call_provider(&self, delivery: &Delivery) -> AppResult<ProviderRun> {
        let task_id = self.provider.submit(&delivery.descriptor).await?;
        debug!("Provider task {} submitted", task_id);

        let results = loop {
            match self.provider.poll(&task_id).await? {
                ProviderStatus::Completed(results) => break results,
                ProviderStatus::Pending => {
                    tokio::time::sleep(self.settings.provider_poll_interval).await;
                    let extended = self
                        .queue
                        .extend_lease(delivery.job_id(), delivery.lease_token, self.settings.lease)
                        .await?;
                    if !extended {
                        return Ok(ProviderRun::LeaseLost);
                    }
                }
            }
        };

        if results.is_empty() {
            return Err(AppError::ProviderTerminal(format!(
                "provider task {} completed without results",
                task_id
            )));
        }

        let mut artifacts = Vec::with_capacity(results.len());
        for result in &results {
            artifacts.push(self.provider.download(result).await?);
        }
        Ok(ProviderRun::Completed(artifacts))
    }

    async fn settle_success(
        &self,
        delivery: &Delivery,
        artifacts: Vec<Artifact>,
    ) -> AppResult<ProcessOutcome> {
        let resolution = match self.billing.confirm(delivery.operation_id()).await {
            Ok(resolution) => resolution,
            Err(e) if e.is_ledger_anomaly() => {
                self.ack(delivery).await?;
                return Ok(ProcessOutcome::Stale);
            }
            Err(e) => return Err(e),
        };

        if resolution.applied {
            let outcome = JobOutcome::Succeeded {
                operation: resolution.operation,
                artifacts,
            };
            if let Err(e) = self.notifier.notify(&outcome).await {
                warn!("Failed to deliver result: {}", e);
            }
        }

        self.ack(delivery).await?;
        info!("Job completed");
        Ok(ProcessOutcome::Completed)
    }

    async fn settle_failure(&self, delivery: &Delivery, reason: &str) -> AppResult<ProcessOutcome> {
        let resolution = match self.billing.fail(delivery.operation_id(), reason).await {
            Ok(resolution) => resolution,
            Err(e) if e.is_ledger_anomaly() => {
                self.ack(delivery).await?;
                return Ok(ProcessOutcome::Stale);
            }
            Err(e) => return Err(e),
        };

        if resolution.applied {
            let outcome = JobOutcome::Failed {
                operation: resolution.operation,
                reason: reason.to_string(),
            };
            if let Err(e) = self.notifier.notify(&outcome).await {
                warn!("Failed to notify requester: {}", e);
            }
        }

        self.ack(delivery).await?;
        info!("Job failed: {}", reason);
        Ok(ProcessOutcome::Failed)
    }

    async fn ack(&self, delivery: &Delivery) -> AppResult<()> {
        if !self
            .queue
            .ack(delivery.job_id(), delivery.lease_token)
            .await?
        {
            warn!("Ack ignored, lease no longer held");
        }
        Ok(())
    }
}

/// Fixed-size set of workers sharing one queue
pub struct WorkerPool<S: LedgerStore + 'static> {
    workers: Vec<Arc<Worker<S>>>,
}

impl<S: LedgerStore + 'static> WorkerPool<S> {
    pub fn new(
        count: usize,
        billing: Arc<BillingService<S>>,
        queue: Arc<dyn JobQueue>,
        provider: Arc<dyn GenerationProvider>,
        notifier: Arc<dyn OutcomeNotifier>,
        settings: WorkerSettings,
    ) -> Self {
        let workers = (0..count.max(1))
            .map(|id| {
                Arc::new(Worker::new(
                    id,
                    billing.clone(),
                    queue.clone(),
                    provider.clone(),
                    notifier.clone(),
                    settings,
                ))
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Run every worker on its own task until `shutdown` fires and all of
    /// them have finished their current job
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting {} workers", self.workers.len());

        let handles: Vec<_> = self
            .workers
            .into_iter()
            .map(|worker| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Worker task panicked: {}", e);
            }
        }

        info!("Worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let queue = QueueConfig {
            lease_secs: 30,
            max_attempts: 5,
            ..QueueConfig::default()
        };
        let settings = WorkerSettings::from_config(&queue, &WorkerConfig::default());

        assert_eq!(settings.lease, Duration::from_secs(30));
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.job_timeout, Duration::from_secs(240));
    }
}
