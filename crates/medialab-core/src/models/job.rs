//! Queue payloads, delivery metadata and provider results

use super::{Operation, OperationKind};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::config::QueueConfig;

/// Queue payload, correlated 1:1 with a `Reserved` operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_id: Uuid,
    pub operation_id: Uuid,
    pub user_id: i64,
    pub kind: OperationKind,
    /// Provider-call parameters, opaque to the queue
    pub params: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

impl JobDescriptor {
    pub fn new(operation: &Operation, params: serde_json::Value) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            operation_id: operation.id,
            user_id: operation.user_id,
            kind: operation.kind,
            params,
            enqueued_at: Utc::now(),
        }
    }
}

/// One leased delivery of a job
#[derive(Debug, Clone)]
pub struct Delivery {
    pub descriptor: JobDescriptor,
    /// 1 on first delivery, incremented by the queue on each redelivery
    pub attempt: u32,
    /// Proof of the current lease for ack, nack and extend
    pub lease_token: Uuid,
    pub leased_until: DateTime<Utc>,
}

impl Delivery {
    pub fn job_id(&self) -> Uuid {
        self.descriptor.job_id
    }

    pub fn operation_id(&self) -> Uuid {
        self.descriptor.operation_id
    }
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before delivery `attempt + 1`: `base * 2^(attempt - 1)`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for RetryPolicy {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Result of a nack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Rescheduled for another delivery after `delay`
    Requeued { delay: Duration },
    /// No attempts left; the job stays leased for the caller to resolve and ack
    Exhausted,
    /// The lease token no longer matches; another consumer owns the job
    LeaseLost,
}

/// Snapshot of queue sizes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub ready: u64,
    pub delayed: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.ready + self.delayed + self.in_flight
    }
}

/// A finished provider asset ready to download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResult {
    pub task_id: String,
    pub url: String,
    pub content_type: Option<String>,
}

/// Provider task state
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderStatus {
    Pending,
    Completed(Vec<ProviderResult>),
}

/// Downloaded output delivered to the requester
#[derive(Debug, Clone)]
pub struct Artifact {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

/// Final job outcome reported to the requester
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Succeeded {
        operation: Operation,
        artifacts: Vec<Artifact>,
    },
    Failed {
        operation: Operation,
        reason: String,
    },
}

impl JobOutcome {
    pub fn operation(&self) -> &Operation {
        match self {
            JobOutcome::Succeeded { operation, .. } | JobOutcome::Failed { operation, .. } => {
                operation
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Succeeded { .. })
    }
}
