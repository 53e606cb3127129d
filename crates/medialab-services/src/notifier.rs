//! Outcome delivery over Redis pub/sub
//!
//! Artifacts are written under the media directory; the message published on
//! the outcome channel carries their paths, keyed by operation id, so the
//! front-end can deliver the files or the failure reason to the user.

use async_trait::async_trait;
use medialab_core::{
    models::{Artifact, JobOutcome, OperationStatus},
    traits::OutcomeNotifier,
    AppError, AppResult,
};
use redis::{aio::ConnectionManager, Client};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

#[derive(Debug, Serialize)]
struct OutcomeMessage<'a> {
    operation_id: Uuid,
    user_id: i64,
    kind: &'a str,
    status: OperationStatus,
    price: i64,
    files: Vec<String>,
    reason: Option<&'a str>,
}

pub struct RedisOutcomePublisher {
    manager: ConnectionManager,
    channel: String,
    media_dir: PathBuf,
}

impl RedisOutcomePublisher {
    pub async fn new(url: &str, channel: &str, media_dir: impl Into<PathBuf>) -> AppResult<Self> {
        let client = Client::open(url).map_err(|e| {
            error!("Failed to create Redis client: {}", e);
            AppError::QueueConnection(format!("Invalid Redis URL: {}", e))
        })?;

        let manager = ConnectionManager::new(client).await.map_err(|e| {
            error!("Failed to establish Redis connection: {}", e);
            AppError::QueueConnection(format!("Connection failed: {}", e))
        })?;

        Ok(Self::with_manager(manager, channel, media_dir))
    }

    pub fn with_manager(
        manager: ConnectionManager,
        channel: &str,
        media_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            manager,
            channel: channel.to_string(),
            media_dir: media_dir.into(),
        }
    }
}

fn extension_for(content_type: Option<&str>) -> &'static str {
    match content_type.map(|ct| ct.split(';').next().unwrap_or(ct).trim()) {
        Some("image/png") => "png",
        Some("image/jpeg") | Some("image/jpg") => "jpg",
        Some("image/webp") => "webp",
        Some("video/mp4") => "mp4",
        _ => "bin",
    }
}

/// Write each artifact as `{operation_id}_{index}.{ext}` under `dir`
async fn write_artifacts(
    dir: &Path,
    operation_id: Uuid,
    artifacts: &[Artifact],
) -> AppResult<Vec<String>> {
    tokio::fs::create_dir_all(dir).await?;

    let mut files = Vec::with_capacity(artifacts.len());
    for (index, artifact) in artifacts.iter().enumerate() {
        let path = dir.join(format!(
            "{}_{}.{}",
            operation_id,
            index,
            extension_for(artifact.content_type.as_deref())
        ));
        tokio::fs::write(&path, &artifact.bytes).await?;
        files.push(path.to_string_lossy().into_owned());
    }
    Ok(files)
}

fn outcome_message(outcome: &JobOutcome, files: Vec<String>) -> OutcomeMessage<'_> {
    let operation = outcome.operation();
    let reason = match outcome {
        JobOutcome::Failed { reason, .. } => Some(reason.as_str()),
        JobOutcome::Succeeded { .. } => None,
    };

    OutcomeMessage {
        operation_id: operation.id,
        user_id: operation.user_id,
        kind: operation.kind.as_str(),
        status: operation.status,
        price: operation.price,
        files,
        reason,
    }
}

#[async_trait]
impl OutcomeNotifier for RedisOutcomePublisher {
    #[instrument(skip(self, outcome), fields(operation_id = %outcome.operation().id))]
    async fn notify(&self, outcome: &JobOutcome) -> AppResult<()> {
        let files = match outcome {
            JobOutcome::Succeeded {
                operation,
                artifacts,
            } => write_artifacts(&self.media_dir, operation.id, artifacts).await?,
            JobOutcome::Failed { .. } => Vec::new(),
        };

        let payload = serde_json::to_string(&outcome_message(outcome, files))?;
        let mut conn = self.manager.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!("Failed to publish outcome: {}", e);
                AppError::Queue(format!("Publish failed: {}", e))
            })?;

        if receivers == 0 {
            debug!("No subscribers on {}", self.channel);
        }
        info!(success = outcome.is_success(), "Outcome published");
        Ok(())
    }
}
