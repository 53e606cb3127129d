//! HTTP adapter for queue-style generation providers
//!
//! Submits a prediction, polls its result endpoint and downloads the outputs.
//! The adapter only maps transport failures and status codes onto
//! `ProviderRetryable` / `ProviderTerminal`; retry policy belongs to the worker.

use async_trait::async_trait;
use medialab_core::{
    models::{Artifact, JobDescriptor, ProviderResult, ProviderStatus},
    traits::GenerationProvider,
    AppError, AppResult,
};
use reqwest::{header::CONTENT_TYPE, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Serialize)]
struct PredictionRequest<'a> {
    kind: &'a str,
    operation_id: String,
    params: &'a serde_json::Value,
}

/// Response envelope: `{"code": 200, "data": {...}}`
#[derive(Debug, Deserialize)]
struct PredictionEnvelope {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    message: Option<String>,
    data: Option<Prediction>,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    outputs: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

pub struct HttpGenerationProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpGenerationProvider {
    /// Build the adapter; `timeout` bounds every single HTTP request
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    async fn read_envelope(&self, response: reqwest::Response) -> AppResult<Prediction> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let envelope: PredictionEnvelope = response.json().await.map_err(classify_transport)?;
        unwrap_envelope(envelope)
    }
}

/// 429 and 5xx may succeed later; any other error status will not
fn classify_status(status: StatusCode, body: &str) -> AppError {
    let detail: String = body.chars().take(200).collect();
    let message = format!("provider returned {}: {}", status, detail);
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AppError::ProviderRetryable(message)
    } else {
        AppError::ProviderTerminal(message)
    }
}

fn classify_transport(err: reqwest::Error) -> AppError {
    if err.is_decode() {
        return AppError::ProviderTerminal(format!("malformed provider response: {}", err));
    }
    if let Some(status) = err.status() {
        return classify_status(status, "");
    }
    // timeouts, refused connections and dropped bodies
    AppError::ProviderRetryable(format!("provider request failed: {}", err))
}

fn unwrap_envelope(envelope: PredictionEnvelope) -> AppResult<Prediction> {
    match (envelope.code, envelope.data) {
        (Some(code), _) if code != 200 => {
            let message = envelope.message.unwrap_or_default();
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY);
            Err(classify_status(status, &message))
        }
        (_, Some(data)) => Ok(data),
        (_, None) => Err(AppError::ProviderTerminal(
            "provider response has no data".to_string(),
        )),
    }
}

/// Guess the media type from the output URL's file extension
fn content_type_for_url(url: &str) -> Option<String> {
    let path = url.split(|c: char| c == '?' || c == '#').next().unwrap_or(url);
    let file = path.rsplit('/').next().unwrap_or(path);
    let (_, ext) = file.rsplit_once('.')?;
    let content_type = match ext.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        _ => return None,
    };
    Some(content_type.to_string())
}

/// Prefer a specific `Content-Type` header over the URL guess
fn resolve_content_type(header: Option<&str>, fallback: Option<&str>) -> Option<String> {
    header
        .map(|h| h.split(';').next().unwrap_or(h).trim())
        .filter(|h| !h.is_empty() && *h != "application/octet-stream")
        .or(fallback)
        .map(str::to_string)
}

fn to_status(prediction: Prediction) -> AppResult<ProviderStatus> {
    match prediction.status.as_str() {
        "created" | "queued" | "processing" | "pending" => Ok(ProviderStatus::Pending),
        "completed" => Ok(ProviderStatus::Completed(
            prediction
                .outputs
                .into_iter()
                .map(|url| ProviderResult {
                    task_id: prediction.id.clone(),
                    content_type: content_type_for_url(&url),
                    url,
                })
                .collect(),
        )),
        "failed" => Err(AppError::ProviderTerminal(
            prediction
                .error
                .unwrap_or_else(|| "generation failed".to_string()),
        )),
        other => Err(AppError::ProviderTerminal(format!(
            "unknown prediction status '{}'",
            other
        ))),
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    #[instrument(skip(self, job), fields(job_id = %job.job_id, kind = %job.kind))]
    async fn submit(&self, job: &JobDescriptor) -> AppResult<String> {
        let request = PredictionRequest {
            kind: job.kind.as_str(),
            operation_id: job.operation_id.to_string(),
            params: &job.params,
        };

        let response = self
            .client
            .post(format!("{}/predictions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let prediction = self.read_envelope(response).await?;
        debug!("Prediction {} created ({})", prediction.id, prediction.status);
        Ok(prediction.id)
    }

    #[instrument(skip(self))]
    async fn poll(&self, task_id: &str) -> AppResult<ProviderStatus> {
        let response = self
            .client
            .get(format!("{}/predictions/{}/result", self.base_url, task_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = to_status(self.read_envelope(response).await?);
        if let Err(e) = &status {
            warn!("Prediction {} failed: {}", task_id, e);
        }
        status
    }

    #[instrument(skip(self, result), fields(task_id = %result.task_id))]
    async fn download(&self, result: &ProviderResult) -> AppResult<Artifact> {
        let response = self
            .client
            .get(&result.url)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, ""));
        }

        let content_type = resolve_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
            result.content_type.as_deref(),
        );

        let bytes = response.bytes().await.map_err(classify_transport)?;
        debug!("Downloaded {} bytes ({:?})", bytes.len(), content_type);
        Ok(Artifact {
            content_type,
            bytes,
        })
    }
}
