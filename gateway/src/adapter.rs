//! Worker adapter: the only component that speaks the worker wire protocol.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use reqwest::Client;
use serde_json::{json, Map, Value};
use thiserror::Error;
use uuid::Uuid;

use fleet_common::{InferenceRequest, RequestPayload, WorkerRecord};

/// Byte stream of newline-delimited records from a worker.
pub type ChunkSource = Pin<Box<dyn Stream<Item = Result<Bytes, AdapterError>> + Send>>;

/// Per-request failure classification for worker I/O.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Connection could not be established or timed out.
    #[error("Worker unreachable: {0}")]
    Unreachable(String),

    /// The worker answered with an error response.
    #[error("Worker returned error: {0}")]
    Worker(String),

    /// The transport failed mid-exchange.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for AdapterError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            AdapterError::Unreachable(err.to_string())
        } else {
            AdapterError::Transport(err.to_string())
        }
    }
}

/// Dispatch interface the scheduler uses to talk to workers.
#[async_trait]
pub trait WorkerAdapter: Send + Sync {
    /// Run a request to completion and return the aggregated final record.
    async fn dispatch(
        &self,
        address: &str,
        request: &InferenceRequest,
    ) -> Result<WorkerRecord, AdapterError>;

    /// Start a streaming request and return the raw record source.
    async fn dispatch_streaming(
        &self,
        address: &str,
        request: &InferenceRequest,
    ) -> Result<ChunkSource, AdapterError>;

    /// Best-effort cancel signal for an in-flight request.
    async fn cancel(&self, address: &str, request_id: Uuid);

    /// Probe worker health.
    async fn health(&self, address: &str) -> Result<(), AdapterError>;
}

/// HTTP implementation of the worker wire protocol.
pub struct HttpWorkerAdapter {
    http_client: Client,
}

impl HttpWorkerAdapter {
    pub fn new() -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(300)) // 5 min for long generations
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    fn base_url(address: &str) -> String {
        let address = address.trim_end_matches('/');
        if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        }
    }

    fn endpoint(payload: &RequestPayload) -> &'static str {
        match payload {
            RequestPayload::Generate { .. } => "/api/generate",
            RequestPayload::Chat { .. } => "/api/chat",
            RequestPayload::Embed { .. } => "/api/embed",
        }
    }

    /// Build the POST body, serializing only present fields.
    fn build_body(request: &InferenceRequest, stream: bool) -> Value {
        let mut body = match serde_json::to_value(&request.passthrough) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };

        body.insert("model".to_string(), json!(request.model));
        match &request.payload {
            RequestPayload::Generate { prompt } => {
                body.insert("prompt".to_string(), json!(prompt));
            }
            RequestPayload::Chat { messages } => {
                body.insert("messages".to_string(), json!(messages));
            }
            RequestPayload::Embed { input } => {
                body.insert("input".to_string(), json!(input));
            }
        }
        body.insert("stream".to_string(), json!(stream));
        if !request.options.is_empty() {
            body.insert("options".to_string(), Value::Object(request.options.clone()));
        }

        Value::Object(body)
    }

    async fn post(
        &self,
        address: &str,
        request: &InferenceRequest,
        stream: bool,
    ) -> Result<reqwest::Response, AdapterError> {
        let url = format!(
            "{}{}",
            Self::base_url(address),
            Self::endpoint(&request.payload)
        );
        tracing::debug!(%url, request_id = %request.id, "dispatching to worker");

        let response = self
            .http_client
            .post(&url)
            .json(&Self::build_body(request, stream))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AdapterError::Worker(format!("HTTP {}: {}", status, body)));
        }

        Ok(response)
    }
}

impl Default for HttpWorkerAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerAdapter for HttpWorkerAdapter {
    async fn dispatch(
        &self,
        address: &str,
        request: &InferenceRequest,
    ) -> Result<WorkerRecord, AdapterError> {
        let response = self.post(address, request, false).await?;
        response
            .json()
            .await
            .map_err(|e| AdapterError::Transport(e.to_string()))
    }

    async fn dispatch_streaming(
        &self,
        address: &str,
        request: &InferenceRequest,
    ) -> Result<ChunkSource, AdapterError> {
        let response = self.post(address, request, true).await?;
        Ok(Box::pin(response.bytes_stream().map_err(AdapterError::from)))
    }

    async fn cancel(&self, address: &str, request_id: Uuid) {
        let url = format!("{}/api/cancel", Self::base_url(address));
        let result = self
            .http_client
            .post(&url)
            .json(&json!({ "request_id": request_id }))
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(%request_id, "cancel signal failed: {}", e);
        }
    }

    async fn health(&self, address: &str) -> Result<(), AdapterError> {
        let url = Self::base_url(address);
        let response = self.http_client.get(&url).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(AdapterError::Worker(format!("HTTP {}", response.status())))
        }
    }
}
