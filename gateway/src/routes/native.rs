//! Native data plane: /api/generate, /api/chat, /api/embed.
//!
//! Request fields pass through to the worker; streaming responses are
//! newline-delimited JSON records in the worker wire shape.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use fleet_common::{
    ChatMessage, EmbedInput, GenerationOptions, InferenceRequest, PassthroughOptions, Priority,
    ProtocolFlavor, RequestPayload, SubmissionMeta,
};

use crate::error::ApiError;
use crate::scheduler::{CompletionInfo, JobHandle, JobOutput, StreamEvent, StreamHandle};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub options: Option<GenerationOptions>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub passthrough: PassthroughOptions,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub options: Option<GenerationOptions>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(flatten)]
    pub passthrough: PassthroughOptions,
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub input: Option<EmbedInput>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub options: Option<GenerationOptions>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn build_request(
    state: &AppState,
    model: String,
    payload: RequestPayload,
    options: Option<GenerationOptions>,
    passthrough: PassthroughOptions,
    priority: Option<Priority>,
    timeout_ms: Option<u64>,
    meta: SubmissionMeta,
) -> InferenceRequest {
    let timeout = timeout_ms
        .map(|ms| chrono::Duration::milliseconds(ms as i64))
        .unwrap_or_else(|| state.config.scheduler.default_timeout());
    let mut request =
        InferenceRequest::new(model, payload, Utc::now() + timeout, ProtocolFlavor::Native);
    request.options = options.unwrap_or_default();
    request.passthrough = passthrough;
    request.priority = priority.unwrap_or_default();
    request.meta = meta;
    request
}

async fn await_output(handle: JobHandle) -> Result<JobOutput, ApiError> {
    handle
        .result
        .await
        .map_err(|_| ApiError::Internal("scheduler dropped the job".to_string()))?
        .map_err(ApiError::from)
}

/// POST /api/generate - prompt completion, streaming by default
async fn generate(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let model = request
        .model
        .ok_or_else(|| ApiError::validation("model is required", "model"))?;
    let prompt = request
        .prompt
        .ok_or_else(|| ApiError::validation("prompt is required", "prompt"))?;
    let stream = request.stream.unwrap_or(true);
    let meta = super::submission_meta(ProtocolFlavor::Native, addr.as_ref(), &headers);

    let inference = build_request(
        &state,
        model.clone(),
        RequestPayload::Generate { prompt },
        request.options,
        request.passthrough,
        request.priority,
        request.timeout_ms,
        meta,
    );

    if stream {
        let handle = state.scheduler.dispatcher.submit_streaming(inference).await?;
        Ok(ndjson_response(model, false, handle))
    } else {
        let handle = state.scheduler.dispatcher.submit(inference).await?;
        let output = await_output(handle).await?;
        Ok(Json(final_value(&model, false, &output.text, &output.info)).into_response())
    }
}

/// POST /api/chat - chat completion, streaming by default
async fn chat(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let model = request
        .model
        .ok_or_else(|| ApiError::validation("model is required", "model"))?;
    let messages = request
        .messages
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ApiError::validation("messages cannot be empty", "messages"))?;
    let stream = request.stream.unwrap_or(true);
    let meta = super::submission_meta(ProtocolFlavor::Native, addr.as_ref(), &headers);

    let inference = build_request(
        &state,
        model.clone(),
        RequestPayload::Chat { messages },
        request.options,
        request.passthrough,
        request.priority,
        request.timeout_ms,
        meta,
    );

    if stream {
        let handle = state.scheduler.dispatcher.submit_streaming(inference).await?;
        Ok(ndjson_response(model, true, handle))
    } else {
        let handle = state.scheduler.dispatcher.submit(inference).await?;
        let output = await_output(handle).await?;
        Ok(Json(final_value(&model, true, &output.text, &output.info)).into_response())
    }
}

/// POST /api/embed - embeddings (non-streaming only)
async fn embed(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<EmbedRequest>,
) -> Result<Response, ApiError> {
    let model = request
        .model
        .ok_or_else(|| ApiError::validation("model is required", "model"))?;
    let input = request
        .input
        .ok_or_else(|| ApiError::validation("input is required", "input"))?;
    if request.stream == Some(true) {
        return Err(ApiError::validation(
            "embeddings cannot be streamed",
            "stream",
        ));
    }
    let meta = super::submission_meta(ProtocolFlavor::Native, addr.as_ref(), &headers);

    let inference = build_request(
        &state,
        model.clone(),
        RequestPayload::Embed { input },
        request.options,
        PassthroughOptions::default(),
        request.priority,
        request.timeout_ms,
        meta,
    );

    let handle = state.scheduler.dispatcher.submit(inference).await?;
    let output = await_output(handle).await?;
    Ok(Json(json!({
        "model": model,
        "embeddings": output.embeddings.unwrap_or_default(),
    }))
    .into_response())
}

fn chunk_value(model: &str, chat: bool, text: &str) -> Value {
    if chat {
        json!({
            "model": model,
            "message": { "role": "assistant", "content": text },
            "done": false
        })
    } else {
        json!({ "model": model, "response": text, "done": false })
    }
}

fn final_value(model: &str, chat: bool, text: &str, info: &CompletionInfo) -> Value {
    let mut value = chunk_value(model, chat, text);
    if let Some(object) = value.as_object_mut() {
        object.insert("done".to_string(), json!(true));
        object.insert("prompt_eval_count".to_string(), json!(info.prompt_tokens));
        object.insert("eval_count".to_string(), json!(info.completion_tokens));
        object.insert(
            "done_reason".to_string(),
            json!(info.finish_reason.as_str()),
        );
        if let Some(duration) = info.total_duration {
            object.insert("total_duration".to_string(), json!(duration));
        }
    }
    value
}

struct NdjsonState {
    events: tokio::sync::mpsc::Receiver<StreamEvent>,
    model: String,
    chat: bool,
    done: bool,
}

/// Stream job events as newline-delimited wire records.
fn ndjson_response(model: String, chat: bool, handle: StreamHandle) -> Response {
    let state = NdjsonState {
        events: handle.events,
        model,
        chat,
        done: false,
    };
    let stream = futures_util::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        let event = st.events.recv().await?;
        let value = match event {
            StreamEvent::Chunk(text) => chunk_value(&st.model, st.chat, &text),
            StreamEvent::Complete(info) => {
                st.done = true;
                final_value(&st.model, st.chat, "", &info)
            }
            StreamEvent::Error(err) => {
                st.done = true;
                ApiError::from(err).body()
            }
        };
        let bytes = Bytes::from(format!("{}\n", value));
        Some((Ok::<_, Infallible>(bytes), st))
    });

    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(stream),
    )
        .into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/generate", post(generate))
        .route("/api/chat", post(chat))
        .route("/api/embed", post(embed))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_common::FinishReason;

    #[test]
    fn test_generate_request_flattens_passthrough() {
        let json = r#"{
            "model": "m1",
            "prompt": "Hi",
            "system": "Be terse.",
            "raw": true,
            "options": {"temperature": 0.5},
            "priority": "high"
        }"#;
        let request: GenerateRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.model.as_deref(), Some("m1"));
        assert_eq!(request.passthrough.system.as_deref(), Some("Be terse."));
        assert_eq!(request.passthrough.raw, Some(true));
        assert_eq!(request.priority, Some(Priority::High));
        assert_eq!(
            request.options.unwrap()["temperature"],
            serde_json::json!(0.5)
        );
    }

    #[test]
    fn test_chunk_value_shapes() {
        let generate = chunk_value("m1", false, "Hi");
        assert_eq!(generate["response"], "Hi");
        assert_eq!(generate["done"], false);

        let chat = chunk_value("m1", true, "Hi");
        assert_eq!(chat["message"]["content"], "Hi");
        assert_eq!(chat["message"]["role"], "assistant");
    }

    #[test]
    fn test_final_value_carries_counts() {
        let info = CompletionInfo {
            finish_reason: FinishReason::Stop,
            prompt_tokens: 2,
            completion_tokens: 5,
            total_duration: Some(123),
        };
        let value = final_value("m1", false, "", &info);
        assert_eq!(value["done"], true);
        assert_eq!(value["prompt_eval_count"], 2);
        assert_eq!(value["eval_count"], 5);
        assert_eq!(value["done_reason"], "stop");
        assert_eq!(value["total_duration"], 123);
    }

    #[test]
    fn test_final_value_omits_absent_duration() {
        let info = CompletionInfo {
            finish_reason: FinishReason::Length,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_duration: None,
        };
        let value = final_value("m1", true, "", &info);
        assert!(value.get("total_duration").is_none());
        assert_eq!(value["done_reason"], "length");
    }
}
