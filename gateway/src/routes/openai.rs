//! OpenAI-compatible surface: /v1/completions and /v1/models.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use fleet_common::{InferenceRequest, ProtocolFlavor, RequestPayload};

use crate::error::ApiError;
use crate::openai::{
    translate_completion, CompletionRequest, CompletionResponse, CompletionUsage,
    TranslatedCompletion,
};
use crate::scheduler::{JobId, StreamEvent, StreamHandle};
use crate::AppState;

/// Identifier reported as the owner of every fleet model.
const GATEWAY_OWNER: &str = "fleetai";

/// POST /v1/completions - OpenAI-compatible text completion
async fn completions(
    State(state): State<Arc<AppState>>,
    addr: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let translated = translate_completion(request)?;
    let meta = super::submission_meta(ProtocolFlavor::OpenAi, addr.as_ref(), &headers);

    let mut inference = InferenceRequest::new(
        translated.model.clone(),
        RequestPayload::Generate {
            prompt: translated.prompt.clone(),
        },
        Utc::now() + state.config.scheduler.default_timeout(),
        ProtocolFlavor::OpenAi,
    );
    inference.options = translated.options.clone();
    inference.passthrough.suffix = translated.suffix.clone();
    inference.meta = meta;

    if translated.stream {
        let handle = state.scheduler.dispatcher.submit_streaming(inference).await?;
        Ok(sse_response(translated, handle))
    } else {
        let handle = state.scheduler.dispatcher.submit(inference).await?;
        let job_id = handle.id;
        let output = handle
            .result
            .await
            .map_err(|_| ApiError::Internal("scheduler dropped the job".to_string()))?
            .map_err(ApiError::from)?;

        let text = if translated.echo {
            format!("{}{}", translated.prompt, output.text)
        } else {
            output.text
        };
        let response = CompletionResponse::new(
            job_id,
            translated.model,
            text,
            Some(output.info.finish_reason),
        )
        .with_usage(CompletionUsage::from(output.info));
        Ok(Json(response).into_response())
    }
}

/// Stream completion frames as SSE, ending with a `[DONE]` sentinel.
fn sse_response(translated: TranslatedCompletion, handle: StreamHandle) -> Response {
    let TranslatedCompletion {
        model,
        prompt,
        echo,
        include_usage,
        ..
    } = translated;
    let job_id = handle.id;
    let mut events = handle.events;

    let (tx, rx) = mpsc::channel::<Event>(16);
    tokio::spawn(async move {
        let mut first = true;
        while let Some(event) = events.recv().await {
            let frames = match event {
                StreamEvent::Chunk(text) => {
                    let text = if first && echo {
                        format!("{}{}", prompt, text)
                    } else {
                        text
                    };
                    first = false;
                    vec![frame(job_id, &model, text, None, None)]
                }
                StreamEvent::Complete(info) => {
                    let usage = include_usage.then(|| CompletionUsage::from(info));
                    vec![
                        frame(
                            job_id,
                            &model,
                            String::new(),
                            Some(info.finish_reason.as_str().to_string()),
                            usage,
                        ),
                        Event::default().data("[DONE]"),
                    ]
                }
                StreamEvent::Error(err) => {
                    vec![
                        Event::default().data(ApiError::from(err).body().to_string()),
                        Event::default().data("[DONE]"),
                    ]
                }
            };
            for event in frames {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    });

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn frame(
    job_id: JobId,
    model: &str,
    text: String,
    finish_reason: Option<String>,
    usage: Option<CompletionUsage>,
) -> Event {
    let mut response = CompletionResponse::new(job_id, model.to_string(), text, None);
    response.choices[0].finish_reason = finish_reason;
    response.usage = usage;
    match serde_json::to_string(&response) {
        Ok(json) => Event::default().data(json),
        Err(e) => Event::default().data(format!("{{\"error\":\"{}\"}}", e)),
    }
}

/// Model entry in the /v1/models response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelObject {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// Response from /v1/models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelObject>,
}

/// GET /v1/models - union of model inventories across ready workers
async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelsResponse> {
    let data = state
        .scheduler
        .registry
        .model_directory()
        .await
        .into_iter()
        .map(|m| ModelObject {
            id: m.name,
            object: "model".to_string(),
            created: m.modified_at.map(|t| t.timestamp()).unwrap_or(0),
            owned_by: GATEWAY_OWNER.to_string(),
        })
        .collect();

    Json(ModelsResponse {
        object: "list".to_string(),
        data,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/completions", post(completions))
        .route("/v1/models", get(list_models))
        .with_state(state)
}
