//! The gateway's internal inference request model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling priority of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Which protocol flavor submitted the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFlavor {
    Native,
    OpenAi,
}

/// One message in a chat conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    /// Base64-encoded images attached to this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

/// Embedding input: a single text or a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbedInput {
    Single(String),
    Batch(Vec<String>),
}

/// The request body, exactly one shape per request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestPayload {
    Generate { prompt: String },
    Chat { messages: Vec<ChatMessage> },
    Embed { input: EmbedInput },
}

impl RequestPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            RequestPayload::Generate { .. } => "generate",
            RequestPayload::Chat { .. } => "chat",
            RequestPayload::Embed { .. } => "embed",
        }
    }
}

/// Generation options forwarded to the worker as an opaque bag.
pub type GenerationOptions = serde_json::Map<String, serde_json::Value>;

/// Optional worker fields carried through verbatim.
///
/// Each field is enumerated and typed; the adapter serializes only the
/// fields that are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassthroughOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Vec<i64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub think: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncate: Option<bool>,
}

impl PassthroughOptions {
    pub fn is_empty(&self) -> bool {
        *self == PassthroughOptions::default()
    }
}

/// Submission metadata recorded with every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionMeta {
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub protocol: ProtocolFlavor,
}

impl SubmissionMeta {
    pub fn new(protocol: ProtocolFlavor) -> Self {
        Self {
            client_ip: None,
            user_agent: None,
            submitted_at: Utc::now(),
            protocol,
        }
    }
}

/// A validated inference request, ready for scheduling.
#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Gateway-assigned request id.
    pub id: Uuid,
    /// Required model name.
    pub model: String,
    pub payload: RequestPayload,
    pub passthrough: PassthroughOptions,
    pub options: GenerationOptions,
    pub priority: Priority,
    /// Whether the client wants incremental chunks.
    pub stream: bool,
    /// Absolute wall-clock time after which the job is expired.
    pub deadline: DateTime<Utc>,
    pub meta: SubmissionMeta,
}

impl InferenceRequest {
    pub fn new(
        model: String,
        payload: RequestPayload,
        deadline: DateTime<Utc>,
        protocol: ProtocolFlavor,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            model,
            payload,
            passthrough: PassthroughOptions::default(),
            options: GenerationOptions::new(),
            priority: Priority::default(),
            stream: false,
            deadline,
            meta: SubmissionMeta::new(protocol),
        }
    }
}
