//! Worker capability and model inventory types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A model advertised by a worker.
///
/// Two descriptors with the same name are the same model for availability
/// purposes; the newest `modified_at` wins for externally reported metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model name (e.g., "llama3.2:3b").
    pub name: String,
    /// When the model was last modified on the worker.
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    /// Model size in bytes (if known).
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Model family (e.g., "llama").
    #[serde(default)]
    pub family: Option<String>,
}

impl ModelDescriptor {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            modified_at: None,
            size_bytes: None,
            family: None,
        }
    }
}

/// Capabilities a worker declares at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    /// Model inventory.
    pub models: Vec<ModelDescriptor>,
    /// Maximum concurrent jobs the worker accepts.
    pub max_concurrency: u32,
    /// Whether the worker can stream incremental chunks.
    #[serde(default = "default_supports_streaming")]
    pub supports_streaming: bool,
}

fn default_supports_streaming() -> bool {
    true
}

impl WorkerCapabilities {
    pub fn has_model(&self, name: &str) -> bool {
        self.models.iter().any(|m| m.name == name)
    }
}

/// Liveness state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerLiveness {
    /// Registered, awaiting first heartbeat.
    Joining,
    /// Accepting new assignments.
    Ready,
    /// Finishing in-flight jobs, accepting no new assignments.
    Draining,
    /// Heartbeat overdue beyond the liveness threshold.
    Lost,
}

impl WorkerLiveness {
    /// Whether new assignments are permitted in this state.
    pub fn is_assignable(&self) -> bool {
        matches!(self, WorkerLiveness::Ready)
    }
}

/// Point-in-time view of a worker, for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: String,
    pub address: String,
    pub liveness: WorkerLiveness,
    pub models: Vec<String>,
    pub max_concurrency: u32,
    pub supports_streaming: bool,
    pub in_flight: u32,
    /// In-flight count as last reported by the worker itself.
    pub reported_in_flight: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}
