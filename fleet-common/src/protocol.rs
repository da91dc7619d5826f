//! Worker control-plane messages.
//!
//! Workers register with the gateway over HTTP and keep their registration
//! alive with periodic heartbeats:
//!
//! 1. Worker sends `RegisterRequest` with its id, address, and capabilities
//! 2. Gateway responds with `RegisterAck` carrying a session token
//! 3. Worker sends `HeartbeatRequest` (with the token) on an interval
//! 4. A worker whose heartbeats go silent beyond the liveness threshold is
//!    declared lost and reaped
//!
//! Re-registering under the same id replaces the capabilities and issues a
//! fresh token; heartbeats carrying an old token are rejected as stale.

use serde::{Deserialize, Serialize};

use crate::model::WorkerCapabilities;

/// Registration sent by a worker when joining the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Stable worker identifier.
    pub worker_id: String,
    /// Network address the worker serves inference on (e.g., "10.0.0.5:11434").
    pub address: String,
    /// Declared capabilities, including the model inventory.
    pub capabilities: WorkerCapabilities,
}

/// Acknowledgment of a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterAck {
    pub worker_id: String,
    /// Session token to present on subsequent heartbeats.
    pub token: String,
}

/// Periodic heartbeat from a registered worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Session token issued at registration.
    pub token: String,
    /// Worker-observed in-flight job count.
    #[serde(default)]
    pub in_flight: u32,
}
