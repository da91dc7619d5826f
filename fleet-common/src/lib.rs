//! FleetAI Common Types
//!
//! Shared types used by the gateway and by worker implementations:
//! the worker control-plane protocol, the inference request model, and
//! the data-plane wire records.

pub mod model;
pub mod protocol;
pub mod request;
pub mod wire;

pub use model::{ModelDescriptor, WorkerCapabilities, WorkerLiveness, WorkerSnapshot};
pub use protocol::{HeartbeatRequest, RegisterAck, RegisterRequest};
pub use request::{
    ChatMessage, EmbedInput, GenerationOptions, InferenceRequest, PassthroughOptions, Priority,
    ProtocolFlavor, RequestPayload, SubmissionMeta,
};
pub use wire::{FinishReason, WorkerRecord};
