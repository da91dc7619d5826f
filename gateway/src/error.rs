//! Error types for the gateway.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Errors from the worker registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Stale session token for worker {0}")]
    StaleSession(String),

    #[error("Worker {id} is already registered at {existing}")]
    AddressMismatch { id: String, existing: String },
}

/// Errors produced before a job is accepted into the queue.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("No ready worker has model '{0}'")]
    ModelUnavailable(String),

    #[error("Queue is full")]
    QueueFull,
}

/// Asynchronous job failures, surfaced through the job's result or stream.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum JobError {
    #[error("Deadline expired")]
    DeadlineExpired,

    #[error("Worker {0} was lost while holding the job")]
    WorkerLost(String),

    #[error("Worker stream corrupt: {0}")]
    TransportCorrupt(String),

    #[error("Worker reported error: {0}")]
    WorkerReported(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Client-facing error, rendered as `{ "error": { message, type, code } }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation { message: String, param: String },

    #[error("No ready worker has model '{0}'")]
    ModelUnavailable(String),

    #[error("Queue is full, gateway is overloaded")]
    QueueFull,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn validation(message: impl Into<String>, param: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            param: param.into(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation { .. } => StatusCode::BAD_REQUEST,
            ApiError::ModelUnavailable(_) => StatusCode::NOT_FOUND,
            ApiError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Job(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Registry(e) => match e {
                RegistryError::UnknownWorker(_) => StatusCode::NOT_FOUND,
                RegistryError::StaleSession(_) | RegistryError::AddressMismatch { .. } => {
                    StatusCode::CONFLICT
                }
            },
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::Validation { .. }
            | ApiError::ModelUnavailable(_)
            | ApiError::Registry(_) => "invalid_request_error",
            _ => "server_error",
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation { .. } => "invalid_value",
            ApiError::ModelUnavailable(_) => "model_not_found",
            ApiError::QueueFull => "queue_full",
            ApiError::Job(_) | ApiError::Internal(_) => "internal_error",
            ApiError::Registry(e) => match e {
                RegistryError::UnknownWorker(_) => "unknown_worker",
                RegistryError::StaleSession(_) => "stale_session",
                RegistryError::AddressMismatch { .. } => "address_mismatch",
            },
        }
    }

    /// The error body, also used for mid-stream error frames.
    pub fn body(&self) -> serde_json::Value {
        let mut error = json!({
            "message": self.to_string(),
            "type": self.error_type(),
            "code": self.code(),
        });
        if let ApiError::Validation { param, .. } = self {
            error["param"] = json!(param);
        }
        json!({ "error": error })
    }
}

impl From<SubmitError> for ApiError {
    fn from(err: SubmitError) -> Self {
        match err {
            SubmitError::ModelUnavailable(model) => ApiError::ModelUnavailable(model),
            SubmitError::QueueFull => ApiError::QueueFull,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_carries_param() {
        let err = ApiError::validation("prompt must be a string", "prompt");
        let body = err.body();
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["param"], "prompt");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_model_unavailable_is_404() {
        let err = ApiError::ModelUnavailable("unknown".to_string());
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.body()["error"]["code"], "model_not_found");
    }

    #[test]
    fn test_job_errors_are_server_errors() {
        let err = ApiError::from(JobError::WorkerLost("w1".to_string()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = err.body();
        assert_eq!(body["error"]["type"], "server_error");
        assert_eq!(body["error"]["code"], "internal_error");
        assert!(body["error"]["param"].is_null());
    }

    #[test]
    fn test_queue_full_is_503() {
        let err: ApiError = SubmitError::QueueFull.into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_registry_error_codes() {
        let err = ApiError::from(RegistryError::StaleSession("w1".to_string()));
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert_eq!(err.body()["error"]["code"], "stale_session");

        let err = ApiError::from(RegistryError::UnknownWorker("w2".to_string()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }
}
