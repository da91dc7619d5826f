use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use uuid::Uuid;

use fleet_common::{InferenceRequest, WorkerRecord};

use crate::adapter::{AdapterError, ChunkSource, WorkerAdapter};

/// Canned worker responses in the wire format.
pub struct MockWorkerResponses;

impl MockWorkerResponses {
    /// A single aggregated (non-streaming) generate response.
    pub fn generate_final(text: &str, prompt_eval: u64, eval: u64) -> serde_json::Value {
        json!({
            "response": text,
            "done": true,
            "prompt_eval_count": prompt_eval,
            "eval_count": eval,
            "done_reason": "stop"
        })
    }

    /// A newline-delimited streaming body: one record per chunk plus a
    /// final record carrying the counts.
    pub fn stream_body(chunks: &[&str], prompt_eval: u64, eval: u64) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str(&json!({ "response": chunk, "done": false }).to_string());
            body.push('\n');
        }
        body.push_str(
            &json!({
                "response": "",
                "done": true,
                "prompt_eval_count": prompt_eval,
                "eval_count": eval,
                "done_reason": "stop"
            })
            .to_string(),
        );
        body.push('\n');
        body
    }

    pub fn error_json(message: &str) -> serde_json::Value {
        json!({ "error": message })
    }
}

#[derive(Default)]
struct MockState {
    response: WorkerRecord,
    stream_lines: Vec<String>,
    hang: bool,
    stream_hang: bool,
    unreachable: bool,
    dispatched: Vec<(String, Uuid)>,
    cancelled: Vec<Uuid>,
}

/// In-memory `WorkerAdapter` with scriptable behavior.
#[derive(Default)]
pub struct MockWorkerAdapter {
    state: Mutex<MockState>,
}

impl MockWorkerAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_response(&self, record: WorkerRecord) {
        self.state.lock().unwrap().response = record;
    }

    pub fn set_stream_lines(&self, lines: Vec<String>) {
        self.state.lock().unwrap().stream_lines = lines;
    }

    /// Make non-streaming dispatches block forever.
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().unwrap().hang = hang;
    }

    /// Make the streaming source stall after the configured lines.
    pub fn set_stream_hang(&self, hang: bool) {
        self.state.lock().unwrap().stream_hang = hang;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// (address, request id) pairs in dispatch order.
    pub fn dispatched(&self) -> Vec<(String, Uuid)> {
        self.state.lock().unwrap().dispatched.clone()
    }

    pub fn cancelled(&self) -> Vec<Uuid> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl WorkerAdapter for MockWorkerAdapter {
    async fn dispatch(
        &self,
        address: &str,
        request: &InferenceRequest,
    ) -> Result<WorkerRecord, AdapterError> {
        let (hang, result) = {
            let mut state = self.state.lock().unwrap();
            state.dispatched.push((address.to_string(), request.id));
            if state.unreachable {
                (false, Err(AdapterError::Unreachable("connection refused".to_string())))
            } else {
                (state.hang, Ok(state.response.clone()))
            }
        };
        if hang {
            return std::future::pending().await;
        }
        result
    }

    async fn dispatch_streaming(
        &self,
        address: &str,
        request: &InferenceRequest,
    ) -> Result<ChunkSource, AdapterError> {
        let (lines, stream_hang) = {
            let mut state = self.state.lock().unwrap();
            state.dispatched.push((address.to_string(), request.id));
            if state.unreachable {
                return Err(AdapterError::Unreachable("connection refused".to_string()));
            }
            (state.stream_lines.clone(), state.stream_hang)
        };

        let records = futures_util::stream::iter(
            lines
                .into_iter()
                .map(|line| Ok::<_, AdapterError>(Bytes::from(format!("{}\n", line)))),
        );
        if stream_hang {
            Ok(Box::pin(records.chain(futures_util::stream::pending())))
        } else {
            Ok(Box::pin(records))
        }
    }

    async fn cancel(&self, _address: &str, request_id: Uuid) {
        self.state.lock().unwrap().cancelled.push(request_id);
    }

    async fn health(&self, _address: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}
