//! Jobs: requests augmented with scheduler state, plus the client-side
//! handles their results are delivered through.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use fleet_common::{FinishReason, InferenceRequest, Priority, WorkerRecord};

use crate::error::JobError;

pub type JobId = Uuid;

/// Scheduler-visible job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Assigned,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Terminal metadata reported by the worker on completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompletionInfo {
    pub finish_reason: FinishReason,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_duration: Option<u64>,
}

impl CompletionInfo {
    /// Derive terminal metadata from a final worker record.
    ///
    /// An explicit termination reason is propagated; absent one, a zero
    /// completion token count means the generation was truncated.
    pub fn from_record(record: &WorkerRecord) -> Self {
        let completion_tokens = record.eval_count.unwrap_or(0);
        let finish_reason = match record.done_reason.as_deref() {
            Some("length") => FinishReason::Length,
            Some(_) => FinishReason::Stop,
            None if completion_tokens == 0 => FinishReason::Length,
            None => FinishReason::Stop,
        };
        Self {
            finish_reason,
            prompt_tokens: record.prompt_eval_count.unwrap_or(0),
            completion_tokens,
            total_duration: record.total_duration,
        }
    }
}

/// Aggregated result of a non-streaming job.
#[derive(Debug, Clone)]
pub struct JobOutput {
    pub text: String,
    pub embeddings: Option<Vec<Vec<f32>>>,
    pub info: CompletionInfo,
}

impl JobOutput {
    pub fn from_record(record: WorkerRecord) -> Self {
        let info = CompletionInfo::from_record(&record);
        Self {
            text: record.delta_text().unwrap_or_default().to_string(),
            embeddings: record.embeddings,
            info,
        }
    }
}

/// Tagged events delivered to a streaming client.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// One text delta, in worker-emission order.
    Chunk(String),
    /// Exactly one terminal event follows the chunks...
    Complete(CompletionInfo),
    /// ...or the job failed.
    Error(JobError),
}

/// Client end of a streaming job.
///
/// All sends go through one gate so chunk and terminal deliveries are
/// totally ordered, and the terminal event is delivered at most once.
#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
    gate: Arc<Mutex<()>>,
    terminated: Arc<AtomicBool>,
    output_started: Arc<AtomicBool>,
}

impl StreamSink {
    pub fn channel(capacity: usize) -> (StreamSink, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            StreamSink {
                tx,
                gate: Arc::new(Mutex::new(())),
                terminated: Arc::new(AtomicBool::new(false)),
                output_started: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    /// Forward one chunk. Returns false if the stream already terminated
    /// or the client went away.
    pub async fn chunk(&self, text: String) -> bool {
        let _gate = self.gate.lock().await;
        if self.terminated.load(Ordering::SeqCst) {
            return false;
        }
        if self.tx.send(StreamEvent::Chunk(text)).await.is_err() {
            return false;
        }
        self.output_started.store(true, Ordering::SeqCst);
        true
    }

    /// Deliver the completion event; a no-op if a terminal was already sent.
    pub async fn complete(&self, info: CompletionInfo) -> bool {
        self.terminal(StreamEvent::Complete(info)).await
    }

    /// Deliver the error event; a no-op if a terminal was already sent.
    pub async fn error(&self, err: JobError) -> bool {
        self.terminal(StreamEvent::Error(err)).await
    }

    async fn terminal(&self, event: StreamEvent) -> bool {
        let _gate = self.gate.lock().await;
        if self
            .terminated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.tx.send(event).await.is_ok()
    }

    /// Whether any chunk has been delivered to the client.
    pub fn output_started(&self) -> bool {
        self.output_started.load(Ordering::SeqCst)
    }
}

/// Where a job's result is delivered.
pub enum Responder {
    Single(oneshot::Sender<Result<JobOutput, JobError>>),
    Stream(StreamSink),
}

impl Responder {
    /// Terminate the client-visible future or stream with an error.
    pub async fn fail(self, err: JobError) {
        match self {
            Responder::Single(tx) => {
                let _ = tx.send(Err(err));
            }
            Responder::Stream(sink) => {
                sink.error(err).await;
            }
        }
    }
}

/// A request plus its scheduler state while queued.
pub struct Job {
    pub request: InferenceRequest,
    pub queued_at: Instant,
    /// Dispatch attempts including the upcoming one; starts at 1.
    pub attempts: u32,
    pub responder: Responder,
}

impl Job {
    pub fn new(request: InferenceRequest, responder: Responder) -> Self {
        Self {
            request,
            queued_at: Instant::now(),
            attempts: 1,
            responder,
        }
    }

    pub fn id(&self) -> JobId {
        self.request.id
    }

    pub fn priority(&self) -> Priority {
        self.request.priority
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.request.deadline <= now
    }

    pub async fn fail(self, err: JobError) {
        self.responder.fail(err).await;
    }
}

/// Handle to a non-streaming job.
pub struct JobHandle {
    pub id: JobId,
    pub result: oneshot::Receiver<Result<JobOutput, JobError>>,
}

/// Handle to a streaming job; events end with exactly one terminal.
pub struct StreamHandle {
    pub id: JobId,
    pub events: mpsc::Receiver<StreamEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn final_record(eval_count: u64, done_reason: Option<&str>) -> WorkerRecord {
        WorkerRecord {
            response: Some("".to_string()),
            done: true,
            prompt_eval_count: Some(3),
            eval_count: Some(eval_count),
            done_reason: done_reason.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_finish_reason_explicit_wins() {
        let info = CompletionInfo::from_record(&final_record(0, Some("stop")));
        assert_eq!(info.finish_reason, FinishReason::Stop);

        let info = CompletionInfo::from_record(&final_record(9, Some("length")));
        assert_eq!(info.finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_finish_reason_zero_tokens_is_length() {
        let info = CompletionInfo::from_record(&final_record(0, None));
        assert_eq!(info.finish_reason, FinishReason::Length);
    }

    #[test]
    fn test_finish_reason_defaults_to_stop() {
        let info = CompletionInfo::from_record(&final_record(5, None));
        assert_eq!(info.finish_reason, FinishReason::Stop);
        assert_eq!(info.prompt_tokens, 3);
        assert_eq!(info.completion_tokens, 5);
    }

    #[tokio::test]
    async fn test_sink_no_chunks_after_terminal() {
        let (sink, mut rx) = StreamSink::channel(8);

        assert!(sink.chunk("a".to_string()).await);
        assert!(
            sink.complete(CompletionInfo {
                finish_reason: FinishReason::Stop,
                prompt_tokens: 1,
                completion_tokens: 1,
                total_duration: None,
            })
            .await
        );
        assert!(!sink.chunk("b".to_string()).await);

        assert_eq!(rx.recv().await, Some(StreamEvent::Chunk("a".to_string())));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Complete(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sink_single_terminal() {
        let (sink, mut rx) = StreamSink::channel(8);

        assert!(sink.error(JobError::Cancelled).await);
        assert!(!sink.error(JobError::DeadlineExpired).await);

        assert_eq!(
            rx.recv().await,
            Some(StreamEvent::Error(JobError::Cancelled))
        );
        drop(sink);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_sink_tracks_output_started() {
        let (sink, _rx) = StreamSink::channel(8);
        assert!(!sink.output_started());
        sink.chunk("x".to_string()).await;
        assert!(sink.output_started());
    }

    #[tokio::test]
    async fn test_job_fail_resolves_single_responder() {
        let (tx, rx) = oneshot::channel();
        let request = InferenceRequest::new(
            "m".to_string(),
            fleet_common::RequestPayload::Generate {
                prompt: "hi".to_string(),
            },
            Utc::now() + chrono::Duration::seconds(5),
            fleet_common::ProtocolFlavor::Native,
        );
        let job = Job::new(request, Responder::Single(tx));
        job.fail(JobError::DeadlineExpired).await;

        let result = rx.await.unwrap();
        assert_eq!(result.unwrap_err(), JobError::DeadlineExpired);
    }

    #[test]
    fn test_job_expiry() {
        let (tx, _rx) = oneshot::channel();
        let request = InferenceRequest::new(
            "m".to_string(),
            fleet_common::RequestPayload::Generate {
                prompt: "hi".to_string(),
            },
            Utc::now() - chrono::Duration::seconds(1),
            fleet_common::ProtocolFlavor::Native,
        );
        let job = Job::new(request, Responder::Single(tx));
        assert!(job.is_expired(Utc::now()));
    }
}
