//! Stream broker: per-job conduit between a worker's chunk stream and the
//! client's event sink.
//!
//! The worker stream is newline-delimited JSON records; partial records are
//! buffered until a delimiter arrives. Records that fail to parse are logged
//! and skipped. Chunks are forwarded in arrival order and exactly one
//! terminal event is delivered per job.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use fleet_common::WorkerRecord;

use crate::adapter::ChunkSource;
use crate::error::JobError;
use crate::scheduler::job::{CompletionInfo, JobId, StreamSink};

/// How a stream relay ended.
#[derive(Debug)]
pub enum StreamOutcome {
    /// Worker reported completion; the sink received `Complete`.
    Completed(CompletionInfo),
    /// Worker-side failure; the sink received `Error`.
    Failed(JobError),
    /// `detach` severed the binding; nothing was sent.
    Detached,
    /// The client went away; nothing more can be delivered.
    SinkClosed,
}

/// Registry of active stream relays.
pub struct StreamBroker {
    active: Arc<Mutex<HashMap<JobId, oneshot::Sender<()>>>>,
}

impl StreamBroker {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Bind a worker chunk source to a client sink and start forwarding.
    ///
    /// The returned handle resolves when the stream terminates; the caller
    /// owns slot release and any scheduler-side cleanup.
    pub fn attach(
        &self,
        job_id: JobId,
        source: ChunkSource,
        sink: StreamSink,
    ) -> JoinHandle<StreamOutcome> {
        let (detach_tx, detach_rx) = oneshot::channel();
        self.active
            .lock()
            .expect("broker lock poisoned")
            .insert(job_id, detach_tx);

        let active = self.active.clone();
        tokio::spawn(async move {
            let outcome = relay(job_id, source, &sink, detach_rx).await;
            active.lock().expect("broker lock poisoned").remove(&job_id);
            tracing::debug!(%job_id, ?outcome, "stream relay finished");
            outcome
        })
    }

    /// Sever a binding. Outstanding chunks are discarded; the relay stops
    /// without delivering a terminal event.
    pub fn detach(&self, job_id: JobId) -> bool {
        let sender = self
            .active
            .lock()
            .expect("broker lock poisoned")
            .remove(&job_id);
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("broker lock poisoned").len()
    }
}

impl Default for StreamBroker {
    fn default() -> Self {
        Self::new()
    }
}

enum LineStep {
    Continue,
    Terminal(StreamOutcome),
}

async fn relay(
    job_id: JobId,
    mut source: ChunkSource,
    sink: &StreamSink,
    mut detach_rx: oneshot::Receiver<()>,
) -> StreamOutcome {
    let mut buf = BytesMut::new();

    loop {
        tokio::select! {
            biased;

            _ = &mut detach_rx => {
                return StreamOutcome::Detached;
            }

            item = source.next() => match item {
                Some(Ok(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line = buf.split_to(pos + 1);
                        match forward_line(job_id, &line[..pos], sink).await {
                            LineStep::Continue => {}
                            LineStep::Terminal(outcome) => return outcome,
                        }
                    }
                }
                Some(Err(e)) => {
                    let err = JobError::TransportCorrupt(e.to_string());
                    sink.error(err.clone()).await;
                    return StreamOutcome::Failed(err);
                }
                None => {
                    let reason = if buf.iter().any(|b| !b.is_ascii_whitespace()) {
                        "stream closed mid-record"
                    } else {
                        "stream closed before completion"
                    };
                    let err = JobError::TransportCorrupt(reason.to_string());
                    sink.error(err.clone()).await;
                    return StreamOutcome::Failed(err);
                }
            }
        }
    }
}

async fn forward_line(job_id: JobId, line: &[u8], sink: &StreamSink) -> LineStep {
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        return LineStep::Continue;
    }

    let mut record: WorkerRecord = match serde_json::from_slice(line) {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(%job_id, "skipping unparseable worker record: {}", e);
            return LineStep::Continue;
        }
    };

    if let Some(message) = record.error.take() {
        let err = JobError::WorkerReported(message);
        sink.error(err.clone()).await;
        return LineStep::Terminal(StreamOutcome::Failed(err));
    }

    if let Some(text) = record.delta_text() {
        if !text.is_empty() && !sink.chunk(text.to_string()).await {
            return LineStep::Terminal(StreamOutcome::SinkClosed);
        }
    }

    if record.done {
        let info = CompletionInfo::from_record(&record);
        sink.complete(info).await;
        return LineStep::Terminal(StreamOutcome::Completed(info));
    }

    LineStep::Continue
}
