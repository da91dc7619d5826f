//! Dispatcher: matches queued jobs to ready workers, records assignments,
//! supervises execution, and handles completion and failure.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use fleet_common::InferenceRequest;

use crate::adapter::{AdapterError, WorkerAdapter};
use crate::config::SchedulerConfig;
use crate::error::{JobError, SubmitError};
use crate::scheduler::broker::{StreamBroker, StreamOutcome};
use crate::scheduler::job::{
    Job, JobHandle, JobId, JobOutput, JobState, Responder, StreamHandle, StreamSink,
};
use crate::scheduler::queue::JobQueue;
use crate::scheduler::registry::WorkerRegistry;

/// A job assigned to a worker.
struct InFlight {
    worker_id: String,
    address: String,
    state: JobState,
    request: InferenceRequest,
    queued_at: std::time::Instant,
    attempts: u32,
    responder: Responder,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    registry: Arc<WorkerRegistry>,
    queue: Arc<JobQueue>,
    broker: Arc<StreamBroker>,
    adapter: Arc<dyn WorkerAdapter>,
    cfg: SchedulerConfig,
    inflight: Mutex<HashMap<JobId, InFlight>>,
}

/// The matching engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        queue: Arc<JobQueue>,
        broker: Arc<StreamBroker>,
        adapter: Arc<dyn WorkerAdapter>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                queue,
                broker,
                adapter,
                cfg,
                inflight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Submit a non-streaming request. The handle's result resolves with the
    /// aggregated response or an error.
    pub async fn submit(&self, request: InferenceRequest) -> Result<JobHandle, SubmitError> {
        if !self
            .inner
            .registry
            .is_model_available(&request.model, false)
            .await
        {
            return Err(SubmitError::ModelUnavailable(request.model));
        }

        let id = request.id;
        let (tx, rx) = oneshot::channel();
        let job = Job::new(request, Responder::Single(tx));
        self.inner
            .queue
            .enqueue(job)
            .map_err(|_| SubmitError::QueueFull)?;
        self.dispatch_pass().await;
        Ok(JobHandle { id, result: rx })
    }

    /// Submit a streaming request. Returns once the dispatch decision has
    /// been attempted; events arrive on the handle.
    pub async fn submit_streaming(
        &self,
        mut request: InferenceRequest,
    ) -> Result<StreamHandle, SubmitError> {
        request.stream = true;
        if !self
            .inner
            .registry
            .is_model_available(&request.model, true)
            .await
        {
            return Err(SubmitError::ModelUnavailable(request.model));
        }

        let id = request.id;
        let (sink, rx) = StreamSink::channel(32);
        let job = Job::new(request, Responder::Stream(sink));
        self.inner
            .queue
            .enqueue(job)
            .map_err(|_| SubmitError::QueueFull)?;
        self.dispatch_pass().await;
        Ok(StreamHandle { id, events: rx })
    }

    /// Cancel a job at any state. The client-visible future or stream
    /// terminates promptly; an in-flight worker gets a best-effort signal.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        if let Some(job) = self.inner.queue.cancel(job_id) {
            tracing::info!(%job_id, "queued job cancelled");
            job.fail(JobError::Cancelled).await;
            return true;
        }

        let Some(entry) = self.take_entry(job_id).await else {
            return false;
        };
        tracing::info!(%job_id, worker_id = %entry.worker_id, "in-flight job cancelled");
        if let Some(task) = &entry.task {
            task.abort();
        }
        self.inner.broker.detach(job_id);
        self.spawn_worker_cancel(entry.address.clone(), job_id);
        entry.responder.fail(JobError::Cancelled).await;
        true
    }

    /// Fail or retry every in-flight job assigned to a lost worker.
    ///
    /// Jobs that have not yet produced client output are returned to the
    /// head of their priority bucket, up to `max_attempts` total attempts.
    pub async fn notify_worker_lost(&self, worker_id: &str) {
        let job_ids: Vec<JobId> = {
            let table = self.inner.inflight.lock().await;
            table
                .iter()
                .filter(|(_, e)| e.worker_id == worker_id)
                .map(|(id, _)| *id)
                .collect()
        };

        for job_id in job_ids {
            let Some(entry) = self.take_entry(job_id).await else {
                continue;
            };
            if let Some(task) = &entry.task {
                task.abort();
            }
            self.inner.broker.detach(job_id);
            self.retry_or_fail(entry, JobError::WorkerLost(worker_id.to_string()))
                .await;
        }
    }

    /// Run the dispatch loop: wake on enqueue, sweep on an interval.
    pub async fn run(&self) {
        let notify = self.inner.queue.notifier();
        loop {
            tokio::select! {
                _ = notify.notified() => {}
                _ = tokio::time::sleep(self.inner.cfg.sweep_interval()) => {}
            }
            self.expire_overdue().await;
            self.dispatch_pass().await;
        }
    }

    /// Fail every queued and in-flight job whose deadline has passed.
    pub async fn expire_overdue(&self) {
        let now = Utc::now();
        for job in self.inner.queue.remove_expired(now) {
            tracing::warn!(job_id = %job.id(), "queued job expired");
            job.fail(JobError::DeadlineExpired).await;
        }

        let overdue: Vec<JobId> = {
            let table = self.inner.inflight.lock().await;
            table
                .iter()
                .filter(|(_, e)| e.request.deadline <= now)
                .map(|(id, _)| *id)
                .collect()
        };
        for job_id in overdue {
            let Some(entry) = self.take_entry(job_id).await else {
                continue;
            };
            tracing::warn!(%job_id, worker_id = %entry.worker_id, "in-flight job expired");
            if let Some(task) = &entry.task {
                task.abort();
            }
            self.inner.broker.detach(job_id);
            self.spawn_worker_cancel(entry.address.clone(), job_id);
            entry.responder.fail(JobError::DeadlineExpired).await;
        }
    }

    /// Drain the queue while matching workers are available.
    pub async fn dispatch_pass(&self) {
        loop {
            let available = self.inner.registry.dispatchable_models().await;
            let outcome = self.inner.queue.take_matching(Utc::now(), |job| {
                available.accepts(&job.request.model, job.request.stream)
            });

            for job in outcome.expired {
                tracing::warn!(job_id = %job.id(), "job expired before dispatch");
                job.fail(JobError::DeadlineExpired).await;
            }

            let Some(job) = outcome.job else { break };
            if !self.assign(job).await {
                break;
            }
        }
    }

    pub async fn inflight_count(&self) -> usize {
        self.inner.inflight.lock().await.len()
    }

    pub async fn job_state(&self, job_id: JobId) -> Option<JobState> {
        self.inner
            .inflight
            .lock()
            .await
            .get(&job_id)
            .map(|e| e.state)
    }

    /// Pick a worker and record the assignment. Returns false when no
    /// candidate has a free slot; the job goes back to the head of its
    /// bucket with its original enqueue timestamp.
    async fn assign(&self, job: Job) -> bool {
        let candidates = self
            .inner
            .registry
            .candidates(&job.request.model, job.request.stream)
            .await;

        // The slot reservation and the in-flight insert happen under the
        // table lock so the worker counter never disagrees with the table.
        let mut table = self.inner.inflight.lock().await;
        let mut chosen = None;
        for id in candidates {
            if self.inner.registry.try_acquire(&id).await {
                chosen = Some(id);
                break;
            }
        }
        let Some(worker_id) = chosen else {
            drop(table);
            self.inner.queue.requeue_front(job);
            return false;
        };

        let address = self
            .inner
            .registry
            .address_of(&worker_id)
            .await
            .unwrap_or_default();
        let job_id = job.id();
        let Job {
            request,
            queued_at,
            attempts,
            responder,
        } = job;
        let sink = match &responder {
            Responder::Stream(sink) => Some(sink.clone()),
            Responder::Single(_) => None,
        };

        table.insert(
            job_id,
            InFlight {
                worker_id: worker_id.clone(),
                address: address.clone(),
                state: JobState::Assigned,
                request: request.clone(),
                queued_at,
                attempts,
                responder,
                task: None,
            },
        );

        let this = self.clone();
        let task = match sink {
            Some(sink) => tokio::spawn(async move {
                this.run_streaming(job_id, address, request, sink).await;
            }),
            None => tokio::spawn(async move {
                this.run_single(job_id, address, request).await;
            }),
        };
        if let Some(entry) = table.get_mut(&job_id) {
            entry.task = Some(task);
        }
        drop(table);

        tracing::info!(%job_id, worker_id = %worker_id, "job assigned");
        true
    }

    async fn run_single(&self, job_id: JobId, address: String, request: InferenceRequest) {
        self.mark_running(job_id).await;
        let result = self.inner.adapter.dispatch(&address, &request).await;

        let Some(entry) = self.take_entry(job_id).await else {
            return;
        };
        match result {
            Ok(record) => {
                if let Some(message) = record.error.clone() {
                    entry.responder.fail(JobError::WorkerReported(message)).await;
                } else if let Responder::Single(tx) = entry.responder {
                    let _ = tx.send(Ok(JobOutput::from_record(record)));
                }
            }
            Err(err) => self.fail_inflight(entry, err).await,
        }
    }

    async fn run_streaming(
        &self,
        job_id: JobId,
        address: String,
        request: InferenceRequest,
        sink: StreamSink,
    ) {
        match self.inner.adapter.dispatch_streaming(&address, &request).await {
            Ok(source) => {
                self.mark_running(job_id).await;
                let relay = self.inner.broker.attach(job_id, source, sink);
                match relay.await {
                    Ok(outcome) => self.stream_finished(job_id, outcome).await,
                    // The relay only dies by abort, which happens after the
                    // entry is taken; nothing left to clean up.
                    Err(_) => {}
                }
            }
            Err(err) => {
                let Some(entry) = self.take_entry(job_id).await else {
                    return;
                };
                self.fail_inflight(entry, err).await;
            }
        }
    }

    async fn stream_finished(&self, job_id: JobId, outcome: StreamOutcome) {
        match outcome {
            // Terminal events were already delivered through the sink.
            StreamOutcome::Completed(_) | StreamOutcome::Failed(_) | StreamOutcome::Detached => {
                let _ = self.take_entry(job_id).await;
            }
            StreamOutcome::SinkClosed => {
                if let Some(entry) = self.take_entry(job_id).await {
                    tracing::info!(%job_id, "client went away, releasing worker stream");
                    self.spawn_worker_cancel(entry.address.clone(), job_id);
                }
            }
        }
    }

    /// Classify an adapter failure and terminate or retry the job.
    async fn fail_inflight(&self, entry: InFlight, err: AdapterError) {
        match err {
            AdapterError::Unreachable(_) => {
                let worker_id = entry.worker_id.clone();
                self.retry_or_fail(entry, JobError::WorkerLost(worker_id))
                    .await;
            }
            AdapterError::Worker(message) => {
                entry.responder.fail(JobError::WorkerReported(message)).await;
            }
            AdapterError::Transport(message) => {
                entry
                    .responder
                    .fail(JobError::TransportCorrupt(message))
                    .await;
            }
        }
    }

    /// Re-enqueue a lost job at the head of its bucket while it is still
    /// retryable; otherwise the failure is final.
    async fn retry_or_fail(&self, entry: InFlight, err: JobError) {
        let output_started = match &entry.responder {
            Responder::Stream(sink) => sink.output_started(),
            Responder::Single(_) => false,
        };

        if !output_started && entry.attempts < self.inner.cfg.max_attempts {
            tracing::info!(
                job_id = %entry.request.id,
                attempt = entry.attempts + 1,
                max_attempts = self.inner.cfg.max_attempts,
                "retrying job after worker loss"
            );
            self.inner.queue.requeue_front(Job {
                request: entry.request,
                queued_at: entry.queued_at,
                attempts: entry.attempts + 1,
                responder: entry.responder,
            });
        } else {
            tracing::warn!(job_id = %entry.request.id, "job failed: {}", err);
            entry.responder.fail(err).await;
        }
    }

    /// Remove an in-flight entry and release its worker slot together.
    async fn take_entry(&self, job_id: JobId) -> Option<InFlight> {
        let mut table = self.inner.inflight.lock().await;
        let entry = table.remove(&job_id)?;
        self.inner.registry.release(&entry.worker_id).await;
        Some(entry)
    }

    async fn mark_running(&self, job_id: JobId) {
        if let Some(entry) = self.inner.inflight.lock().await.get_mut(&job_id) {
            entry.state = JobState::Running;
        }
    }

    fn spawn_worker_cancel(&self, address: String, job_id: JobId) {
        let this = self.clone();
        let grace = self.inner.cfg.cancel_grace();
        tokio::spawn(async move {
            let _ = tokio::time::timeout(grace, this.inner.adapter.cancel(&address, job_id)).await;
        });
    }
}
