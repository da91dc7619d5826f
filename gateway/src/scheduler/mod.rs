//! Scheduler core: worker registry, job queue, dispatcher, stream broker.
//!
//! `Scheduler::start` wires the components together and spawns the
//! background loops (dispatch and liveness sweep). There is no process-wide
//! state; everything hangs off the returned instance.

pub mod broker;
pub mod dispatcher;
pub mod job;
pub mod queue;
pub mod registry;

pub use broker::StreamBroker;
pub use dispatcher::Dispatcher;
pub use job::{CompletionInfo, JobHandle, JobId, JobOutput, StreamEvent, StreamHandle};
pub use queue::{JobQueue, QueueDepth};
pub use registry::WorkerRegistry;

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::adapter::WorkerAdapter;
use crate::config::SchedulerConfig;

/// The assembled scheduler.
pub struct Scheduler {
    pub registry: Arc<WorkerRegistry>,
    pub queue: Arc<JobQueue>,
    pub dispatcher: Dispatcher,
    cfg: SchedulerConfig,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build the scheduler without spawning background tasks. Useful for
    /// tests that drive the dispatcher by hand.
    pub fn new(cfg: SchedulerConfig, adapter: Arc<dyn WorkerAdapter>) -> Self {
        let registry = Arc::new(WorkerRegistry::new());
        let queue = Arc::new(JobQueue::new(cfg.queue_depth_limit));
        let broker = Arc::new(StreamBroker::new());
        let dispatcher = Dispatcher::new(
            registry.clone(),
            queue.clone(),
            broker,
            adapter,
            cfg.clone(),
        );
        Self {
            registry,
            queue,
            dispatcher,
            cfg,
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Build the scheduler and spawn the dispatch loop and liveness sweep.
    pub fn start(cfg: SchedulerConfig, adapter: Arc<dyn WorkerAdapter>) -> Self {
        let scheduler = Self::new(cfg, adapter);
        scheduler.spawn_loops();
        scheduler
    }

    fn spawn_loops(&self) {
        let dispatcher = self.dispatcher.clone();
        let dispatch_loop = tokio::spawn(async move {
            dispatcher.run().await;
        });

        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let queue = self.queue.clone();
        let sweep_interval = self.cfg.sweep_interval();
        let liveness_threshold = self.cfg.liveness_threshold();
        let liveness_loop = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                let lost = registry.sweep_lost(liveness_threshold).await;
                for worker_id in &lost {
                    dispatcher.notify_worker_lost(worker_id).await;
                }
                if !lost.is_empty() {
                    // Retried jobs may now match a different worker.
                    queue.notifier().notify_one();
                }
            }
        });

        let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
        tasks.push(dispatch_loop);
        tasks.push(liveness_loop);
    }

    /// Wake the dispatch loop, e.g. after a worker joins or frees capacity.
    pub fn kick(&self) {
        self.queue.notifier().notify_one();
    }

    /// Stop the background loops. In-flight jobs are not interrupted.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().expect("scheduler lock poisoned");
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockWorkerAdapter;
    use chrono::Utc;
    use fleet_common::{
        InferenceRequest, ModelDescriptor, ProtocolFlavor, RequestPayload, WorkerCapabilities,
        WorkerRecord,
    };

    fn caps(models: Vec<&str>) -> WorkerCapabilities {
        WorkerCapabilities {
            models: models.into_iter().map(ModelDescriptor::named).collect(),
            max_concurrency: 2,
            supports_streaming: true,
        }
    }

    #[tokio::test]
    async fn test_scheduler_end_to_end() {
        let adapter = Arc::new(MockWorkerAdapter::new());
        adapter.set_response(WorkerRecord {
            response: Some("done".to_string()),
            done: true,
            eval_count: Some(1),
            ..Default::default()
        });
        let scheduler = Scheduler::start(
            crate::config::SchedulerConfig {
                sweep_interval_ms: 20,
                ..Default::default()
            },
            adapter,
        );

        let token = scheduler
            .registry
            .register("w1", "10.0.0.1:11434", caps(vec!["m1"]))
            .await
            .unwrap();
        scheduler.registry.heartbeat("w1", &token, 0).await.unwrap();

        let request = InferenceRequest::new(
            "m1".to_string(),
            RequestPayload::Generate {
                prompt: "hi".to_string(),
            },
            Utc::now() + chrono::Duration::seconds(10),
            ProtocolFlavor::Native,
        );
        let handle = scheduler.dispatcher.submit(request).await.unwrap();
        let output = handle.result.await.unwrap().unwrap();
        assert_eq!(output.text, "done");

        scheduler.shutdown();
    }

    #[tokio::test]
    async fn test_liveness_sweep_fails_jobs_of_silent_worker() {
        let adapter = Arc::new(MockWorkerAdapter::new());
        adapter.set_hang(true);
        let scheduler = Scheduler::start(
            crate::config::SchedulerConfig {
                sweep_interval_ms: 10,
                liveness_threshold_secs: 1,
                max_attempts: 1,
                ..Default::default()
            },
            adapter,
        );

        let token = scheduler
            .registry
            .register("w1", "10.0.0.1:11434", caps(vec!["m1"]))
            .await
            .unwrap();
        scheduler.registry.heartbeat("w1", &token, 0).await.unwrap();

        let request = InferenceRequest::new(
            "m1".to_string(),
            RequestPayload::Generate {
                prompt: "hi".to_string(),
            },
            Utc::now() + chrono::Duration::seconds(10),
            ProtocolFlavor::Native,
        );
        let handle = scheduler.dispatcher.submit(request).await.unwrap();

        // The worker never heartbeats again; with a zero threshold the next
        // sweep declares it lost and the job fails (max_attempts = 1).
        let result = handle.result.await.unwrap();
        assert!(matches!(
            result.unwrap_err(),
            crate::error::JobError::WorkerLost(_)
        ));
        assert_eq!(scheduler.registry.count().await, 0);
    }
}
