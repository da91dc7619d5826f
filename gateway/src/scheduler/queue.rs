//! Priority-ordered holding area for jobs awaiting dispatch.
//!
//! One FIFO bucket per priority level; `take_matching` scans from the
//! highest non-empty priority downward. None of the operations suspend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

use fleet_common::Priority;

use super::job::{Job, JobId};

/// Queue depths by priority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    pub total: usize,
}

/// Result of a `take_matching` pass.
pub struct TakeOutcome {
    /// Highest-priority, oldest job accepted by the predicate.
    pub job: Option<Job>,
    /// Jobs found past their deadline while scanning; never dispatched.
    pub expired: Vec<Job>,
}

#[derive(Default)]
struct Buckets {
    high: VecDeque<Job>,
    medium: VecDeque<Job>,
    low: VecDeque<Job>,
}

impl Buckets {
    fn bucket_mut(&mut self, priority: Priority) -> &mut VecDeque<Job> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Medium => &mut self.medium,
            Priority::Low => &mut self.low,
        }
    }

    fn total(&self) -> usize {
        self.high.len() + self.medium.len() + self.low.len()
    }
}

/// Buffer of queued jobs, ordered by priority then enqueue time.
pub struct JobQueue {
    buckets: Mutex<Buckets>,
    depth_limit: usize,
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(depth_limit: usize) -> Self {
        Self {
            buckets: Mutex::new(Buckets::default()),
            depth_limit,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Notifier signalled whenever a job is added.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Insert a job at the back of its priority bucket.
    ///
    /// Returns the job back when the depth limit is exceeded.
    pub fn enqueue(&self, job: Job) -> Result<(), Job> {
        {
            let mut buckets = self.buckets.lock().expect("queue lock poisoned");
            if buckets.total() >= self.depth_limit {
                return Err(job);
            }
            buckets.bucket_mut(job.priority()).push_back(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Return a job to the head of its priority bucket, preserving its
    /// original enqueue timestamp. Used for retries and failed placements;
    /// not subject to the depth limit.
    pub fn requeue_front(&self, job: Job) {
        {
            let mut buckets = self.buckets.lock().expect("queue lock poisoned");
            buckets.bucket_mut(job.priority()).push_front(job);
        }
        self.notify.notify_one();
    }

    /// Remove and return the highest-priority, oldest job whose request the
    /// predicate accepts. Jobs past their deadline are dropped as scanned
    /// and returned separately.
    pub fn take_matching(
        &self,
        now: DateTime<Utc>,
        pred: impl Fn(&Job) -> bool,
    ) -> TakeOutcome {
        let mut buckets = self.buckets.lock().expect("queue lock poisoned");
        let mut expired = Vec::new();

        let Buckets { high, medium, low } = &mut *buckets;
        for bucket in [high, medium, low] {
            let mut i = 0;
            while i < bucket.len() {
                if bucket[i].is_expired(now) {
                    if let Some(job) = bucket.remove(i) {
                        expired.push(job);
                    }
                    continue;
                }
                if pred(&bucket[i]) {
                    let job = bucket.remove(i);
                    return TakeOutcome { job, expired };
                }
                i += 1;
            }
        }

        TakeOutcome { job: None, expired }
    }

    /// Remove a queued job by id. Returns the job if it was still queued.
    pub fn cancel(&self, job_id: JobId) -> Option<Job> {
        let mut buckets = self.buckets.lock().expect("queue lock poisoned");
        let Buckets { high, medium, low } = &mut *buckets;
        for bucket in [high, medium, low] {
            if let Some(i) = bucket.iter().position(|j| j.id() == job_id) {
                return bucket.remove(i);
            }
        }
        None
    }

    /// Drain every queued job whose deadline has passed.
    pub fn remove_expired(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut buckets = self.buckets.lock().expect("queue lock poisoned");
        let mut expired = Vec::new();
        let Buckets { high, medium, low } = &mut *buckets;
        for bucket in [high, medium, low] {
            let mut i = 0;
            while i < bucket.len() {
                if bucket[i].is_expired(now) {
                    if let Some(job) = bucket.remove(i) {
                        expired.push(job);
                    }
                } else {
                    i += 1;
                }
            }
        }
        expired
    }

    pub fn depth(&self) -> usize {
        self.buckets.lock().expect("queue lock poisoned").total()
    }

    pub fn depth_by_priority(&self) -> QueueDepth {
        let buckets = self.buckets.lock().expect("queue lock poisoned");
        QueueDepth {
            high: buckets.high.len(),
            medium: buckets.medium.len(),
            low: buckets.low.len(),
            total: buckets.total(),
        }
    }
}
