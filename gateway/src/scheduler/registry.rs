//! Worker registry: the authoritative view of the fleet.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use fleet_common::{ModelDescriptor, WorkerCapabilities, WorkerLiveness, WorkerSnapshot};

use crate::error::RegistryError;

/// A registered worker.
#[derive(Debug, Clone)]
struct WorkerEntry {
    id: String,
    address: String,
    capabilities: WorkerCapabilities,
    token: String,
    liveness: WorkerLiveness,
    /// Authoritative in-flight count, maintained by the dispatcher via
    /// `try_acquire` / `release`.
    in_flight: u32,
    /// In-flight count as last reported by the worker itself.
    reported_in_flight: u32,
    registered_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
}

impl WorkerEntry {
    fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            id: self.id.clone(),
            address: self.address.clone(),
            liveness: self.liveness,
            models: self
                .capabilities
                .models
                .iter()
                .map(|m| m.name.clone())
                .collect(),
            max_concurrency: self.capabilities.max_concurrency,
            supports_streaming: self.capabilities.supports_streaming,
            in_flight: self.in_flight,
            reported_in_flight: self.reported_in_flight,
            registered_at: self.registered_at,
            last_heartbeat: self.last_heartbeat,
        }
    }
}

/// Models that currently have at least one assignable worker with a free slot.
#[derive(Debug, Default)]
pub struct DispatchableModels {
    pub any: HashSet<String>,
    pub streaming: HashSet<String>,
}

impl DispatchableModels {
    pub fn accepts(&self, model: &str, streaming: bool) -> bool {
        if streaming {
            self.streaming.contains(model)
        } else {
            self.any.contains(model)
        }
    }
}

/// Registry of known workers.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerEntry>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker, idempotent by id.
    ///
    /// Re-registering replaces the capabilities atomically and issues a
    /// fresh session token; the worker re-joins and becomes ready on its
    /// next heartbeat. Registering an existing id under a different address
    /// is rejected.
    pub async fn register(
        &self,
        id: &str,
        address: &str,
        capabilities: WorkerCapabilities,
    ) -> Result<String, RegistryError> {
        let mut workers = self.workers.write().await;
        let now = Utc::now();
        let token = Uuid::new_v4().to_string();

        if let Some(existing) = workers.get_mut(id) {
            if existing.address != address {
                return Err(RegistryError::AddressMismatch {
                    id: id.to_string(),
                    existing: existing.address.clone(),
                });
            }
            existing.capabilities = capabilities;
            existing.token = token.clone();
            existing.liveness = WorkerLiveness::Joining;
            existing.registered_at = now;
            existing.last_heartbeat = now;
            return Ok(token);
        }

        workers.insert(
            id.to_string(),
            WorkerEntry {
                id: id.to_string(),
                address: address.to_string(),
                capabilities,
                token: token.clone(),
                liveness: WorkerLiveness::Joining,
                in_flight: 0,
                reported_in_flight: 0,
                registered_at: now,
                last_heartbeat: now,
            },
        );
        tracing::info!(worker_id = %id, %address, "worker registered");
        Ok(token)
    }

    /// Refresh a worker's last-seen timestamp and observed load.
    ///
    /// The first successful heartbeat moves a joining worker to ready.
    pub async fn heartbeat(
        &self,
        id: &str,
        token: &str,
        reported_in_flight: u32,
    ) -> Result<(), RegistryError> {
        let mut workers = self.workers.write().await;
        let entry = workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.to_string()))?;

        if entry.token != token {
            return Err(RegistryError::StaleSession(id.to_string()));
        }

        let now = Utc::now();
        if now > entry.last_heartbeat {
            entry.last_heartbeat = now;
        }
        entry.reported_in_flight = reported_in_flight;
        if entry.liveness == WorkerLiveness::Joining {
            entry.liveness = WorkerLiveness::Ready;
            tracing::info!(worker_id = %id, "worker ready");
        }
        Ok(())
    }

    /// Mark a worker draining; it is removed once its in-flight count
    /// reaches zero.
    pub async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let mut workers = self.workers.write().await;
        let entry = workers
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownWorker(id.to_string()))?;

        if entry.in_flight == 0 {
            workers.remove(id);
            tracing::info!(worker_id = %id, "worker deregistered");
        } else {
            entry.liveness = WorkerLiveness::Draining;
            tracing::info!(worker_id = %id, in_flight = entry.in_flight, "worker draining");
        }
        Ok(())
    }

    /// Ready workers carrying `model`, ordered by the selection policy:
    /// least loaded first, then earliest registration, then id.
    pub async fn candidates(&self, model: &str, require_streaming: bool) -> Vec<String> {
        let workers = self.workers.read().await;
        let mut matching: Vec<&WorkerEntry> = workers
            .values()
            .filter(|w| {
                w.liveness.is_assignable()
                    && w.capabilities.has_model(model)
                    && (!require_streaming || w.capabilities.supports_streaming)
            })
            .collect();
        matching.sort_by(|a, b| {
            a.in_flight
                .cmp(&b.in_flight)
                .then(a.registered_at.cmp(&b.registered_at))
                .then(a.id.cmp(&b.id))
        });
        matching.into_iter().map(|w| w.id.clone()).collect()
    }

    /// Reserve a slot on a worker. Fails when the worker is not assignable
    /// or already at its declared concurrency limit.
    pub async fn try_acquire(&self, id: &str) -> bool {
        let mut workers = self.workers.write().await;
        match workers.get_mut(id) {
            Some(entry)
                if entry.liveness.is_assignable()
                    && entry.in_flight < entry.capabilities.max_concurrency =>
            {
                entry.in_flight += 1;
                true
            }
            _ => false,
        }
    }

    /// Release a slot. A draining worker is removed once drained.
    pub async fn release(&self, id: &str) {
        let mut workers = self.workers.write().await;
        if let Some(entry) = workers.get_mut(id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
            if entry.liveness == WorkerLiveness::Draining && entry.in_flight == 0 {
                workers.remove(id);
                tracing::info!(worker_id = %id, "drained worker removed");
            }
        }
    }

    pub async fn address_of(&self, id: &str) -> Option<String> {
        self.workers.read().await.get(id).map(|w| w.address.clone())
    }

    pub async fn in_flight(&self, id: &str) -> Option<u32> {
        self.workers.read().await.get(id).map(|w| w.in_flight)
    }

    /// Models that can be dispatched right now (a ready worker with a free
    /// slot carries them), split by streaming support.
    pub async fn dispatchable_models(&self) -> DispatchableModels {
        let workers = self.workers.read().await;
        let mut out = DispatchableModels::default();
        for w in workers.values() {
            if !w.liveness.is_assignable() || w.in_flight >= w.capabilities.max_concurrency {
                continue;
            }
            for m in &w.capabilities.models {
                out.any.insert(m.name.clone());
                if w.capabilities.supports_streaming {
                    out.streaming.insert(m.name.clone());
                }
            }
        }
        out
    }

    /// Union of model names over ready workers, sorted.
    pub async fn all_available_models(&self) -> BTreeSet<String> {
        let workers = self.workers.read().await;
        workers
            .values()
            .filter(|w| w.liveness.is_assignable())
            .flat_map(|w| w.capabilities.models.iter().map(|m| m.name.clone()))
            .collect()
    }

    /// Deduplicated model directory over ready workers, sorted by name.
    /// When the same model is advertised by several workers, the newest
    /// modification timestamp wins.
    pub async fn model_directory(&self) -> Vec<ModelDescriptor> {
        let workers = self.workers.read().await;
        let mut by_name: HashMap<String, ModelDescriptor> = HashMap::new();
        for w in workers.values() {
            if !w.liveness.is_assignable() {
                continue;
            }
            for m in &w.capabilities.models {
                by_name
                    .entry(m.name.clone())
                    .and_modify(|current| {
                        if m.modified_at > current.modified_at {
                            *current = m.clone();
                        }
                    })
                    .or_insert_with(|| m.clone());
            }
        }
        let mut models: Vec<ModelDescriptor> = by_name.into_values().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }

    /// Whether any ready worker carries `model`.
    pub async fn is_model_available(&self, model: &str, require_streaming: bool) -> bool {
        let workers = self.workers.read().await;
        workers.values().any(|w| {
            w.liveness.is_assignable()
                && w.capabilities.has_model(model)
                && (!require_streaming || w.capabilities.supports_streaming)
        })
    }

    /// Observability snapshot of the fleet.
    pub async fn list_workers(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.read().await;
        let mut snapshots: Vec<WorkerSnapshot> = workers.values().map(|w| w.snapshot()).collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    pub async fn count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Declare workers whose heartbeat is overdue lost and reap them.
    /// Returns the reaped worker ids so their in-flight jobs can be failed
    /// or retried.
    pub async fn sweep_lost(&self, threshold: Duration) -> Vec<String> {
        let now = Utc::now();
        let threshold =
            chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::seconds(30));
        let mut lost = vec![];
        let mut workers = self.workers.write().await;

        workers.retain(|id, entry| {
            let silence = now - entry.last_heartbeat;
            if silence > threshold {
                tracing::warn!(
                    worker_id = %id,
                    silence_secs = silence.num_seconds(),
                    "worker lost (heartbeat overdue)"
                );
                entry.liveness = WorkerLiveness::Lost;
                lost.push(id.clone());
                false
            } else {
                true
            }
        });

        lost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(models: Vec<&str>, max_concurrency: u32) -> WorkerCapabilities {
        WorkerCapabilities {
            models: models.into_iter().map(ModelDescriptor::named).collect(),
            max_concurrency,
            supports_streaming: true,
        }
    }

    async fn register_ready(registry: &WorkerRegistry, id: &str, capabilities: WorkerCapabilities) {
        let token = registry
            .register(id, "10.0.0.1:11434", capabilities)
            .await
            .unwrap();
        registry.heartbeat(id, &token, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_register_and_heartbeat_to_ready() {
        let registry = WorkerRegistry::new();
        let token = registry
            .register("w1", "10.0.0.1:11434", caps(vec!["m1"], 2))
            .await
            .unwrap();

        // Joining workers are not candidates yet.
        assert!(registry.candidates("m1", false).await.is_empty());

        registry.heartbeat("w1", &token, 0).await.unwrap();
        assert_eq!(registry.candidates("m1", false).await, vec!["w1"]);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let registry = WorkerRegistry::new();
        registry
            .register("w1", "10.0.0.1:11434", caps(vec!["m1"], 2))
            .await
            .unwrap();
        registry
            .register("w1", "10.0.0.1:11434", caps(vec!["m1"], 2))
            .await
            .unwrap();
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_register_replaces_capabilities() {
        let registry = WorkerRegistry::new();
        register_ready(&registry, "w1", caps(vec!["m1"], 2)).await;

        let token = registry
            .register("w1", "10.0.0.1:11434", caps(vec!["m2"], 4))
            .await
            .unwrap();
        registry.heartbeat("w1", &token, 0).await.unwrap();

        assert!(registry.candidates("m1", false).await.is_empty());
        assert_eq!(registry.candidates("m2", false).await, vec!["w1"]);
    }

    #[tokio::test]
    async fn test_register_rejects_address_change() {
        let registry = WorkerRegistry::new();
        registry
            .register("w1", "10.0.0.1:11434", caps(vec!["m1"], 2))
            .await
            .unwrap();

        let result = registry
            .register("w1", "10.0.0.2:11434", caps(vec!["m1"], 2))
            .await;
        assert!(matches!(
            result,
            Err(RegistryError::AddressMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_rejects_stale_token() {
        let registry = WorkerRegistry::new();
        let old_token = registry
            .register("w1", "10.0.0.1:11434", caps(vec!["m1"], 2))
            .await
            .unwrap();
        // Re-registration rotates the token.
        registry
            .register("w1", "10.0.0.1:11434", caps(vec!["m1"], 2))
            .await
            .unwrap();

        let result = registry.heartbeat("w1", &old_token, 0).await;
        assert!(matches!(result, Err(RegistryError::StaleSession(_))));
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker() {
        let registry = WorkerRegistry::new();
        let result = registry.heartbeat("nope", "t", 0).await;
        assert!(matches!(result, Err(RegistryError::UnknownWorker(_))));
    }

    #[tokio::test]
    async fn test_candidates_least_loaded_first() {
        let registry = WorkerRegistry::new();
        register_ready(&registry, "w1", caps(vec!["m1"], 4)).await;
        register_ready(&registry, "w2", caps(vec!["m1"], 4)).await;

        assert!(registry.try_acquire("w1").await);
        assert!(registry.try_acquire("w1").await);

        let candidates = registry.candidates("m1", false).await;
        assert_eq!(candidates[0], "w2");
        assert_eq!(candidates[1], "w1");
    }

    #[tokio::test]
    async fn test_try_acquire_respects_max_concurrency() {
        let registry = WorkerRegistry::new();
        register_ready(&registry, "w1", caps(vec!["m1"], 1)).await;

        assert!(registry.try_acquire("w1").await);
        assert!(!registry.try_acquire("w1").await);

        registry.release("w1").await;
        assert!(registry.try_acquire("w1").await);
    }

    #[tokio::test]
    async fn test_deregister_drains_then_removes() {
        let registry = WorkerRegistry::new();
        register_ready(&registry, "w1", caps(vec!["m1"], 2)).await;
        assert!(registry.try_acquire("w1").await);

        registry.deregister("w1").await.unwrap();
        // Still present while draining, but not assignable.
        assert_eq!(registry.count().await, 1);
        assert!(!registry.try_acquire("w1").await);
        assert!(registry.candidates("m1", false).await.is_empty());

        registry.release("w1").await;
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_deregister_idle_removes_immediately() {
        let registry = WorkerRegistry::new();
        register_ready(&registry, "w1", caps(vec!["m1"], 2)).await;
        registry.deregister("w1").await.unwrap();
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_all_available_models_union() {
        let registry = WorkerRegistry::new();
        register_ready(&registry, "w1", caps(vec!["m1", "m2"], 2)).await;
        register_ready(&registry, "w2", caps(vec!["m2", "m3"], 2)).await;

        let models: Vec<String> = registry.all_available_models().await.into_iter().collect();
        assert_eq!(models, vec!["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn test_model_directory_newest_timestamp_wins() {
        let registry = WorkerRegistry::new();
        let older = chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let newer = chrono::DateTime::parse_from_rfc3339("2025-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);

        let mut caps_old = caps(vec!["m1"], 2);
        caps_old.models[0].modified_at = Some(older);
        let mut caps_new = caps(vec!["m1"], 2);
        caps_new.models[0].modified_at = Some(newer);

        register_ready(&registry, "w1", caps_old).await;
        register_ready(&registry, "w2", caps_new).await;

        let directory = registry.model_directory().await;
        assert_eq!(directory.len(), 1);
        assert_eq!(directory[0].modified_at, Some(newer));
    }

    #[tokio::test]
    async fn test_sweep_lost_reaps_silent_workers() {
        let registry = WorkerRegistry::new();
        register_ready(&registry, "w1", caps(vec!["m1"], 2)).await;

        // Generous threshold: nothing is lost.
        assert!(registry.sweep_lost(Duration::from_secs(60)).await.is_empty());
        assert_eq!(registry.count().await, 1);

        // Zero threshold: the worker's heartbeat is immediately overdue.
        let lost = registry.sweep_lost(Duration::from_secs(0)).await;
        assert_eq!(lost, vec!["w1"]);
        assert_eq!(registry.count().await, 0);
    }

    #[tokio::test]
    async fn test_dispatchable_models_skips_full_workers() {
        let registry = WorkerRegistry::new();
        register_ready(&registry, "w1", caps(vec!["m1"], 1)).await;
        assert!(registry.try_acquire("w1").await);

        let models = registry.dispatchable_models().await;
        assert!(!models.accepts("m1", false));

        registry.release("w1").await;
        let models = registry.dispatchable_models().await;
        assert!(models.accepts("m1", false));
        assert!(models.accepts("m1", true));
    }

    #[tokio::test]
    async fn test_streaming_candidates_filtered() {
        let registry = WorkerRegistry::new();
        let mut no_stream = caps(vec!["m1"], 2);
        no_stream.supports_streaming = false;
        register_ready(&registry, "w1", no_stream).await;

        assert_eq!(registry.candidates("m1", false).await, vec!["w1"]);
        assert!(registry.candidates("m1", true).await.is_empty());
        assert!(!registry.is_model_available("m1", true).await);
        assert!(registry.is_model_available("m1", false).await);
    }
}
