//! Worker heartbeat and liveness checks
//!
//! Every worker writes `worker_heartbeat:{id}` (unix seconds) and
//! `worker_metadata:{id}` (JSON) on a fixed interval. A worker whose record
//! is missing or older than the stale threshold is treated as dead for
//! reclamation; that verdict is a hint, reclaim still goes through CAS.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::metrics::AffinityMetrics;
use crate::Result;
use crate::config::AffinityConfig;
use crate::coordination::{CoordinationStore, keys};

/// JSON published under `worker_metadata:{worker_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetadata {
    /// Worker identity
    pub worker_id: String,
    /// Base URL peers use for direct forwarding
    pub advertise_url: String,
    /// Process start time
    pub started_at: DateTime<Utc>,
    /// Sessions terminated on this worker
    pub local_sessions: usize,
    /// Gateway version
    pub version: String,
}

/// Heartbeat writer and liveness reader for one worker
pub struct WorkerHeartbeat {
    store: Arc<dyn CoordinationStore>,
    worker_id: String,
    advertise_url: String,
    started_at: DateTime<Utc>,
    interval: Duration,
    ttl: Duration,
    stale_threshold: Duration,
    metadata_ttl: Duration,
    local_sessions: AtomicUsize,
    metrics: Arc<AffinityMetrics>,
}

impl WorkerHeartbeat {
    /// Create a heartbeat for `worker_id`
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: &AffinityConfig,
        worker_id: impl Into<String>,
        advertise_url: impl Into<String>,
        metrics: Arc<AffinityMetrics>,
    ) -> Self {
        Self {
            store,
            worker_id: worker_id.into(),
            advertise_url: advertise_url.into(),
            started_at: Utc::now(),
            interval: config.heartbeat_interval,
            ttl: config.heartbeat_ttl,
            stale_threshold: config.stale_threshold,
            metadata_ttl: config.metadata_ttl,
            local_sessions: AtomicUsize::new(0),
            metrics,
        }
    }

    /// This worker's id
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Update the session count published in metadata
    pub fn set_local_sessions(&self, count: usize) {
        self.local_sessions.store(count, Ordering::Relaxed);
    }

    /// Metadata this worker publishes
    #[must_use]
    pub fn metadata(&self) -> WorkerMetadata {
        WorkerMetadata {
            worker_id: self.worker_id.clone(),
            advertise_url: self.advertise_url.clone(),
            started_at: self.started_at,
            local_sessions: self.local_sessions.load(Ordering::Relaxed),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Write heartbeat and metadata once; failures are counted, not raised
    pub async fn beat(&self) -> bool {
        let now = Utc::now().timestamp().to_string();
        let heartbeat = self
            .store
            .set_ex(&keys::worker_heartbeat(&self.worker_id), &now, self.ttl)
            .await;

        let metadata = match serde_json::to_string(&self.metadata()) {
            Ok(json) => {
                self.store
                    .set_ex(&keys::worker_metadata(&self.worker_id), &json, self.metadata_ttl)
                    .await
            }
            Err(e) => Err(e.into()),
        };

        match heartbeat.and(metadata) {
            Ok(()) => {
                debug!(worker_id = %self.worker_id, "Heartbeat written");
                true
            }
            Err(e) => {
                self.metrics.record_heartbeat_failure();
                warn!(worker_id = %self.worker_id, error = %e, "Heartbeat write failed");
                false
            }
        }
    }

    /// Spawn the heartbeat loop; the first beat is immediate
    pub fn start(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let heartbeat = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat.interval);
            info!(
                worker_id = %heartbeat.worker_id,
                interval = ?heartbeat.interval,
                "Worker heartbeat started"
            );
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        heartbeat.beat().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            heartbeat.retire().await;
        })
    }

    /// Remove this worker's records so peers can reclaim its sessions at once
    pub async fn retire(&self) {
        let heartbeat = self
            .store
            .delete(&keys::worker_heartbeat(&self.worker_id))
            .await;
        let metadata = self
            .store
            .delete(&keys::worker_metadata(&self.worker_id))
            .await;
        if let Err(e) = heartbeat.and(metadata) {
            warn!(worker_id = %self.worker_id, error = %e, "Failed to retire heartbeat");
        } else {
            info!(worker_id = %self.worker_id, "Worker heartbeat retired");
        }
    }

    /// Whether `worker_id` has a heartbeat younger than the stale threshold.
    ///
    /// # Errors
    ///
    /// Propagates coordination store failures so callers can refuse to act
    /// on an unknown liveness verdict.
    pub async fn is_worker_healthy(&self, worker_id: &str) -> Result<bool> {
        if worker_id == self.worker_id {
            return Ok(true);
        }
        let Some(raw) = self.store.get(&keys::worker_heartbeat(worker_id)).await? else {
            return Ok(false);
        };
        let Ok(last_seen) = raw.parse::<i64>() else {
            warn!(worker_id, value = %raw, "Unparseable heartbeat record");
            return Ok(false);
        };
        let age = Utc::now().timestamp().saturating_sub(last_seen);
        let stale = i64::try_from(self.stale_threshold.as_secs()).unwrap_or(i64::MAX);
        Ok(age <= stale)
    }

    /// Metadata published by `worker_id`, if any.
    ///
    /// # Errors
    ///
    /// Propagates coordination store failures.
    pub async fn worker_metadata(&self, worker_id: &str) -> Result<Option<WorkerMetadata>> {
        match self.store.get(&keys::worker_metadata(worker_id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::MemoryStore;

    fn heartbeat(store: &Arc<MemoryStore>, worker_id: &str) -> WorkerHeartbeat {
        let store: Arc<dyn CoordinationStore> = Arc::clone(store) as _;
        WorkerHeartbeat::new(
            store,
            &AffinityConfig::default(),
            worker_id,
            format!("http://{worker_id}:39410"),
            Arc::new(AffinityMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_beat_publishes_heartbeat_and_metadata() {
        let store = Arc::new(MemoryStore::new());
        let a = heartbeat(&store, "worker-a");
        let b = heartbeat(&store, "worker-b");

        assert!(!b.is_worker_healthy("worker-a").await.unwrap());
        a.set_local_sessions(3);
        assert!(a.beat().await);
        assert!(b.is_worker_healthy("worker-a").await.unwrap());

        let meta = b.worker_metadata("worker-a").await.unwrap().unwrap();
        assert_eq!(meta.advertise_url, "http://worker-a:39410");
        assert_eq!(meta.local_sessions, 3);
    }

    #[tokio::test]
    async fn test_stale_timestamp_is_unhealthy() {
        let store = Arc::new(MemoryStore::new());
        let b = heartbeat(&store, "worker-b");
        let stale = (Utc::now().timestamp() - 71).to_string();
        store
            .set_ex(&keys::worker_heartbeat("worker-a"), &stale, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!b.is_worker_healthy("worker-a").await.unwrap());

        let fresh = (Utc::now().timestamp() - 30).to_string();
        store
            .set_ex(&keys::worker_heartbeat("worker-a"), &fresh, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(b.is_worker_healthy("worker-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_write_failure_is_counted() {
        let store = Arc::new(MemoryStore::new());
        let a = heartbeat(&store, "worker-a");
        store.set_available(false);
        assert!(!a.beat().await);
        assert_eq!(a.metrics.heartbeat_write_failures(), 1);
    }

    #[tokio::test]
    async fn test_retire_removes_records() {
        let store = Arc::new(MemoryStore::new());
        let a = heartbeat(&store, "worker-a");
        let b = heartbeat(&store, "worker-b");
        a.beat().await;
        a.retire().await;
        assert!(!b.is_worker_healthy("worker-a").await.unwrap());
        assert!(store.is_empty());
    }
}
