//! Distributed session ownership
//!
//! `pool_owner:{session_id}` names the one worker allowed to hold an upstream
//! connection for a session. Ownership is taken with set-if-absent and only
//! ever moves between workers through compare-and-swap (see `reclaim`).
//!
//! The directory also keeps this worker's session → pool key mappings, so
//! every request of a session lands on the same pool and, under `sticky`,
//! the same connection.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::heartbeat::WorkerHeartbeat;
use super::metrics::AffinityMetrics;
use crate::config::AffinityConfig;
use crate::coordination::{CoordinationStore, keys};
use crate::pool::{Lease, PoolKey, PoolManager};
use crate::{Error, Result};

/// Result of a claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    /// This worker owns the session
    Owned,
    /// Another worker owns the session
    OwnedBy(String),
    /// The store could not answer; the caller proceeds without affinity
    Unknown,
}

/// A lease taken on behalf of a session
#[derive(Clone)]
pub struct AffinityLease {
    /// Pool the lease came from
    pub key: PoolKey,
    /// The leased connection
    pub lease: Lease,
    /// Session the lease serves, if the client named one
    pub session_id: Option<String>,
}

/// Pool key a session resolved to, and when it was last used here
struct SessionMapping {
    key: PoolKey,
    touched: Instant,
}

/// Session → owner directory for one worker
pub struct OwnershipDirectory {
    pub(super) store: Arc<dyn CoordinationStore>,
    pub(super) worker_id: String,
    pub(super) ownership_ttl: Duration,
    enabled: bool,
    session_header: String,
    mappings: DashMap<String, SessionMapping>,
    pub(super) pools: Arc<PoolManager>,
    pub(super) heartbeat: Arc<WorkerHeartbeat>,
    pub(super) metrics: Arc<AffinityMetrics>,
}

impl OwnershipDirectory {
    /// Create a directory for the worker `heartbeat` speaks for
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        config: &AffinityConfig,
        pools: Arc<PoolManager>,
        heartbeat: Arc<WorkerHeartbeat>,
        metrics: Arc<AffinityMetrics>,
    ) -> Self {
        Self {
            store,
            worker_id: heartbeat.worker_id().to_string(),
            ownership_ttl: config.ownership_ttl,
            enabled: config.enabled,
            session_header: config.session_header.to_ascii_lowercase(),
            mappings: DashMap::new(),
            pools,
            heartbeat,
            metrics,
        }
    }

    /// This worker's id
    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Whether cross-worker ownership is tracked at all
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Pool manager this directory acquires from
    #[must_use]
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Heartbeat used for liveness checks
    #[must_use]
    pub fn heartbeat(&self) -> &Arc<WorkerHeartbeat> {
        &self.heartbeat
    }

    /// Affinity counters
    #[must_use]
    pub fn metrics(&self) -> &Arc<AffinityMetrics> {
        &self.metrics
    }

    /// Header carrying the client session id (lowercase)
    #[must_use]
    pub fn session_header(&self) -> &str {
        &self.session_header
    }

    /// Client session id carried in `headers`, if any
    #[must_use]
    pub fn session_id_from_headers(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.session_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Pre-register the pool key a session will use.
    ///
    /// Idempotent; returns true only when the mapping was new or changed.
    /// Every call marks the mapping as used.
    pub fn register_mapping(&self, session_id: &str, key: &PoolKey) -> bool {
        let mapping = SessionMapping {
            key: key.clone(),
            touched: Instant::now(),
        };
        match self.mappings.insert(session_id.to_string(), mapping) {
            Some(previous) if previous.key == *key => false,
            Some(previous) => {
                debug!(session_id, from = %previous.key, to = %key, "Session remapped");
                true
            }
            None => {
                debug!(session_id, pool = %key, "Session mapped");
                true
            }
        }
    }

    /// Pool key pre-registered for `session_id`
    #[must_use]
    pub fn mapping(&self, session_id: &str) -> Option<PoolKey> {
        self.mappings.get(session_id).map(|e| e.value().key.clone())
    }

    /// Drop the mapping for `session_id`
    pub fn forget_mapping(&self, session_id: &str) -> Option<PoolKey> {
        self.mappings.remove(session_id).map(|(_, mapping)| mapping.key)
    }

    /// Forget mappings this worker no longer needs; returns how many went.
    ///
    /// Sessions for which `is_local` holds are kept. Any other mapping goes
    /// once it has been idle for the ownership TTL or, with affinity enabled,
    /// once the ownership record no longer names this worker. A store error
    /// keeps the mapping until the next pass.
    pub async fn prune_mappings(&self, is_local: impl Fn(&str) -> bool) -> usize {
        let candidates: Vec<(String, bool)> = self
            .mappings
            .iter()
            .filter(|e| !is_local(e.key()))
            .map(|e| (e.key().clone(), e.value().touched.elapsed() >= self.ownership_ttl))
            .collect();

        let mut pruned = 0;
        for (session_id, idle) in candidates {
            let stale = idle
                || (self.enabled
                    && match self.current_owner(&session_id).await {
                        Ok(owner) => owner.as_deref() != Some(self.worker_id.as_str()),
                        Err(_) => {
                            self.metrics.record_store_error();
                            false
                        }
                    });
            if stale && self.forget_mapping(&session_id).is_some() {
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, remaining = self.mappings.len(), "Pruned session mappings");
        }
        pruned
    }

    /// Number of mapped sessions
    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    /// Acquire for the session named in `headers`.
    ///
    /// A pre-registered mapping overrides `fallback`; without a session id
    /// the request is independent and `fallback` is used as-is.
    ///
    /// # Errors
    ///
    /// [`Error::TargetNotFound`] if neither a mapping nor a fallback exists,
    /// plus every pool acquisition error.
    pub async fn acquire_with_affinity(
        &self,
        headers: &HeaderMap,
        fallback: Option<&PoolKey>,
    ) -> Result<AffinityLease> {
        let session_id = self.session_id_from_headers(headers);
        self.acquire_for_session(session_id.as_deref(), fallback)
            .await
    }

    /// Acquire on behalf of `session_id`; see [`Self::acquire_with_affinity`].
    ///
    /// # Errors
    ///
    /// Same as [`Self::acquire_with_affinity`].
    pub async fn acquire_for_session(
        &self,
        session_id: Option<&str>,
        fallback: Option<&PoolKey>,
    ) -> Result<AffinityLease> {
        let key = session_id
            .and_then(|sid| self.mapping(sid))
            .or_else(|| fallback.cloned())
            .ok_or_else(|| {
                Error::TargetNotFound(session_id.unwrap_or("<no session>").to_string())
            })?;

        let pool = match self.pools.get_pool(&key) {
            Some(pool) => pool,
            None => {
                self.pools
                    .get_or_create_pool(&key, self.pools.default_config())
                    .await?
            }
        };
        let lease = pool.acquire(session_id).await?;
        Ok(AffinityLease {
            key,
            lease,
            session_id: session_id.map(str::to_string),
        })
    }

    /// Claim `session_id` for this worker.
    ///
    /// Store failures are counted and yield [`Ownership::Unknown`] instead of
    /// an error, so the request proceeds locally without affinity.
    pub async fn claim_ownership(&self, session_id: &str) -> Ownership {
        if !self.enabled {
            return Ownership::Unknown;
        }
        let key = keys::pool_owner(session_id);

        // A second round covers an owner record expiring between the two calls
        for _ in 0..2 {
            match self
                .store
                .set_nx_ex(&key, &self.worker_id, self.ownership_ttl)
                .await
            {
                Ok(true) => {
                    self.metrics.record_claim();
                    debug!(session_id, worker_id = %self.worker_id, "Session claimed");
                    return Ownership::Owned;
                }
                Ok(false) => {}
                Err(e) => return self.degrade(session_id, &e),
            }

            match self.store.get(&key).await {
                Ok(Some(owner)) if owner == self.worker_id => {
                    self.refresh_ownership(session_id).await;
                    return Ownership::Owned;
                }
                Ok(Some(owner)) => {
                    self.metrics.record_conflict();
                    debug!(session_id, owner = %owner, "Session owned elsewhere");
                    return Ownership::OwnedBy(owner);
                }
                Ok(None) => {}
                Err(e) => return self.degrade(session_id, &e),
            }
        }
        Ownership::Unknown
    }

    fn degrade(&self, session_id: &str, error: &Error) -> Ownership {
        self.metrics.record_store_error();
        warn!(session_id, error = %error, "Coordination store unavailable, proceeding without affinity");
        Ownership::Unknown
    }

    /// Refresh the ownership TTL; false if this worker no longer owns it
    pub async fn refresh_ownership(&self, session_id: &str) -> bool {
        if !self.enabled {
            return false;
        }
        match self
            .store
            .compare_and_swap(
                &keys::pool_owner(session_id),
                &self.worker_id,
                &self.worker_id,
                self.ownership_ttl,
            )
            .await
        {
            Ok(refreshed) => refreshed,
            Err(e) => {
                self.metrics.record_store_error();
                debug!(session_id, error = %e, "Ownership refresh failed");
                false
            }
        }
    }

    /// Give up ownership if this worker still holds it, and drop the mapping
    pub async fn release_ownership(&self, session_id: &str) -> bool {
        self.forget_mapping(session_id);
        if !self.enabled {
            return false;
        }
        match self
            .store
            .delete_if_equals(&keys::pool_owner(session_id), &self.worker_id)
            .await
        {
            Ok(released) => {
                if released {
                    info!(session_id, worker_id = %self.worker_id, "Session ownership released");
                }
                released
            }
            Err(e) => {
                self.metrics.record_store_error();
                warn!(session_id, error = %e, "Failed to release session ownership");
                false
            }
        }
    }

    /// Current owner of `session_id`.
    ///
    /// # Errors
    ///
    /// Propagates coordination store failures.
    pub async fn current_owner(&self, session_id: &str) -> Result<Option<String>> {
        self.store.get(&keys::pool_owner(session_id)).await
    }
}
