//! Global affinity counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use telemetry_metrics::counter;

/// Counters shared by the ownership directory, heartbeat and relay
#[derive(Default)]
pub struct AffinityMetrics {
    ownership_claims: AtomicU64,
    ownership_conflicts: AtomicU64,
    ownership_reclaims: AtomicU64,
    ownership_reclaim_failures: AtomicU64,
    heartbeat_write_failures: AtomicU64,
    store_errors: AtomicU64,
    forwards: AtomicU64,
    forward_failures: AtomicU64,
}

impl AffinityMetrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// This worker became owner of a session
    pub fn record_claim(&self) {
        self.ownership_claims.fetch_add(1, Ordering::Relaxed);
    }

    /// A claim found another live owner
    pub fn record_conflict(&self) {
        self.ownership_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// A reclaim won its compare-and-swap
    pub fn record_reclaim(&self) {
        self.ownership_reclaims.fetch_add(1, Ordering::Relaxed);
        counter!("mcp_affinity_ownership_reclaims_total").increment(1);
    }

    /// A reclaim was refused or lost
    pub fn record_reclaim_failure(&self) {
        self.ownership_reclaim_failures.fetch_add(1, Ordering::Relaxed);
        counter!("mcp_affinity_ownership_reclaim_failures_total").increment(1);
    }

    /// A heartbeat or metadata write failed
    pub fn record_heartbeat_failure(&self) {
        self.heartbeat_write_failures.fetch_add(1, Ordering::Relaxed);
        counter!("mcp_affinity_heartbeat_write_failures_total").increment(1);
    }

    /// The coordination store failed on the request path
    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
        counter!("mcp_affinity_store_errors_total").increment(1);
    }

    /// A request was relayed to its owner
    pub fn record_forward(&self, ok: bool) {
        self.forwards.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.forward_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Successful reclaims so far
    #[must_use]
    pub fn ownership_reclaims(&self) -> u64 {
        self.ownership_reclaims.load(Ordering::Relaxed)
    }

    /// Refused or lost reclaims so far
    #[must_use]
    pub fn ownership_reclaim_failures(&self) -> u64 {
        self.ownership_reclaim_failures.load(Ordering::Relaxed)
    }

    /// Failed heartbeat writes so far
    #[must_use]
    pub fn heartbeat_write_failures(&self) -> u64 {
        self.heartbeat_write_failures.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> AffinitySnapshot {
        AffinitySnapshot {
            ownership_claims: self.ownership_claims.load(Ordering::Relaxed),
            ownership_conflicts: self.ownership_conflicts.load(Ordering::Relaxed),
            ownership_reclaims: self.ownership_reclaims.load(Ordering::Relaxed),
            ownership_reclaim_failures: self.ownership_reclaim_failures.load(Ordering::Relaxed),
            heartbeat_write_failures: self.heartbeat_write_failures.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            forwards: self.forwards.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
        }
    }
}

/// Serializable affinity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AffinitySnapshot {
    /// Sessions claimed by this worker
    pub ownership_claims: u64,
    /// Claims that found another owner
    pub ownership_conflicts: u64,
    /// Successful reclaims
    pub ownership_reclaims: u64,
    /// Refused or lost reclaims
    pub ownership_reclaim_failures: u64,
    /// Failed heartbeat writes
    pub heartbeat_write_failures: u64,
    /// Coordination store errors on the request path
    pub store_errors: u64,
    /// Requests relayed to another worker
    pub forwards: u64,
    /// Relays that failed or timed out
    pub forward_failures: u64,
}
