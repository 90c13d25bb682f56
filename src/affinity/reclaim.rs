//! Ownership reclamation from dead workers

use tracing::{info, warn};

use super::ownership::OwnershipDirectory;
use crate::coordination::keys;

/// Result of [`OwnershipDirectory::attempt_reclaim`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimOutcome {
    /// This worker now owns the session
    Reclaimed,
    /// The owner's heartbeat is fresh; nothing was changed
    OwnerAlive,
    /// Another worker moved the record first
    LostRace {
        /// Owner after the race, if one is recorded
        owner: Option<String>,
    },
    /// The coordination store could not be reached
    Unavailable,
}

impl ReclaimOutcome {
    /// Whether the caller may now execute locally
    #[must_use]
    pub fn is_reclaimed(&self) -> bool {
        matches!(self, Self::Reclaimed)
    }
}

impl OwnershipDirectory {
    /// Take `session_id` over from `current_owner` if that worker is dead.
    ///
    /// A live owner is never displaced. The transfer is a compare-and-swap
    /// against `current_owner`, so of many concurrent reclaimers exactly one
    /// wins. The winner invalidates whatever connection it had bound to the
    /// session so the next acquire opens a fresh upstream session.
    pub async fn attempt_reclaim(&self, session_id: &str, current_owner: &str) -> ReclaimOutcome {
        match self.heartbeat.is_worker_healthy(current_owner).await {
            Ok(true) => {
                self.metrics.record_reclaim_failure();
                info!(session_id, owner = current_owner, "Reclaim refused, owner is alive");
                return ReclaimOutcome::OwnerAlive;
            }
            Ok(false) => {}
            Err(e) => {
                self.metrics.record_store_error();
                self.metrics.record_reclaim_failure();
                warn!(session_id, error = %e, "Reclaim aborted, liveness unknown");
                return ReclaimOutcome::Unavailable;
            }
        }

        let swapped = self
            .store
            .compare_and_swap(
                &keys::pool_owner(session_id),
                current_owner,
                &self.worker_id,
                self.ownership_ttl,
            )
            .await;

        match swapped {
            Ok(true) => {
                if let Some(key) = self.mapping(session_id) {
                    self.pools.invalidate_session(&key, session_id).await;
                }
                self.metrics.record_reclaim();
                info!(
                    session_id,
                    from = current_owner,
                    worker_id = %self.worker_id,
                    "Session ownership reclaimed"
                );
                ReclaimOutcome::Reclaimed
            }
            Ok(false) => {
                self.metrics.record_reclaim_failure();
                let owner = self.current_owner(session_id).await.ok().flatten();
                info!(session_id, owner = ?owner, "Reclaim lost to another worker");
                ReclaimOutcome::LostRace { owner }
            }
            Err(e) => {
                self.metrics.record_store_error();
                self.metrics.record_reclaim_failure();
                warn!(session_id, error = %e, "Reclaim failed");
                ReclaimOutcome::Unavailable
            }
        }
    }
}
