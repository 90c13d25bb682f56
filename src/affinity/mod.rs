//! Cross-worker session affinity
//!
//! A logical session is served by at most one pooled upstream connection at
//! a time, on the one worker that owns it. Ownership is recorded in the
//! coordination store, kept alive by heartbeats, and reclaimed from dead
//! workers by compare-and-swap. Store outages degrade to per-worker pooling
//! without affinity instead of failing requests.

mod heartbeat;
mod metrics;
mod ownership;
mod reclaim;

pub use heartbeat::{WorkerHeartbeat, WorkerMetadata};
pub use metrics::{AffinityMetrics, AffinitySnapshot};
pub use ownership::{AffinityLease, Ownership, OwnershipDirectory};
pub use reclaim::ReclaimOutcome;

#[cfg(test)]
pub(crate) use ownership::tests::{directory as test_directory, directory_over as test_directory_over};
