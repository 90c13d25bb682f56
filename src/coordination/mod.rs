//! Shared coordination store used for cross-worker session affinity
//!
//! Any key-value store offering set-if-absent with TTL, TTL refresh and an
//! atomic compare-and-swap can back [`CoordinationStore`]. [`MemoryStore`]
//! is the in-process implementation for single-node deployments and tests.

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

/// Messages delivered to a subscriber, in publish order
pub type Subscription = BoxStream<'static, String>;

/// Atomic primitives the affinity layer relies on.
///
/// Every method fails with [`Error::CoordinationStoreUnavailable`] when the
/// store cannot be reached.
///
/// [`Error::CoordinationStoreUnavailable`]: crate::Error::CoordinationStoreUnavailable
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Current value of `key`, if set and not expired
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set `key` only if it is absent; true if this call set it
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Set `key` unconditionally
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Refresh the TTL of an existing key; false if it is absent
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remove `key`; true if it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically replace `expected` with `new` and refresh the TTL.
    ///
    /// Returns false without writing if the current value differs from
    /// `expected` or the key is absent.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Atomically remove `key` only if it holds `expected`
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;

    /// Publish to a channel; returns the number of subscribers reached
    async fn publish(&self, channel: &str, message: &str) -> Result<usize>;

    /// Subscribe to a channel
    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

/// Key schema shared by every worker
pub mod keys {
    use std::time::Duration;

    /// TTL of a session ownership record
    pub const OWNERSHIP_TTL: Duration = Duration::from_secs(3600);

    /// TTL of a worker heartbeat record
    pub const HEARTBEAT_TTL: Duration = Duration::from_secs(60);

    /// TTL of a worker metadata record
    pub const METADATA_TTL: Duration = Duration::from_secs(90);

    /// `pool_owner:{session_id}` holds the owning worker id
    #[must_use]
    pub fn pool_owner(session_id: &str) -> String {
        format!("pool_owner:{session_id}")
    }

    /// `worker_heartbeat:{worker_id}` holds the last-seen unix timestamp
    #[must_use]
    pub fn worker_heartbeat(worker_id: &str) -> String {
        format!("worker_heartbeat:{worker_id}")
    }

    /// `worker_metadata:{worker_id}` holds a JSON blob describing the worker
    #[must_use]
    pub fn worker_metadata(worker_id: &str) -> String {
        format!("worker_metadata:{worker_id}")
    }

    /// `mcp_session:{session_id}` marks a client session terminated on some worker
    #[must_use]
    pub fn session_record(session_id: &str) -> String {
        format!("mcp_session:{session_id}")
    }

    /// Channel a worker listens on for forwarded requests
    #[must_use]
    pub fn forward_channel(worker_id: &str) -> String {
        format!("worker_forward:{worker_id}")
    }

    /// Channel a forwarded request's reply is published on
    #[must_use]
    pub fn reply_channel(request_id: &str) -> String {
        format!("forward_reply:{request_id}")
    }
}
