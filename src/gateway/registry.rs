//! Local session registry
//!
//! Tracks the client sessions terminated on this worker (open streams).
//! [`LocalSessionRegistry::broadcast`] is where a client message enters the
//! worker: the message's target is resolved and its pool key pre-registered
//! before it is handed to the session, so the first acquire already has
//! affinity. A periodic cleanup drops dead sessions and refreshes the
//! durable session records of live ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::resolver::TargetResolver;
use crate::affinity::OwnershipDirectory;
use crate::config::RegistryConfig;
use crate::coordination::{CoordinationStore, keys};
use crate::{Error, Result};

/// Client-facing side of a locally terminated session
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Whether the client is still attached
    fn is_connected(&self) -> bool;

    /// Hand a message to the session
    async fn send(&self, message: Value) -> Result<()>;
}

/// [`SessionTransport`] backed by an mpsc channel
pub struct ChannelTransport {
    tx: mpsc::Sender<Value>,
}

impl ChannelTransport {
    /// Create a transport and the receiver the session task reads from
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    async fn send(&self, message: Value) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::Transport("session closed".to_string()))
    }
}

/// Outcome of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Sessions whose client had gone away
    pub disconnected: usize,
    /// Sessions whose durable record could not be refreshed
    pub expired: usize,
    /// Sessions refreshed
    pub refreshed: usize,
    /// Session → pool mappings dropped for sessions no longer served here
    pub unmapped: usize,
}

/// Sessions terminated on this worker
pub struct LocalSessionRegistry {
    sessions: DashMap<String, Arc<dyn SessionTransport>>,
    store: Arc<dyn CoordinationStore>,
    directory: Arc<OwnershipDirectory>,
    resolver: Arc<dyn TargetResolver>,
    session_ttl: Duration,
    cleanup_interval: Duration,
}

impl LocalSessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        directory: Arc<OwnershipDirectory>,
        resolver: Arc<dyn TargetResolver>,
        config: &RegistryConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            store,
            directory,
            resolver,
            session_ttl: config.session_ttl,
            cleanup_interval: config.cleanup_interval,
        }
    }

    /// Register a session and write its durable record
    pub async fn register(&self, session_id: &str, transport: Arc<dyn SessionTransport>) {
        self.sessions.insert(session_id.to_string(), transport);
        self.publish_count();

        let record = json!({
            "worker_id": self.directory.worker_id(),
            "created_at": chrono::Utc::now().to_rfc3339(),
        })
        .to_string();
        if let Err(e) = self
            .store
            .set_ex(&keys::session_record(session_id), &record, self.session_ttl)
            .await
        {
            self.directory.metrics().record_store_error();
            warn!(session_id, error = %e, "Failed to write session record");
        }
        info!(session_id, "Session registered");
    }

    /// Whether `session_id` is terminated here
    #[must_use]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Number of local sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Deliver a client message to a local session.
    ///
    /// The message's target is resolved and the session mapped to its pool
    /// key before delivery. Returns false if the session is not local.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] if the session has gone away.
    pub async fn broadcast(
        &self,
        session_id: &str,
        message: Value,
        identity: Option<&str>,
    ) -> Result<bool> {
        if let Some(target) = self.resolver.resolve(&message) {
            self.directory
                .register_mapping(session_id, &target.pool_key(identity));
        }

        let Some(transport) = self.sessions.get(session_id).map(|e| Arc::clone(e.value())) else {
            return Ok(false);
        };
        transport.send(message).await?;
        Ok(true)
    }

    /// Remove a session, giving up its ownership and durable record
    pub async fn remove(&self, session_id: &str) -> bool {
        if self.sessions.remove(session_id).is_none() {
            return false;
        }
        self.publish_count();
        self.directory.release_ownership(session_id).await;
        if let Err(e) = self.store.delete(&keys::session_record(session_id)).await {
            debug!(session_id, error = %e, "Failed to delete session record");
        }
        info!(session_id, "Session removed");
        true
    }

    fn publish_count(&self) {
        self.directory.heartbeat().set_local_sessions(self.sessions.len());
    }

    /// One cleanup pass.
    ///
    /// Dead sessions are dropped first, one by one. The durable records of
    /// the remaining sessions are then refreshed concurrently; any session
    /// whose refresh fails or finds no record is dropped on its own.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let dead: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| !e.value().is_connected())
            .map(|e| e.key().clone())
            .collect();
        for session_id in dead {
            if self.remove(&session_id).await {
                report.disconnected += 1;
            }
        }

        let live: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let refreshes = live.iter().map(|session_id| async move {
            let refreshed = self
                .store
                .expire(&keys::session_record(session_id), self.session_ttl)
                .await;
            (session_id, refreshed)
        });

        for (session_id, refreshed) in join_all(refreshes).await {
            match refreshed {
                Ok(true) => report.refreshed += 1,
                Ok(false) => {
                    debug!(session_id = %session_id, "Session record gone");
                    if self.remove(session_id).await {
                        report.expired += 1;
                    }
                }
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Session refresh failed");
                    if self.remove(session_id).await {
                        report.expired += 1;
                    }
                }
            }
        }

        report.unmapped = self
            .directory
            .prune_mappings(|session_id| self.sessions.contains_key(session_id))
            .await;

        if report.disconnected + report.expired + report.unmapped > 0 {
            info!(
                disconnected = report.disconnected,
                expired = report.expired,
                unmapped = report.unmapped,
                remaining = self.sessions.len(),
                "Session cleanup"
            );
        }
        report
    }

    /// Spawn the periodic cleanup loop
    pub fn start(self: &Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + registry.cleanup_interval;
            let mut interval = tokio::time::interval_at(start, registry.cleanup_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.cleanup().await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("Session cleanup stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::affinity::Ownership;
    use crate::config::{BackendConfig, Config, TransportConfig};
    use crate::coordination::MemoryStore;
    use crate::gateway::resolver::StaticResolver;
    use crate::transport::TransportKind;

    struct Flagged(AtomicBool);

    #[async_trait]
    impl SessionTransport for Flagged {
        fn is_connected(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
        async fn send(&self, _message: Value) -> Result<()> {
            Ok(())
        }
    }

    fn registry(store: &Arc<MemoryStore>) -> LocalSessionRegistry {
        let directory = Arc::new(crate::affinity::test_directory(store, "worker-a"));
        let mut config = Config::default();
        config.backends.insert(
            "search".to_string(),
            BackendConfig {
                transport: TransportConfig::Http {
                    http_url: "http://search".to_string(),
                    streamable_http: true,
                },
                tools: vec!["web_search".to_string()],
                ..BackendConfig::default()
            },
        );
        let resolver = Arc::new(StaticResolver::from_config(&config));
        let store: Arc<dyn CoordinationStore> = Arc::clone(store) as _;
        LocalSessionRegistry::new(store, directory, resolver, &RegistryConfig::default())
    }

    #[tokio::test]
    async fn test_broadcast_registers_mapping_before_delivery() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let (transport, mut rx) = ChannelTransport::new(4);
        registry.register("sess-1", Arc::new(transport)).await;

        let msg = json!({"method": "tools/call", "params": {"name": "web_search"}});
        assert!(registry.broadcast("sess-1", msg.clone(), None).await.unwrap());
        assert_eq!(rx.recv().await, Some(msg));
        let key = registry.directory.mapping("sess-1").unwrap();
        assert_eq!(key.address, "http://search");

        assert!(!registry.broadcast("sess-2", json!({}), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_cleanup_drops_dead_and_expired() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let live = Arc::new(Flagged(AtomicBool::new(true)));
        let dead = Arc::new(Flagged(AtomicBool::new(false)));
        let orphan = Arc::new(Flagged(AtomicBool::new(true)));
        registry.register("live", live).await;
        registry.register("dead", dead).await;
        registry.register("orphan", orphan).await;
        store.delete(&keys::session_record("orphan")).await.unwrap();

        let report = registry.cleanup().await;
        assert_eq!(
            report,
            CleanupReport {
                disconnected: 1,
                expired: 1,
                refreshed: 1,
                unmapped: 0,
            }
        );
        assert!(registry.contains("live"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_forgets_mappings_owned_elsewhere() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        let key = crate::pool::PoolKey::new("http://search", TransportKind::StreamableHttp, None, None);
        registry
            .register("local", Arc::new(Flagged(AtomicBool::new(true))))
            .await;
        for session_id in ["local", "mine", "theirs", "unowned"] {
            registry.directory.register_mapping(session_id, &key);
        }
        registry.directory.claim_ownership("mine").await;
        store
            .set_ex(&keys::pool_owner("theirs"), "worker-b", Duration::from_secs(60))
            .await
            .unwrap();

        let report = registry.cleanup().await;
        assert_eq!(report.unmapped, 2);
        assert!(registry.directory.mapping("local").is_some());
        assert!(registry.directory.mapping("mine").is_some());
        assert!(registry.directory.mapping("theirs").is_none());
        assert!(registry.directory.mapping("unowned").is_none());
    }

    #[tokio::test]
    async fn test_store_outage_drops_sessions_without_aborting() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        registry
            .register("a", Arc::new(Flagged(AtomicBool::new(true))))
            .await;
        registry
            .register("b", Arc::new(Flagged(AtomicBool::new(true))))
            .await;
        store.set_available(false);

        let report = registry.cleanup().await;
        assert_eq!(report.expired, 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_releases_ownership() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry(&store);
        registry
            .register("sess-1", Arc::new(Flagged(AtomicBool::new(true))))
            .await;
        assert_eq!(
            registry.directory.claim_ownership("sess-1").await,
            Ownership::Owned
        );

        assert!(registry.remove("sess-1").await);
        assert_eq!(registry.directory.current_owner("sess-1").await.unwrap(), None);
        assert!(!registry.remove("sess-1").await);
    }
}
