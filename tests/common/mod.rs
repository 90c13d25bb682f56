//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use mcp_session_pool::affinity::{AffinityMetrics, OwnershipDirectory, WorkerHeartbeat};
use mcp_session_pool::config::{AffinityConfig, PoolConfig, PoolSettings};
use mcp_session_pool::coordination::{CoordinationStore, MemoryStore};
use mcp_session_pool::pool::{ConnectionPool, PoolKey, PoolManager, PoolStrategy};
use mcp_session_pool::transport::{TransportFactory, TransportKind, UpstreamTransport};
use mcp_session_pool::{Error, Result};

/// Knobs and counters shared by every transport a [`ScriptedFactory`] creates
#[derive(Default)]
pub struct Script {
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
    pub requests: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_ping: AtomicBool,
    pub fail_request: AtomicBool,
    /// Milliseconds every request takes
    pub request_delay_ms: AtomicU64,
}

impl Script {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Transport that echoes requests back as results
pub struct ScriptedTransport {
    script: Arc<Script>,
}

#[async_trait]
impl UpstreamTransport for ScriptedTransport {
    async fn connect(&self) -> Result<()> {
        if self.script.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".to_string()));
        }
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.script.fail_ping.load(Ordering::SeqCst)
    }

    async fn request(&self, message: Value) -> Result<Value> {
        self.script.requests.fetch_add(1, Ordering::SeqCst);
        let delay = self.script.request_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.script.fail_request.load(Ordering::SeqCst) {
            return Err(Error::Transport("broken pipe".to_string()));
        }
        Ok(json!({
            "jsonrpc": "2.0",
            "id": message.get("id").cloned().unwrap_or(Value::Null),
            "result": {"echo": message},
        }))
    }

    async fn close(&self) -> Result<()> {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`ScriptedTransport`]s bound to one script
#[derive(Default)]
pub struct ScriptedFactory {
    pub script: Arc<Script>,
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, _key: &PoolKey) -> Result<Arc<dyn UpstreamTransport>> {
        Ok(Arc::new(ScriptedTransport {
            script: Arc::clone(&self.script),
        }))
    }
}

pub fn key() -> PoolKey {
    PoolKey::new(
        "http://upstream.test/mcp",
        TransportKind::StreamableHttp,
        None,
        None,
    )
}

pub fn config(strategy: PoolStrategy, min_size: usize, max_size: usize, timeout: Duration) -> PoolConfig {
    PoolConfig {
        strategy,
        min_size,
        max_size,
        acquire_timeout: timeout,
        ..PoolConfig::default()
    }
}

/// Initialized pool plus the script driving its transports
pub async fn pool(config: PoolConfig) -> (ConnectionPool, Arc<Script>) {
    let factory = ScriptedFactory::default();
    let script = Arc::clone(&factory.script);
    let pool = ConnectionPool::new(key(), config, Arc::new(factory));
    pool.initialize().await;
    (pool, script)
}

/// Ownership directory for `worker_id` sharing `store` with its peers
pub fn directory(store: &Arc<MemoryStore>, worker_id: &str) -> Arc<OwnershipDirectory> {
    directory_with_script(store, worker_id, Arc::default())
}

/// [`directory`] whose upstream transports follow `script`
pub fn directory_with_script(
    store: &Arc<MemoryStore>,
    worker_id: &str,
    script: Arc<Script>,
) -> Arc<OwnershipDirectory> {
    let store: Arc<dyn CoordinationStore> = Arc::clone(store) as _;
    let affinity = AffinityConfig {
        worker_id: Some(worker_id.to_string()),
        ..AffinityConfig::default()
    };
    let settings = PoolSettings {
        defaults: config(PoolStrategy::Sticky, 0, 4, Duration::from_secs(1)),
        ..PoolSettings::default()
    };
    let metrics = Arc::new(AffinityMetrics::new());
    let heartbeat = Arc::new(WorkerHeartbeat::new(
        Arc::clone(&store),
        &affinity,
        worker_id,
        format!("http://{worker_id}.test"),
        Arc::clone(&metrics),
    ));
    let pools = Arc::new(PoolManager::new(settings, Arc::new(ScriptedFactory { script })));
    Arc::new(OwnershipDirectory::new(store, &affinity, pools, heartbeat, metrics))
}
