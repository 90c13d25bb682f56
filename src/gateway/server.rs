//! Gateway worker lifecycle

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::dispatch::Dispatcher;
use super::forward::{ForwardingRelay, LocalExecutor};
use super::registry::LocalSessionRegistry;
use super::resolver::{StaticResolver, TargetResolver};
use super::router::{AppState, create_router};
use crate::affinity::{AffinityMetrics, OwnershipDirectory, WorkerHeartbeat};
use crate::config::Config;
use crate::coordination::{CoordinationStore, MemoryStore};
use crate::pool::PoolManager;
use crate::transport::ConfigTransportFactory;
use crate::{Error, Result};

/// Interval between expiry sweeps of the in-process store
const STORE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// One gateway worker
pub struct Gateway {
    config: Config,
    store: Arc<dyn CoordinationStore>,
    memory_store: Option<Arc<MemoryStore>>,
    pools: Arc<PoolManager>,
    heartbeat: Arc<WorkerHeartbeat>,
    directory: Arc<OwnershipDirectory>,
    relay: Arc<ForwardingRelay>,
    registry: Arc<LocalSessionRegistry>,
    dispatcher: Arc<Dispatcher>,
}

impl Gateway {
    /// Build a worker backed by the in-process coordination store.
    ///
    /// # Errors
    ///
    /// Returns an error if the forwarding client cannot be built.
    pub fn new(config: Config) -> Result<Self> {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn CoordinationStore> = Arc::clone(&memory) as _;
        let mut gateway = Self::with_store(config, store)?;
        gateway.memory_store = Some(memory);
        Ok(gateway)
    }

    /// Build a worker sharing `store` with its peers.
    ///
    /// # Errors
    ///
    /// Returns an error if the forwarding client cannot be built.
    pub fn with_store(config: Config, store: Arc<dyn CoordinationStore>) -> Result<Self> {
        let worker_id = config.affinity.resolve_worker_id();
        let metrics = Arc::new(AffinityMetrics::new());
        let factory = Arc::new(ConfigTransportFactory::from_config(&config));
        let pools = Arc::new(PoolManager::new(config.pool.clone(), factory));

        let heartbeat = Arc::new(WorkerHeartbeat::new(
            Arc::clone(&store),
            &config.affinity,
            worker_id,
            config.server.advertise_url(),
            Arc::clone(&metrics),
        ));
        let directory = Arc::new(OwnershipDirectory::new(
            Arc::clone(&store),
            &config.affinity,
            Arc::clone(&pools),
            Arc::clone(&heartbeat),
            Arc::clone(&metrics),
        ));
        let relay = Arc::new(ForwardingRelay::new(
            Arc::clone(&store),
            Arc::clone(&heartbeat),
            metrics,
            config.affinity.forward_timeout,
        )?);

        let resolver: Arc<dyn TargetResolver> = Arc::new(StaticResolver::from_config(&config));
        for target in resolver.targets() {
            info!(
                backend = %target.backend,
                address = %target.address,
                transport = %target.transport,
                stateful = target.stateful,
                "Registered backend"
            );
        }

        let registry = Arc::new(LocalSessionRegistry::new(
            Arc::clone(&store),
            Arc::clone(&directory),
            Arc::clone(&resolver),
            &config.registry,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&directory),
            resolver,
            Arc::clone(&relay),
        ));

        Ok(Self {
            config,
            store,
            memory_store: None,
            pools,
            heartbeat,
            directory,
            relay,
            registry,
            dispatcher,
        })
    }

    /// This worker's id
    #[must_use]
    pub fn worker_id(&self) -> &str {
        self.heartbeat.worker_id()
    }

    /// Coordination store shared with peers
    #[must_use]
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.store
    }

    /// Pool manager
    #[must_use]
    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    /// Request dispatcher
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bind the configured address and serve until a shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid or cannot be bound.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves, then drain.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP server fails.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        self.pools.init();
        if self.directory.is_enabled() {
            tasks.push(self.heartbeat.start(shutdown_tx.subscribe()));
            let executor: Arc<dyn LocalExecutor> = Arc::clone(&self.dispatcher) as _;
            tasks.push(self.relay.listen(executor, shutdown_tx.subscribe()));
        }
        tasks.push(self.registry.start(shutdown_tx.subscribe()));
        if let Some(memory) = &self.memory_store {
            tasks.push(spawn_purge(Arc::clone(memory), shutdown_tx.subscribe()));
        }

        let state = Arc::new(AppState {
            dispatcher: Arc::clone(&self.dispatcher),
            registry: Arc::clone(&self.registry),
            directory: Arc::clone(&self.directory),
            drain_timeout: self.config.server.shutdown_timeout,
        });
        let app = create_router(state);

        let local = listener.local_addr()?;
        info!("============================================================");
        info!("MCP SESSION POOL v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %local, worker_id = %self.worker_id(), "Listening");
        info!(
            pooling = self.pools.is_enabled(),
            affinity = self.directory.is_enabled(),
            advertise_url = %self.config.server.advertise_url(),
            "Worker ready"
        );
        info!("============================================================");

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Internal(e.to_string()));

        info!("Shutting down worker...");
        let _ = shutdown_tx.send(());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.pools.shutdown(self.config.server.shutdown_timeout).await;
        info!("Worker stopped");
        served
    }
}

fn spawn_purge(
    store: Arc<MemoryStore>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STORE_PURGE_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let purged = store.purge();
                    if purged > 0 {
                        tracing::debug!(purged, "Purged expired coordination keys");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
