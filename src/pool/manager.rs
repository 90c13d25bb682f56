//! Pool manager: owns every pool of a worker
//!
//! The manager is an explicitly constructed object with an
//! [`init`](PoolManager::init) / [`shutdown`](PoolManager::shutdown)
//! lifecycle; it is shared as `Arc<PoolManager>` with whatever dispatches
//! requests.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::{Instant, interval_at};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::connection::ConnectionId;
use super::connection_pool::{ConnectionPool, Lease, PoolStatus};
use super::key::PoolKey;
use super::metrics::PoolStats;
use super::strategy::{PoolStrategy, StrategyRecommendation};
use crate::config::{PoolConfig, PoolSettings};
use crate::transport::TransportFactory;
use crate::{Error, Result};

/// Pool health score at or above which a pool counts as healthy
const HEALTHY_SCORE: f64 = 0.9;

/// Pool health score below which a pool counts as unhealthy
const UNHEALTHY_SCORE: f64 = 0.7;

/// Timeout share above which the monitor warns
const TIMEOUT_RATE_WARNING: f64 = 0.1;

/// Aggregate health across all pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every pool scores at least 0.9
    Healthy,
    /// Some pool scores in [0.7, 0.9)
    Degraded,
    /// Some pool scores below 0.7
    Unhealthy,
}

/// Classify a set of pool health scores
#[must_use]
pub fn global_health(scores: impl IntoIterator<Item = f64>) -> HealthStatus {
    let mut status = HealthStatus::Healthy;
    for score in scores {
        if score < UNHEALTHY_SCORE {
            return HealthStatus::Unhealthy;
        }
        if score < HEALTHY_SCORE {
            status = HealthStatus::Degraded;
        }
    }
    status
}

/// Stats for every pool plus the global verdict
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    /// Global pooling switch
    pub enabled: bool,
    /// Aggregate health
    pub global_status: HealthStatus,
    /// Number of pools
    pub total_pools: usize,
    /// Per-pool stats
    pub pools: Vec<PoolStats>,
}

/// Registry of pools keyed by [`PoolKey`]
pub struct PoolManager {
    settings: PoolSettings,
    factory: Arc<dyn TransportFactory>,
    pools: DashMap<PoolKey, Arc<ConnectionPool>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: TaskTracker,
}

impl PoolManager {
    /// Create a manager with no pools and no background tasks
    #[must_use]
    pub fn new(settings: PoolSettings, factory: Arc<dyn TransportFactory>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            settings,
            factory,
            pools: DashMap::new(),
            shutdown_tx,
            tasks: TaskTracker::new(),
        }
    }

    /// Start the monitoring and strategy-optimization loops
    pub fn init(self: &Arc<Self>) {
        self.spawn_periodic(self.settings.monitor_interval, "pool monitor", |manager| {
            async move { manager.monitor_pools() }.boxed()
        });
        self.spawn_periodic(self.settings.recommend_interval, "strategy optimizer", |manager| {
            async move {
                manager.optimize_strategies().await;
            }
            .boxed()
        });
        info!(
            enabled = self.settings.enabled,
            auto_adjust = self.settings.auto_adjust,
            "Pool manager started"
        );
    }

    fn spawn_periodic<F>(self: &Arc<Self>, period: Duration, name: &'static str, tick: F)
    where
        F: Fn(Arc<Self>) -> BoxFuture<'static, ()> + Send + 'static,
    {
        let manager: Weak<Self> = Arc::downgrade(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.tasks.spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        tick(manager).await;
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!(task = name, "Background task stopped");
        });
    }

    /// Stop background tasks and drain every pool
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let _ = self.shutdown_tx.send(());
        self.tasks.close();
        self.tasks.wait().await;

        let pools: Vec<_> = self.pools.iter().map(|e| Arc::clone(e.value())).collect();
        self.pools.clear();
        futures::future::join_all(pools.iter().map(|pool| pool.drain(drain_timeout))).await;
        info!(pools = pools.len(), "Pool manager shut down");
    }

    /// Global pooling switch
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Pool configuration used when a target has no override
    #[must_use]
    pub fn default_config(&self) -> PoolConfig {
        self.settings.defaults.clone()
    }

    /// Existing pool for `key`, or a new initialized one.
    ///
    /// With pooling disabled the pool is created with the `none` strategy.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid.
    pub async fn get_or_create_pool(&self, key: &PoolKey, config: PoolConfig) -> Result<Arc<ConnectionPool>> {
        if let Some(pool) = self.get_pool(key) {
            return Ok(pool);
        }

        config.validate()?;
        let mut config = config;
        if !self.settings.enabled {
            config.strategy = PoolStrategy::None;
        }

        let (pool, created) = match self.pools.entry(key.clone()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let pool = Arc::new(
                    ConnectionPool::new(key.clone(), config, Arc::clone(&self.factory))
                        .with_degraded_threshold(self.settings.degraded_threshold),
                );
                entry.insert(Arc::clone(&pool));
                (pool, true)
            }
        };

        if created {
            info!(pool = %key, "Created pool");
            pool.initialize().await;
        }
        Ok(pool)
    }

    /// Existing pool for `key`
    #[must_use]
    pub fn get_pool(&self, key: &PoolKey) -> Option<Arc<ConnectionPool>> {
        self.pools.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether a pool exists for `key`
    #[must_use]
    pub fn has_pool(&self, key: &PoolKey) -> bool {
        self.pools.contains_key(key)
    }

    /// Keys of every pool
    #[must_use]
    pub fn keys(&self) -> Vec<PoolKey> {
        self.pools.iter().map(|e| e.key().clone()).collect()
    }

    fn require(&self, key: &PoolKey) -> Result<Arc<ConnectionPool>> {
        self.get_pool(key)
            .ok_or_else(|| Error::PoolNotFound(key.to_string()))
    }

    /// Drain and discard the pool for `key`; false if there was none
    pub async fn remove_pool(&self, key: &PoolKey, drain_timeout: Duration) -> bool {
        let Some((_, pool)) = self.pools.remove(key) else {
            return false;
        };
        pool.drain(drain_timeout).await;
        info!(pool = %key, "Removed pool");
        true
    }

    /// Drain the pool for `key` and warm it up again with the same config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] if there is no such pool.
    pub async fn reset_pool(&self, key: &PoolKey, drain_timeout: Duration) -> Result<()> {
        self.require(key)?.reset(drain_timeout).await;
        Ok(())
    }

    /// Drain the pool for `key`, leaving it in place but inactive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] if there is no such pool.
    pub async fn drain_pool(&self, key: &PoolKey, drain_timeout: Duration) -> Result<PoolStatus> {
        let pool = self.require(key)?;
        pool.drain(drain_timeout).await;
        Ok(pool.status())
    }

    /// Apply an operator config change to the pool for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] or [`Error::Config`].
    pub async fn update_config(&self, key: &PoolKey, config: PoolConfig) -> Result<()> {
        let mut config = config;
        if !self.settings.enabled {
            config.strategy = PoolStrategy::None;
        }
        self.require(key)?.update_config(config).await
    }

    /// Acquire from the pool for `key`.
    ///
    /// # Errors
    ///
    /// [`Error::PoolNotFound`] plus everything [`ConnectionPool::acquire`] returns.
    pub async fn acquire(&self, key: &PoolKey, affinity_key: Option<&str>) -> Result<Lease> {
        self.require(key)?.acquire(affinity_key).await
    }

    /// Release into the pool for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolNotFound`] if there is no such pool.
    pub async fn release(
        &self,
        key: &PoolKey,
        id: ConnectionId,
        healthy: bool,
        error: Option<String>,
    ) -> Result<()> {
        self.require(key)?.release(id, healthy, error).await;
        Ok(())
    }

    /// Drop the connection bound to `session_id` in the pool for `key`
    pub async fn invalidate_session(&self, key: &PoolKey, session_id: &str) -> bool {
        match self.get_pool(key) {
            Some(pool) => pool.invalidate_affinity(session_id).await,
            None => false,
        }
    }

    /// Stats for every pool and the global verdict
    #[must_use]
    pub fn get_all_stats(&self) -> ManagerStats {
        let mut pools: Vec<PoolStats> = self.pools.iter().map(|e| e.value().get_stats()).collect();
        pools.sort_by(|a, b| a.key.cmp(&b.key));
        ManagerStats {
            enabled: self.settings.enabled,
            global_status: global_health(pools.iter().map(|p| p.health_score)),
            total_pools: pools.len(),
            pools,
        }
    }

    /// Aggregate health across all pools
    #[must_use]
    pub fn global_health(&self) -> HealthStatus {
        global_health(self.pools.iter().map(|e| e.value().health_score()))
    }

    /// One monitoring pass: refresh statuses and warn about trouble
    pub fn monitor_pools(&self) {
        for entry in &self.pools {
            let pool = entry.value();
            pool.refresh_status();
            let stats = pool.get_stats();
            if stats.unhealthy_connections > 0 {
                warn!(
                    pool = %stats.key,
                    unhealthy = stats.unhealthy_connections,
                    total = stats.total_connections,
                    "Pool has unhealthy connections"
                );
            }
            let timeout_rate = pool.metrics().timeout_rate();
            if timeout_rate > TIMEOUT_RATE_WARNING {
                warn!(
                    pool = %stats.key,
                    timeouts = stats.counters.timeouts,
                    acquisitions = stats.counters.acquisitions,
                    "High acquire timeout rate, consider raising max_size"
                );
            }
            debug!(
                pool = %stats.key,
                status = %stats.status,
                active = stats.active_connections,
                available = stats.available_connections,
                score = stats.health_score,
                "Pool status"
            );
        }
    }

    /// Compute recommendations for every pool; applies them when `auto_adjust` is on
    pub async fn optimize_strategies(&self) -> Vec<(PoolKey, StrategyRecommendation)> {
        let pools: Vec<_> = self.pools.iter().map(|e| Arc::clone(e.value())).collect();
        let mut recommendations = Vec::with_capacity(pools.len());

        for pool in pools {
            let recommendation = pool.get_strategy_recommendation();
            if recommendation.should_change() {
                info!(
                    pool = %pool.key(),
                    current = %recommendation.current,
                    recommended = %recommendation.recommended,
                    "Strategy recommendation"
                );
                if self.settings.auto_adjust && self.settings.enabled {
                    let mut config = pool.config();
                    config.strategy = recommendation.recommended;
                    if let Err(e) = pool.update_config(config).await {
                        warn!(pool = %pool.key(), error = %e, "Failed to apply recommended strategy");
                    }
                }
            }
            recommendations.push((pool.key().clone(), recommendation));
        }
        recommendations
    }
}
