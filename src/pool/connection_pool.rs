//! Connection pool for a single pool key
//!
//! Bookkeeping (available set, totals, sticky bindings) lives behind one
//! `parking_lot::Mutex` that is never held across an `.await`; connects,
//! pre-pings and closes run outside it. Callers waiting at `max_size` park
//! on a [`Notify`] that releases and destroys signal.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::connection::{ConnectionId, ConnectionInfo, PooledConnection};
use super::key::PoolKey;
use super::metrics::{PoolMetrics, PoolStats};
use super::strategy::{SelectorState, StrategyRecommendation, StrategySignals};
use crate::config::PoolConfig;
use crate::transport::{TransportFactory, UpstreamTransport};
use crate::{Error, Result};

/// Failed connects or pre-pings tolerated per acquire before giving up
const MAX_CONNECT_RETRIES: u32 = 1;

/// Default health score below which a pool is degraded
pub const DEFAULT_DEGRADED_THRESHOLD: f64 = 0.7;

/// Pool lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Created, not yet initialized
    Idle,
    /// Warming up to `min_size`
    Initializing,
    /// Serving
    Active,
    /// Serving with a health score below the threshold
    Degraded,
    /// Refusing new acquisitions, waiting for in-use connections
    Draining,
    /// Drained cleanly
    Inactive,
    /// Drained with connections force-destroyed
    Error,
}

impl PoolStatus {
    /// Whether `acquire` is accepted in this state
    #[must_use]
    pub fn accepts_acquire(self) -> bool {
        matches!(
            self,
            Self::Idle | Self::Initializing | Self::Active | Self::Degraded
        )
    }
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::Draining => "draining",
            Self::Inactive => "inactive",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// A checked-out connection.
///
/// Hand it back with [`ConnectionPool::release`]; dropping a lease does not
/// return the connection. Wrap long-running use in [`ConnectionPool::track`]
/// so a cancelled caller cannot strand it.
#[derive(Clone)]
pub struct Lease {
    id: ConnectionId,
    transport: Arc<dyn UpstreamTransport>,
}

impl Lease {
    /// Connection identity, passed back to `release`
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn UpstreamTransport> {
        &self.transport
    }

    /// Send one message over the leased connection
    pub async fn request(&self, message: Value) -> Result<Value> {
        self.transport.request(message).await
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("id", &self.id).finish()
    }
}

struct PoolState {
    status: PoolStatus,
    config: PoolConfig,
    connections: Vec<PooledConnection>,
    pending_creates: usize,
    selector: SelectorState,
}

impl PoolState {
    fn total(&self) -> usize {
        self.connections.len() + self.pending_creates
    }

    fn find_mut(&mut self, id: ConnectionId) -> Option<&mut PooledConnection> {
        self.connections.iter_mut().find(|c| c.id() == id)
    }

    fn remove(&mut self, id: ConnectionId) -> Option<PooledConnection> {
        let index = self.connections.iter().position(|c| c.id() == id)?;
        self.selector.forget(id);
        Some(self.connections.remove(index))
    }

    /// Remove every connection matching `predicate`
    fn take_where(&mut self, predicate: impl Fn(&PooledConnection) -> bool) -> Vec<PooledConnection> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.connections)
            .into_iter()
            .partition(|c| predicate(c));
        self.connections = kept;
        for conn in &taken {
            self.selector.forget(conn.id());
        }
        taken
    }
}

enum Step {
    Reuse {
        id: ConnectionId,
        transport: Arc<dyn UpstreamTransport>,
        pre_ping: bool,
    },
    Create,
    Wait,
}

/// Reusable connections to one upstream target for one isolation identity
pub struct ConnectionPool {
    key: PoolKey,
    label: String,
    factory: Arc<dyn TransportFactory>,
    state: Mutex<PoolState>,
    /// Signalled when a connection or a slot frees up
    released: Notify,
    /// Signalled whenever the in-use or pending count drops
    settled: Notify,
    metrics: PoolMetrics,
    degraded_threshold: f64,
    stateful: AtomicBool,
}

impl ConnectionPool {
    /// Create an uninitialized pool
    #[must_use]
    pub fn new(key: PoolKey, config: PoolConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let label = key.to_string();
        Self {
            metrics: PoolMetrics::new(label.clone()),
            key,
            label,
            factory,
            state: Mutex::new(PoolState {
                status: PoolStatus::Idle,
                config,
                connections: Vec::new(),
                pending_creates: 0,
                selector: SelectorState::default(),
            }),
            released: Notify::new(),
            settled: Notify::new(),
            degraded_threshold: DEFAULT_DEGRADED_THRESHOLD,
            stateful: AtomicBool::new(false),
        }
    }

    /// Override the degraded threshold
    #[must_use]
    pub fn with_degraded_threshold(mut self, threshold: f64) -> Self {
        self.degraded_threshold = threshold;
        self
    }

    /// Pool key
    #[must_use]
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Current lifecycle status
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.state.lock().status
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.state.lock().config.clone()
    }

    /// Whether the target keeps per-session state (feeds recommendations)
    pub fn set_stateful(&self, stateful: bool) {
        self.stateful.store(stateful, Ordering::Relaxed);
    }

    /// Warm the pool up to `min_size`.
    ///
    /// Connect failures are logged; the pool then starts under-sized and
    /// grows on demand. Calling this on a pool that is already running is
    /// a no-op.
    pub async fn initialize(&self) {
        let (missing, pooled) = {
            let mut state = self.state.lock();
            if !matches!(
                state.status,
                PoolStatus::Idle | PoolStatus::Inactive | PoolStatus::Error
            ) {
                return;
            }
            state.status = PoolStatus::Initializing;
            (
                state.config.min_size.saturating_sub(state.total()),
                state.config.strategy.is_pooled(),
            )
        };

        let mut warmed = 0;
        if pooled {
            warmed = self.replenish(missing).await;
        }

        {
            let mut state = self.state.lock();
            if state.status == PoolStatus::Initializing {
                state.status = PoolStatus::Active;
            }
        }
        info!(pool = %self.label, warmed, requested = missing, "Pool initialized");
    }

    /// Acquire a connection, waiting at most the configured `acquire_timeout`.
    ///
    /// `affinity_key` is consulted by the `sticky` strategy; other
    /// strategies ignore it.
    ///
    /// # Errors
    ///
    /// [`Error::AcquisitionTimeout`] when the pool stays saturated,
    /// [`Error::UpstreamConnect`] when connecting fails twice in a row,
    /// [`Error::PoolDraining`] when the pool no longer accepts acquisitions.
    pub async fn acquire(&self, affinity_key: Option<&str>) -> Result<Lease> {
        let timeout = self.state.lock().config.acquire_timeout;
        self.acquire_with_timeout(affinity_key, timeout).await
    }

    /// [`acquire`](Self::acquire) with an explicit timeout
    #[tracing::instrument(skip(self), fields(pool = %self.label))]
    pub async fn acquire_with_timeout(
        &self,
        affinity_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Lease> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, self.acquire_inner(affinity_key)).await {
            Ok(Ok(lease)) => {
                self.metrics.record_acquisition(started.elapsed());
                debug!(connection = %lease.id, "Connection acquired");
                Ok(lease)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.metrics.record_timeout();
                warn!(timeout = ?timeout, "Timed out waiting for a pooled connection");
                Err(Error::AcquisitionTimeout {
                    pool: self.label.clone(),
                    waited: started.elapsed(),
                })
            }
        }
    }

    async fn acquire_inner(&self, affinity_key: Option<&str>) -> Result<Lease> {
        let mut failures = 0;
        // Set once recycling or a failed pre-ping took the pool below min_size
        let mut shrunk = false;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (step, expired) = self.next_step(affinity_key)?;
            if !expired.is_empty() {
                debug!(pool = %self.label, count = expired.len(), "Recycling aged connections");
                self.discard(expired).await;
                shrunk = true;
            }

            match step {
                Step::Reuse {
                    id,
                    transport,
                    pre_ping,
                } => {
                    let checkout = CheckoutGuard { pool: self, id };
                    if pre_ping && !transport.is_connected().await {
                        checkout.disarm();
                        warn!(pool = %self.label, connection = %id, "Pre-ping failed, discarding connection");
                        self.metrics.record_connect_failure();
                        self.destroy(id).await;
                        shrunk = true;
                        failures += 1;
                        if failures > MAX_CONNECT_RETRIES {
                            self.top_up().await;
                            return Err(Error::UpstreamConnect {
                                pool: self.label.clone(),
                                message: "pre-ping failed".to_string(),
                            });
                        }
                        continue;
                    }
                    checkout.disarm();
                    return Ok(self.hand_out(Lease { id, transport }, shrunk).await);
                }
                Step::Create => {
                    let reservation = CreateReservation { pool: self };
                    match self.open().await {
                        Ok(transport) => {
                            reservation.disarm();
                            let lease = self.admit(transport, true).await?;
                            return Ok(self.hand_out(lease, shrunk).await);
                        }
                        Err(e) => {
                            drop(reservation);
                            failures += 1;
                            if failures > MAX_CONNECT_RETRIES {
                                return Err(e);
                            }
                        }
                    }
                }
                Step::Wait => notified.await,
            }
        }
    }

    /// Refill to `min_size` before handing `lease` out if this acquire shrank the pool
    async fn hand_out(&self, lease: Lease, shrunk: bool) -> Lease {
        if shrunk {
            let checkout = CheckoutGuard {
                pool: self,
                id: lease.id,
            };
            self.top_up().await;
            checkout.disarm();
        }
        lease
    }

    /// Open idle connections until `min_size` is met again
    async fn top_up(&self) -> usize {
        let missing = {
            let state = self.state.lock();
            if state.config.strategy.is_pooled() && state.status.accepts_acquire() {
                state.config.min_size.saturating_sub(state.total())
            } else {
                0
            }
        };
        if missing == 0 {
            return 0;
        }
        debug!(pool = %self.label, missing, "Topping pool back up to min_size");
        self.replenish(missing).await
    }

    /// Decide the next acquire step under the bookkeeping lock
    fn next_step(&self, affinity_key: Option<&str>) -> Result<(Step, Vec<PooledConnection>)> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.status.accepts_acquire() {
            return Err(Error::PoolDraining(self.label.clone()));
        }

        let strategy = state.config.strategy;
        let max_age = state.config.recycle_after();
        let expired = if strategy.is_pooled() {
            state.take_where(|c| c.is_available() && c.age() >= max_age)
        } else {
            Vec::new()
        };

        let available: Vec<&PooledConnection> =
            state.connections.iter().filter(|c| c.is_available()).collect();
        let chosen = (strategy.selector())(&mut state.selector, &available, affinity_key);

        if let Some(id) = chosen {
            let pre_ping = state.config.pre_ping;
            let conn = state
                .find_mut(id)
                .ok_or_else(|| Error::Internal(format!("selected unknown connection {id}")))?;
            conn.acquire()?;
            let transport = Arc::clone(conn.transport());
            return Ok((
                Step::Reuse {
                    id,
                    transport,
                    pre_ping,
                },
                expired,
            ));
        }

        if state.total() < state.config.max_size {
            state.pending_creates += 1;
            Ok((Step::Create, expired))
        } else {
            Ok((Step::Wait, expired))
        }
    }

    /// Create and connect a transport; no bookkeeping
    async fn open(&self) -> Result<Arc<dyn UpstreamTransport>> {
        let connect_error = |message: String| Error::UpstreamConnect {
            pool: self.label.clone(),
            message,
        };
        let transport = self
            .factory
            .create(&self.key)
            .map_err(|e| connect_error(e.to_string()))?;
        if let Err(e) = transport.connect().await {
            self.metrics.record_connect_failure();
            let _ = transport.close().await;
            warn!(pool = %self.label, error = %e, "Upstream connect failed");
            return Err(connect_error(e.to_string()));
        }
        self.metrics.record_create();
        Ok(transport)
    }

    /// Add a freshly opened connection whose slot was reserved
    async fn admit(&self, transport: Arc<dyn UpstreamTransport>, checked_out: bool) -> Result<Lease> {
        let admitted = {
            let mut state = self.state.lock();
            state.pending_creates -= 1;
            if state.status.accepts_acquire() {
                let mut conn = PooledConnection::new(Arc::clone(&transport));
                if checked_out {
                    conn.acquire()?;
                }
                let id = conn.id();
                state.connections.push(conn);
                Some(id)
            } else {
                None
            }
        };
        self.settled.notify_waiters();

        match admitted {
            Some(id) => {
                if !checked_out {
                    self.released.notify_one();
                }
                Ok(Lease { id, transport })
            }
            None => {
                let _ = transport.close().await;
                self.metrics.record_destroy(1);
                Err(Error::PoolDraining(self.label.clone()))
            }
        }
    }

    /// Open up to `count` idle connections; returns how many were added
    async fn replenish(&self, count: usize) -> usize {
        let mut added = 0;
        for _ in 0..count {
            let reservation = {
                let mut state = self.state.lock();
                if state.total() >= state.config.max_size || !state.status.accepts_acquire() {
                    break;
                }
                state.pending_creates += 1;
                CreateReservation { pool: self }
            };
            match self.open().await {
                Ok(transport) => {
                    reservation.disarm();
                    if self.admit(transport, false).await.is_ok() {
                        added += 1;
                    }
                }
                Err(e) => {
                    drop(reservation);
                    warn!(pool = %self.label, error = %e, "Failed to replenish connection");
                }
            }
        }
        added
    }

    /// Return a connection to the pool.
    ///
    /// Unhealthy connections are destroyed rather than returned, and the
    /// pool is topped back up to `min_size`. Under the `none` strategy, and
    /// while draining, every released connection is destroyed.
    pub async fn release(&self, id: ConnectionId, healthy: bool, error: Option<String>) {
        let (destroyed, replenish) = {
            let mut state = self.state.lock();
            let pooled = state.config.strategy.is_pooled();
            let accepting = state.status.accepts_acquire();
            let Some(conn) = state.find_mut(id) else {
                debug!(pool = %self.label, connection = %id, "Release of unknown connection ignored");
                return;
            };
            let held = conn.release();
            if !healthy {
                conn.mark_unhealthy(error.clone());
            }
            let keep = conn.is_healthy() && pooled && accepting;
            self.metrics.record_release(healthy, held);

            if keep {
                (None, 0)
            } else {
                let destroyed = state.remove(id);
                let replenish = if pooled && accepting {
                    state.config.min_size.saturating_sub(state.total())
                } else {
                    0
                };
                (destroyed, replenish)
            }
        };

        self.released.notify_one();
        self.settled.notify_waiters();

        if let Some(conn) = destroyed {
            if !healthy {
                warn!(
                    pool = %self.label,
                    connection = %id,
                    error = error.as_deref().unwrap_or("unknown"),
                    "Connection released unhealthy, destroying"
                );
            }
            self.discard(vec![conn]).await;
        }
        if replenish > 0 {
            self.replenish(replenish).await;
        }
        self.refresh_status();
    }

    /// Guard the use of a checked-out connection.
    ///
    /// Finish it with [`InFlight::finish`]. If it is dropped first (the
    /// caller was cancelled mid-request) the connection is treated as
    /// released unhealthy: it leaves the bookkeeping at once and is closed on
    /// the runtime.
    #[must_use]
    pub fn track(self: &Arc<Self>, id: ConnectionId) -> InFlight {
        InFlight {
            pool: Arc::clone(self),
            id,
            finished: false,
        }
    }

    /// Take an abandoned in-use connection out of the bookkeeping
    fn abandon(&self, id: ConnectionId) -> Option<PooledConnection> {
        let removed = {
            let mut state = self.state.lock();
            let conn = state.find_mut(id).filter(|c| c.in_use())?;
            let held = conn.release();
            conn.mark_unhealthy(Some("request cancelled".to_string()));
            self.metrics.record_release(false, held);
            state.remove(id)
        };
        self.released.notify_one();
        self.settled.notify_waiters();
        removed
    }

    /// Remove a connection and close it
    async fn destroy(&self, id: ConnectionId) {
        let removed = self.state.lock().remove(id);
        if let Some(conn) = removed {
            self.discard(vec![conn]).await;
        }
        self.released.notify_one();
        self.settled.notify_waiters();
    }

    /// Close connections already removed from the bookkeeping
    async fn discard(&self, connections: Vec<PooledConnection>) {
        self.metrics.record_destroy(connections.len());
        for conn in connections {
            if let Err(e) = conn.transport().close().await {
                debug!(pool = %self.label, connection = %conn.id(), error = %e, "Close failed");
            }
        }
    }

    /// Put a checked-out connection back without counting a release
    fn return_unused(&self, id: ConnectionId) {
        if let Some(conn) = self.state.lock().find_mut(id) {
            conn.release();
        }
        self.released.notify_one();
        self.settled.notify_waiters();
    }

    /// Invalidate a connection: idle ones are destroyed now, in-use ones at release
    pub async fn invalidate(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let Some(conn) = state.find_mut(id) else {
                return false;
            };
            if conn.in_use() {
                conn.mark_unhealthy(Some("invalidated".to_string()));
                state.selector.forget(id);
                None
            } else {
                state.remove(id)
            }
        };
        if let Some(conn) = removed {
            self.discard(vec![conn]).await;
            self.released.notify_one();
        }
        debug!(pool = %self.label, connection = %id, "Connection invalidated");
        true
    }

    /// Invalidate whatever connection is bound to `affinity_key`
    pub async fn invalidate_affinity(&self, affinity_key: &str) -> bool {
        let bound = self.state.lock().selector.unbind(affinity_key);
        match bound {
            Some(id) => self.invalidate(id).await,
            None => false,
        }
    }

    /// Stop accepting acquisitions and close every connection.
    ///
    /// Idle connections are closed immediately; in-use ones are destroyed as
    /// they are released, and whatever is still out after `timeout` is
    /// force-destroyed. Ends `Inactive`, or `Error` if anything was forced.
    #[tracing::instrument(skip(self), fields(pool = %self.label))]
    pub async fn drain(&self, timeout: Duration) {
        let idle = {
            let mut state = self.state.lock();
            state.status = PoolStatus::Draining;
            state.take_where(|c| !c.in_use())
        };
        self.released.notify_waiters();

        let idle_count = idle.len();
        self.discard(idle).await;

        let settled = tokio::time::timeout(timeout, self.wait_until_empty())
            .await
            .is_ok();
        let forced = if settled {
            Vec::new()
        } else {
            self.state.lock().take_where(|_| true)
        };
        let forced_count = forced.len();
        self.discard(forced).await;

        let status = {
            let mut state = self.state.lock();
            state.status = if forced_count > 0 {
                PoolStatus::Error
            } else {
                PoolStatus::Inactive
            };
            state.selector = SelectorState::default();
            state.status
        };

        if forced_count > 0 {
            warn!(idle = idle_count, forced = forced_count, "Pool drained, in-use connections force-destroyed");
        } else {
            info!(idle = idle_count, %status, "Pool drained");
        }
    }

    async fn wait_until_empty(&self) {
        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().total() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Immediate drain with no grace period
    pub async fn shutdown(&self) {
        self.drain(Duration::ZERO).await;
    }

    /// Drain, then warm up again with the same configuration
    pub async fn reset(&self, drain_timeout: Duration) {
        self.drain(drain_timeout).await;
        self.initialize().await;
    }

    /// Apply a new configuration live.
    ///
    /// Idle connections above the new `max_size` (or all of them when the
    /// strategy becomes `none`) are closed; the pool warms up to a raised
    /// `min_size`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub async fn update_config(&self, config: PoolConfig) -> Result<()> {
        config.validate()?;
        let (excess, missing) = {
            let mut state = self.state.lock();
            if state.config.strategy != config.strategy {
                state.selector = SelectorState::default();
            }
            state.config = config;

            let mut excess = Vec::new();
            if !state.config.strategy.is_pooled() {
                excess = state.take_where(|c| !c.in_use());
            } else {
                while state.total() > state.config.max_size {
                    let Some(id) = state.connections.iter().find(|c| !c.in_use()).map(PooledConnection::id) else {
                        break;
                    };
                    excess.extend(state.remove(id));
                }
            }
            let missing = if state.config.strategy.is_pooled() && state.status.accepts_acquire() {
                state.config.min_size.saturating_sub(state.total())
            } else {
                0
            };
            (excess, missing)
        };

        self.discard(excess).await;
        self.released.notify_waiters();
        if missing > 0 {
            self.replenish(missing).await;
        }
        info!(pool = %self.label, config = ?self.config(), "Pool configuration updated");
        Ok(())
    }

    /// healthy/total, penalized by the recent error rate
    #[must_use]
    pub fn health_score(&self) -> f64 {
        let state = self.state.lock();
        self.score(&state)
    }

    #[allow(clippy::cast_precision_loss)]
    fn score(&self, state: &PoolState) -> f64 {
        let total = state.connections.len();
        let ratio = if total == 0 {
            1.0
        } else {
            let healthy = state.connections.iter().filter(|c| c.is_healthy()).count();
            healthy as f64 / total as f64
        };
        ratio * (1.0 - self.metrics.recent_error_rate())
    }

    /// Re-evaluate `Active` versus `Degraded`
    pub fn refresh_status(&self) -> PoolStatus {
        let mut state = self.state.lock();
        let score = self.score(&state);
        match state.status {
            PoolStatus::Active if score < self.degraded_threshold => {
                state.status = PoolStatus::Degraded;
                warn!(pool = %self.label, score, "Pool degraded");
            }
            PoolStatus::Degraded if score >= self.degraded_threshold => {
                state.status = PoolStatus::Active;
                info!(pool = %self.label, score, "Pool recovered");
            }
            _ => {}
        }
        state.status
    }

    /// Snapshot of counts and counters
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn get_stats(&self) -> PoolStats {
        let state = self.state.lock();
        let active = state.connections.iter().filter(|c| c.in_use()).count();
        let available = state.connections.iter().filter(|c| c.is_available()).count();
        let unhealthy = state.connections.iter().filter(|c| !c.is_healthy()).count();
        let avg_age = if state.connections.is_empty() {
            0.0
        } else {
            state
                .connections
                .iter()
                .map(|c| c.age().as_secs_f64())
                .sum::<f64>()
                / state.connections.len() as f64
        };

        PoolStats {
            key: self.label.clone(),
            status: state.status,
            strategy: state.config.strategy,
            min_size: state.config.min_size,
            max_size: state.config.max_size,
            total_connections: state.total(),
            active_connections: active,
            available_connections: available,
            unhealthy_connections: unhealthy,
            pending_creates: state.pending_creates,
            sticky_bindings: state.selector.binding_count(),
            counters: self.metrics.counters(),
            avg_wait_ms: self.metrics.average_wait_ms(),
            avg_connection_age_secs: avg_age,
            recent_error_rate: self.metrics.recent_error_rate(),
            health_score: self.score(&state),
        }
    }

    /// Pool metrics
    #[must_use]
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Snapshot of one connection
    #[must_use]
    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.state.lock().connections.iter().find(|c| c.id() == id).map(PooledConnection::info)
    }

    /// Snapshot of every connection
    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.state.lock().connections.iter().map(PooledConnection::info).collect()
    }

    /// Connection bound to `affinity_key` under the `sticky` strategy
    #[must_use]
    pub fn sticky_binding(&self, affinity_key: &str) -> Option<ConnectionId> {
        self.state.lock().selector.binding(affinity_key)
    }

    /// Advisory strategy based on recent behaviour
    #[must_use]
    pub fn get_strategy_recommendation(&self) -> StrategyRecommendation {
        let current = self.state.lock().config.strategy;
        StrategyRecommendation::new(
            current,
            StrategySignals {
                avg_response_time: self.metrics.average_hold(),
                failure_rate: self.metrics.recent_error_rate(),
                has_state: self.stateful.load(Ordering::Relaxed),
            },
        )
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("key", &self.label)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Puts a selected connection back if the acquire is cancelled mid-ping
struct CheckoutGuard<'a> {
    pool: &'a ConnectionPool,
    id: ConnectionId,
}

impl CheckoutGuard<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for CheckoutGuard<'_> {
    fn drop(&mut self) {
        self.pool.return_unused(self.id);
    }
}

/// In-flight use of a pooled connection, see [`ConnectionPool::track`]
pub struct InFlight {
    pool: Arc<ConnectionPool>,
    id: ConnectionId,
    finished: bool,
}

impl InFlight {
    /// Connection being used
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Release the connection with the outcome of its use
    pub async fn finish(mut self, healthy: bool, error: Option<String>) {
        self.finished = true;
        self.pool.release(self.id, healthy, error).await;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let Some(conn) = self.pool.abandon(self.id) else {
            return;
        };
        warn!(pool = %self.pool.label, connection = %self.id, "Request cancelled mid-flight, destroying connection");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = Arc::clone(&self.pool);
                runtime.spawn(async move {
                    pool.discard(vec![conn]).await;
                    pool.top_up().await;
                    pool.refresh_status();
                });
            }
            Err(_) => self.pool.metrics.record_destroy(1),
        }
    }
}

/// Frees a reserved creation slot if the connect is cancelled or fails
struct CreateReservation<'a> {
    pool: &'a ConnectionPool,
}

impl CreateReservation<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for CreateReservation<'_> {
    fn drop(&mut self) {
        self.pool.state.lock().pending_creates -= 1;
        self.pool.released.notify_one();
        self.pool.settled.notify_waiters();
    }
}
