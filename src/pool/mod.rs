//! Upstream session pooling
//!
//! One [`ConnectionPool`] per [`PoolKey`], selected among by a
//! [`PoolStrategy`] and owned by the worker's [`PoolManager`].

mod connection;
mod connection_pool;
mod key;
mod manager;
mod metrics;
mod strategy;

pub use connection::{ConnectionId, ConnectionInfo, PooledConnection};
pub use connection_pool::{ConnectionPool, DEFAULT_DEGRADED_THRESHOLD, InFlight, Lease, PoolStatus};
pub use key::{ANONYMOUS, DEFAULT_GROUP, PoolKey};
pub use manager::{HealthStatus, ManagerStats, PoolManager, global_health};
pub use metrics::{PoolCounters, PoolMetrics, PoolStats};
pub use strategy::{
    PoolStrategy, SelectFn, SelectorState, StrategyRecommendation, StrategySignals,
    recommend_strategy,
};

pub use crate::config::PoolConfig;
