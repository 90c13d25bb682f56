//! Selection strategies and the strategy recommendation heuristic
//!
//! Each [`PoolStrategy`] maps to a selection function through
//! [`PoolStrategy::selector`]; the pool calls it under its bookkeeping lock
//! with the currently available connections.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::connection::{ConnectionId, PooledConnection};
use crate::{Error, Result};

/// Failure rate above which `weighted` is recommended
const FAILURE_RATE_THRESHOLD: f64 = 0.1;

/// Average response time above which `least_connections` is recommended
const SLOW_RESPONSE_THRESHOLD: Duration = Duration::from_secs(1);

/// How a pool picks among its available connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// FIFO rotation through the available set
    #[default]
    RoundRobin,
    /// Lowest reuse count first
    LeastConnections,
    /// Reuse the connection bound to the caller's affinity key
    Sticky,
    /// Prefer connections that complete work fastest
    Weighted,
    /// No pooling: fresh connection per acquire, destroyed on release
    None,
}

/// Selection function: picks one of `available`, or none to force a new connection
pub type SelectFn = fn(&mut SelectorState, &[&PooledConnection], Option<&str>) -> Option<ConnectionId>;

impl PoolStrategy {
    /// Every strategy, in display order
    pub const ALL: [Self; 5] = [
        Self::RoundRobin,
        Self::LeastConnections,
        Self::Sticky,
        Self::Weighted,
        Self::None,
    ];

    /// Stable name used in config and on the management surface
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::Sticky => "sticky",
            Self::Weighted => "weighted",
            Self::None => "none",
        }
    }

    /// Human-readable description for operators
    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::RoundRobin => {
                "Distributes sessions evenly across all pool slots in circular order. Best for balanced workloads."
            }
            Self::LeastConnections => {
                "Routes to the slot with fewest active connections. Best for varying request durations."
            }
            Self::Sticky => {
                "Maintains user affinity to specific pool slots. Best for stateful sessions."
            }
            Self::Weighted => {
                "Routes based on server performance metrics and health. Best for heterogeneous servers."
            }
            Self::None => {
                "No pooling, creates direct connections. Use when pooling overhead exceeds benefits."
            }
        }
    }

    /// Whether connections outlive a single acquire/release cycle
    #[must_use]
    pub fn is_pooled(self) -> bool {
        self != Self::None
    }

    /// Selection function for this strategy
    #[must_use]
    pub fn selector(self) -> SelectFn {
        match self {
            Self::RoundRobin => select_round_robin,
            Self::LeastConnections => select_least_connections,
            Self::Sticky => select_sticky,
            Self::Weighted => select_weighted,
            Self::None => select_none,
        }
    }
}

impl fmt::Display for PoolStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == s)
            .ok_or_else(|| Error::Config(format!("Unknown pool strategy: {s}")))
    }
}

/// Mutable selection state owned by one pool
#[derive(Debug, Default)]
pub struct SelectorState {
    /// Round-robin position
    cursor: usize,
    /// Sticky bindings: affinity key to connection
    bindings: HashMap<String, ConnectionId>,
}

impl SelectorState {
    /// Connection currently bound to `affinity_key`
    #[must_use]
    pub fn binding(&self, affinity_key: &str) -> Option<ConnectionId> {
        self.bindings.get(affinity_key).copied()
    }

    /// Drop every binding that points at `id`
    pub fn forget(&mut self, id: ConnectionId) {
        self.bindings.retain(|_, bound| *bound != id);
    }

    /// Drop the binding for `affinity_key`
    pub fn unbind(&mut self, affinity_key: &str) -> Option<ConnectionId> {
        self.bindings.remove(affinity_key)
    }

    /// Number of sticky bindings
    #[must_use]
    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }
}

fn select_round_robin(
    state: &mut SelectorState,
    available: &[&PooledConnection],
    _affinity_key: Option<&str>,
) -> Option<ConnectionId> {
    if available.is_empty() {
        return None;
    }
    let index = state.cursor % available.len();
    state.cursor = state.cursor.wrapping_add(1);
    Some(available[index].id())
}

fn select_least_connections(
    _state: &mut SelectorState,
    available: &[&PooledConnection],
    _affinity_key: Option<&str>,
) -> Option<ConnectionId> {
    available
        .iter()
        .min_by_key(|conn| conn.reuse_count())
        .map(|conn| conn.id())
}

fn select_sticky(
    state: &mut SelectorState,
    available: &[&PooledConnection],
    affinity_key: Option<&str>,
) -> Option<ConnectionId> {
    let Some(affinity_key) = affinity_key else {
        return select_round_robin(state, available, None);
    };

    if let Some(bound) = state.binding(affinity_key) {
        if available.iter().any(|conn| conn.id() == bound) {
            return Some(bound);
        }
        // Bound connection is busy: serve from the rest, keep the binding
        return select_round_robin(state, available, None);
    }

    let chosen = select_round_robin(state, available, None)?;
    state.bindings.insert(affinity_key.to_string(), chosen);
    Some(chosen)
}

fn select_weighted(
    _state: &mut SelectorState,
    available: &[&PooledConnection],
    _affinity_key: Option<&str>,
) -> Option<ConnectionId> {
    available
        .iter()
        .min_by_key(|conn| conn.average_hold())
        .map(|conn| conn.id())
}

fn select_none(
    _state: &mut SelectorState,
    _available: &[&PooledConnection],
    _affinity_key: Option<&str>,
) -> Option<ConnectionId> {
    None
}

/// Inputs to [`recommend_strategy`]
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StrategySignals {
    /// Mean time a connection is held per request
    #[serde(with = "crate::config::humantime_serde")]
    pub avg_response_time: Duration,
    /// Fraction of recent checkouts that ended in failure
    pub failure_rate: f64,
    /// Whether the target keeps per-session state
    pub has_state: bool,
}

/// Advisory strategy for a target with the given signals
#[must_use]
pub fn recommend_strategy(signals: &StrategySignals) -> PoolStrategy {
    if signals.has_state {
        PoolStrategy::Sticky
    } else if signals.failure_rate > FAILURE_RATE_THRESHOLD {
        PoolStrategy::Weighted
    } else if signals.avg_response_time > SLOW_RESPONSE_THRESHOLD {
        PoolStrategy::LeastConnections
    } else {
        PoolStrategy::RoundRobin
    }
}

/// Recommendation returned to operators
#[derive(Debug, Clone, Serialize)]
pub struct StrategyRecommendation {
    /// Strategy in effect
    pub current: PoolStrategy,
    /// Suggested strategy
    pub recommended: PoolStrategy,
    /// Description of the suggested strategy
    pub description: &'static str,
    /// Signals the suggestion was based on
    pub signals: StrategySignals,
}

impl StrategyRecommendation {
    /// Build a recommendation from live signals
    #[must_use]
    pub fn new(current: PoolStrategy, signals: StrategySignals) -> Self {
        let recommended = recommend_strategy(&signals);
        Self {
            current,
            recommended,
            description: recommended.description(),
            signals,
        }
    }

    /// Whether the suggestion differs from the strategy in effect
    #[must_use]
    pub fn should_change(&self) -> bool {
        self.current != self.recommended
    }
}
