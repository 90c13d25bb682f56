//! Per-pool counters and rolling windows

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use telemetry_metrics::counter;

use super::connection_pool::PoolStatus;
use super::strategy::PoolStrategy;

/// Number of recent checkouts considered for error rate and response time
const WINDOW_CAPACITY: usize = 100;

/// Cumulative pool counters plus rolling windows
pub struct PoolMetrics {
    /// Label attached to exported counters
    label: String,
    acquisitions: AtomicU64,
    releases: AtomicU64,
    timeouts: AtomicU64,
    creates: AtomicU64,
    destroys: AtomicU64,
    connect_failures: AtomicU64,
    /// Total acquire wait, microseconds
    wait_total_us: AtomicU64,
    /// Recent checkout outcomes (true = healthy) and hold durations
    window: Mutex<OutcomeWindow>,
}

struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    holds: VecDeque<Duration>,
}

impl OutcomeWindow {
    fn push_outcome(&mut self, healthy: bool) {
        if self.outcomes.len() == WINDOW_CAPACITY {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(healthy);
    }

    fn push_hold(&mut self, held: Duration) {
        if self.holds.len() == WINDOW_CAPACITY {
            self.holds.pop_front();
        }
        self.holds.push_back(held);
    }
}

impl PoolMetrics {
    /// Create empty metrics for the pool labelled `label`
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            creates: AtomicU64::new(0),
            destroys: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
            wait_total_us: AtomicU64::new(0),
            window: Mutex::new(OutcomeWindow {
                outcomes: VecDeque::with_capacity(WINDOW_CAPACITY),
                holds: VecDeque::with_capacity(WINDOW_CAPACITY),
            }),
        }
    }

    /// A caller received a connection after waiting `waited`
    pub fn record_acquisition(&self, waited: Duration) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(waited.as_micros()).unwrap_or(u64::MAX);
        self.wait_total_us.fetch_add(micros, Ordering::Relaxed);
        counter!("mcp_pool_acquisitions_total", "pool" => self.label.clone()).increment(1);
    }

    /// A caller returned a connection it held for `held`
    pub fn record_release(&self, healthy: bool, held: Duration) {
        self.releases.fetch_add(1, Ordering::Relaxed);
        let mut window = self.window.lock();
        window.push_outcome(healthy);
        window.push_hold(held);
    }

    /// An acquire gave up at the timeout
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("mcp_pool_timeouts_total", "pool" => self.label.clone()).increment(1);
    }

    /// A connection was opened
    pub fn record_create(&self) {
        self.creates.fetch_add(1, Ordering::Relaxed);
        counter!("mcp_pool_creates_total", "pool" => self.label.clone()).increment(1);
    }

    /// `count` connections were destroyed
    pub fn record_destroy(&self, count: usize) {
        if count == 0 {
            return;
        }
        let count = count as u64;
        self.destroys.fetch_add(count, Ordering::Relaxed);
        counter!("mcp_pool_destroys_total", "pool" => self.label.clone()).increment(count);
    }

    /// A connect or pre-ping failed
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
        self.window.lock().push_outcome(false);
    }

    /// Fraction of failures among recent outcomes
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn recent_error_rate(&self) -> f64 {
        let window = self.window.lock();
        if window.outcomes.is_empty() {
            return 0.0;
        }
        let failures = window.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / window.outcomes.len() as f64
    }

    /// Mean recent hold duration
    #[must_use]
    pub fn average_hold(&self) -> Duration {
        let window = self.window.lock();
        u32::try_from(window.holds.len())
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| window.holds.iter().sum::<Duration>() / n)
    }

    /// Mean acquire wait across all successful acquisitions
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average_wait_ms(&self) -> f64 {
        let acquisitions = self.acquisitions.load(Ordering::Relaxed);
        if acquisitions == 0 {
            return 0.0;
        }
        self.wait_total_us.load(Ordering::Relaxed) as f64 / acquisitions as f64 / 1000.0
    }

    /// Counter values, used to fill a [`PoolStats`]
    #[must_use]
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            destroys: self.destroys.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }

    /// Fraction of acquire attempts that timed out
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn timeout_rate(&self) -> f64 {
        let counters = self.counters();
        let attempts = counters.acquisitions + counters.timeouts;
        if attempts == 0 {
            0.0
        } else {
            counters.timeouts as f64 / attempts as f64
        }
    }
}

/// Cumulative counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    /// Successful acquisitions
    pub acquisitions: u64,
    /// Releases
    pub releases: u64,
    /// Acquisitions that timed out
    pub timeouts: u64,
    /// Connections opened
    pub creates: u64,
    /// Connections destroyed
    pub destroys: u64,
    /// Failed connects and pre-pings
    pub connect_failures: u64,
}

/// Point-in-time view of one pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    /// Pool key, display form
    pub key: String,
    /// Lifecycle status
    pub status: PoolStatus,
    /// Strategy in effect
    pub strategy: PoolStrategy,
    /// Configured floor
    pub min_size: usize,
    /// Configured ceiling
    pub max_size: usize,
    /// Connections held (including ones being created)
    pub total_connections: usize,
    /// Checked out
    pub active_connections: usize,
    /// Idle and healthy
    pub available_connections: usize,
    /// Marked unhealthy, awaiting destruction
    pub unhealthy_connections: usize,
    /// Connections being opened
    pub pending_creates: usize,
    /// Sticky bindings held
    pub sticky_bindings: usize,
    /// Cumulative counters
    #[serde(flatten)]
    pub counters: PoolCounters,
    /// Mean acquire wait
    pub avg_wait_ms: f64,
    /// Mean age of live connections
    pub avg_connection_age_secs: f64,
    /// Recent checkout failure fraction
    pub recent_error_rate: f64,
    /// healthy/total penalized by recent error rate
    pub health_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rate_window() {
        let metrics = PoolMetrics::new("p");
        assert!(metrics.recent_error_rate().abs() < f64::EPSILON);

        for _ in 0..3 {
            metrics.record_release(true, Duration::from_millis(10));
        }
        metrics.record_release(false, Duration::from_millis(10));
        assert!((metrics.recent_error_rate() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_is_bounded() {
        let metrics = PoolMetrics::new("p");
        metrics.record_release(false, Duration::ZERO);
        for _ in 0..WINDOW_CAPACITY {
            metrics.record_release(true, Duration::ZERO);
        }
        assert!(metrics.recent_error_rate().abs() < f64::EPSILON);
        assert_eq!(metrics.counters().releases, WINDOW_CAPACITY as u64 + 1);
    }

    #[test]
    fn test_average_hold_and_wait() {
        let metrics = PoolMetrics::new("p");
        metrics.record_release(true, Duration::from_millis(100));
        metrics.record_release(true, Duration::from_millis(300));
        assert_eq!(metrics.average_hold(), Duration::from_millis(200));

        metrics.record_acquisition(Duration::from_millis(2));
        metrics.record_acquisition(Duration::from_millis(4));
        assert!((metrics.average_wait_ms() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_timeout_rate() {
        let metrics = PoolMetrics::new("p");
        for _ in 0..9 {
            metrics.record_acquisition(Duration::ZERO);
        }
        metrics.record_timeout();
        assert!((metrics.timeout_rate() - 0.1).abs() < 1e-9);
    }
}
