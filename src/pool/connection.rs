//! A single pooled upstream connection and its bookkeeping

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

use crate::transport::UpstreamTransport;
use crate::{Error, Result};

/// Opaque connection identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One reusable upstream handle plus bookkeeping
pub struct PooledConnection {
    id: ConnectionId,
    transport: Arc<dyn UpstreamTransport>,
    created_at: Instant,
    last_used: Instant,
    reuse_count: u64,
    in_use: bool,
    healthy: bool,
    last_error: Option<String>,
    /// When the current checkout started
    checked_out_at: Option<Instant>,
    /// Sum of completed checkout durations
    total_hold: Duration,
}

impl PooledConnection {
    /// Wrap a connected transport
    #[must_use]
    pub fn new(transport: Arc<dyn UpstreamTransport>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            transport,
            created_at: now,
            last_used: now,
            reuse_count: 0,
            in_use: false,
            healthy: true,
            last_error: None,
            checked_out_at: None,
            total_hold: Duration::ZERO,
        }
    }

    /// Hand the connection to a caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the connection is already checked out;
    /// the pool never does this, so it indicates a bookkeeping bug.
    pub fn acquire(&mut self) -> Result<()> {
        if self.in_use {
            return Err(Error::Internal(format!(
                "connection {} acquired while in use",
                self.id
            )));
        }
        let now = Instant::now();
        self.in_use = true;
        self.reuse_count += 1;
        self.last_used = now;
        self.checked_out_at = Some(now);
        Ok(())
    }

    /// Return the connection; yields how long it was held
    pub fn release(&mut self) -> Duration {
        let now = Instant::now();
        let held = self
            .checked_out_at
            .take()
            .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
        self.in_use = false;
        self.last_used = now;
        self.total_hold += held;
        held
    }

    /// Record a failure; the pool will not hand this connection out again
    pub fn mark_unhealthy(&mut self, error: Option<String>) {
        self.healthy = false;
        self.last_error = error;
    }

    /// Clear a previous failure
    pub fn mark_healthy(&mut self) {
        self.healthy = true;
        self.last_error = None;
    }

    /// Connection identity
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn UpstreamTransport> {
        &self.transport
    }

    /// Number of times this connection was handed out
    #[must_use]
    pub fn reuse_count(&self) -> u64 {
        self.reuse_count
    }

    /// Whether a caller currently holds the connection
    #[must_use]
    pub fn in_use(&self) -> bool {
        self.in_use
    }

    /// Whether the connection may be handed out
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    /// Idle and healthy
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.healthy && !self.in_use
    }

    /// Last recorded failure
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Time since creation
    #[must_use]
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since last checkout or release
    #[must_use]
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Mean checkout duration, zero before the first release
    #[must_use]
    pub fn average_hold(&self) -> Duration {
        let completed = if self.in_use {
            self.reuse_count.saturating_sub(1)
        } else {
            self.reuse_count
        };
        u32::try_from(completed)
            .ok()
            .filter(|n| *n > 0)
            .map_or(Duration::ZERO, |n| self.total_hold / n)
    }

    /// Serializable view for the management surface
    #[must_use]
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            reuse_count: self.reuse_count,
            in_use: self.in_use,
            healthy: self.healthy,
            age_secs: self.age().as_secs_f64(),
            idle_secs: self.idle_time().as_secs_f64(),
            last_error: self.last_error.clone(),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("reuse_count", &self.reuse_count)
            .field("in_use", &self.in_use)
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a pooled connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    /// Connection identity
    pub id: ConnectionId,
    /// Times handed out
    pub reuse_count: u64,
    /// Checked out right now
    pub in_use: bool,
    /// Eligible for selection
    pub healthy: bool,
    /// Seconds since creation
    pub age_secs: f64,
    /// Seconds since last use
    pub idle_secs: f64,
    /// Last recorded failure
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Inert;

    #[async_trait]
    impl UpstreamTransport for Inert {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn is_connected(&self) -> bool {
            true
        }
        async fn request(&self, message: Value) -> Result<Value> {
            Ok(message)
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn connection() -> PooledConnection {
        PooledConnection::new(Arc::new(Inert))
    }

    #[test]
    fn test_acquire_is_exclusive() {
        let mut conn = connection();
        conn.acquire().unwrap();
        assert!(conn.acquire().is_err());
        assert_eq!(conn.reuse_count(), 1);
        conn.release();
        conn.acquire().unwrap();
        assert_eq!(conn.reuse_count(), 2);
    }

    #[test]
    fn test_info_serializes_id_as_uuid_string() {
        let conn = connection();
        let json = serde_json::to_value(conn.info()).unwrap();
        let id = json["id"].as_str().unwrap();
        assert_eq!(Uuid::parse_str(id).unwrap(), conn.id().0);
        assert_eq!(json["in_use"], false);
    }

    #[test]
    fn test_unhealthy_is_not_available() {
        let mut conn = connection();
        assert!(conn.is_available());
        conn.mark_unhealthy(Some("reset by peer".to_string()));
        assert!(!conn.is_available());
        assert_eq!(conn.last_error(), Some("reset by peer"));
        conn.mark_healthy();
        assert!(conn.is_available());
        assert_eq!(conn.last_error(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_time_tracking() {
        let mut conn = connection();
        conn.acquire().unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(conn.release(), Duration::from_millis(400));

        conn.acquire().unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        conn.release();

        assert_eq!(conn.average_hold(), Duration::from_millis(300));
        assert_eq!(conn.age(), Duration::from_millis(600));
    }
}
