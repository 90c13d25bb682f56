//! MCP Session Pool
//!
//! Session pooling and cross-worker session affinity for a horizontally
//! scaled MCP gateway.
//!
//! # Features
//!
//! - **Connection pools**: one pool per target and identity, with
//!   round-robin, least-connections, sticky, weighted and unpooled strategies
//! - **Health**: pre-ping, lazy recycling, degraded/active scoring
//! - **Session affinity**: one owning worker per client session, recorded in
//!   a shared coordination store
//! - **Forwarding**: pub/sub relay for streaming sessions, direct HTTP relay
//!   for request/response sessions
//! - **Reclamation**: heartbeat-based failure detection with compare-and-swap
//!   ownership transfer
//! - **Graceful degradation**: coordination store outages fall back to
//!   per-worker pooling

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod affinity;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod gateway;
pub mod pool;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` overrides `level`; `format` selects `json` or text output.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
