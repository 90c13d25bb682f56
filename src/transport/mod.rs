//! Upstream transports consumed by the connection pool
//!
//! The pool only depends on [`UpstreamTransport`]; concrete transports are
//! produced by a [`TransportFactory`] keyed on the pool's target.

mod http;
mod stdio;
mod websocket;

pub use self::http::HttpUpstream;
pub use self::stdio::StdioUpstream;
pub use self::websocket::WebSocketUpstream;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::{BackendConfig, Config, TransportConfig};
use crate::pool::PoolKey;
use crate::protocol::request_id;
use crate::{Error, Result};

/// Kind of upstream transport, part of every pool key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Long-lived server-sent-events stream
    Sse,
    /// Socket-based (websocket)
    WebSocket,
    /// Subprocess speaking over stdio
    Stdio,
    /// Request/response HTTP
    StreamableHttp,
}

impl TransportKind {
    /// Streaming kinds are forwarded over pub/sub, the rest by direct RPC
    #[must_use]
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Sse | Self::WebSocket)
    }

    /// Stable name used in pool keys
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::WebSocket => "websocket",
            Self::Stdio => "stdio",
            Self::StreamableHttp => "streamable_http",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract every upstream transport implements
#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    /// Establish the upstream session
    async fn connect(&self) -> Result<()>;

    /// Liveness check, used for pre-ping
    async fn is_connected(&self) -> bool;

    /// Send one message and wait for the upstream reply
    async fn request(&self, message: Value) -> Result<Value>;

    /// Tear the upstream session down
    async fn close(&self) -> Result<()>;
}

/// Creates unconnected transports for a pool key
pub trait TransportFactory: Send + Sync {
    /// Build a transport for `key`; the pool calls `connect()` on it
    fn create(&self, key: &PoolKey) -> Result<Arc<dyn UpstreamTransport>>;
}

/// Factory that builds transports from configured backends
pub struct ConfigTransportFactory {
    /// Backends indexed by upstream address
    backends: HashMap<String, BackendConfig>,
}

impl ConfigTransportFactory {
    /// Index the enabled backends of `config`
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let backends = config
            .enabled_backends()
            .map(|(_, b)| (b.transport.address().to_string(), b.clone()))
            .collect();
        Self { backends }
    }
}

impl TransportFactory for ConfigTransportFactory {
    fn create(&self, key: &PoolKey) -> Result<Arc<dyn UpstreamTransport>> {
        let backend = self
            .backends
            .get(&key.address)
            .ok_or_else(|| Error::TargetNotFound(key.address.clone()))?;

        let transport: Arc<dyn UpstreamTransport> = match (&backend.transport, key.transport) {
            (TransportConfig::Stdio { command, cwd }, _) => {
                StdioUpstream::new(command, backend.env.clone(), cwd.clone())
            }
            (TransportConfig::Http { http_url, .. }, TransportKind::WebSocket) => {
                WebSocketUpstream::new(http_url)
            }
            (TransportConfig::Http { http_url, streamable_http }, _) => HttpUpstream::new(
                http_url,
                backend.headers.clone(),
                backend.timeout,
                *streamable_http,
            )?,
        };
        Ok(transport)
    }
}

/// Requests waiting for an upstream reply, keyed by the id sent upstream
pub(crate) type PendingReplies = DashMap<String, oneshot::Sender<Value>>;

/// Hand a reply line to the request waiting on its id
pub(crate) fn route_reply(pending: &PendingReplies, line: &str) -> Result<()> {
    let message: Value = serde_json::from_str(line)?;
    if let Some(id) = request_id(&message) {
        if let Some((_, sender)) = pending.remove(&id.to_string()) {
            let _ = sender.send(message);
        }
    }
    Ok(())
}
