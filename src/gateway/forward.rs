//! Forwarding relay between workers
//!
//! Streaming sessions are relayed over the coordination store's pub/sub:
//! the request goes out on `worker_forward:{owner}` and the reply comes back
//! on `forward_reply:{request_id}`. Request/response sessions are relayed by
//! POSTing to the owner's `/internal/forward` endpoint, whose base URL comes
//! from the owner's published metadata. Both paths are bounded by the
//! configured forward timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::affinity::{AffinityMetrics, WorkerHeartbeat};
use crate::coordination::{CoordinationStore, keys};
use crate::transport::TransportKind;
use crate::{Error, Result};

/// Pause before re-subscribing after the store refused a subscription
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(5);

/// Request relayed to the owning worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardEnvelope {
    /// Correlates the reply
    pub request_id: String,
    /// Session the request belongs to
    pub session_id: String,
    /// Caller identity used for the pool key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Worker that received the request
    pub origin: String,
    /// The client's message, untouched
    pub message: Value,
}

/// Reply to a [`ForwardEnvelope`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardReply {
    /// Request id of the envelope
    pub request_id: String,
    /// Response to hand back to the client
    pub response: Value,
}

/// Executes relayed requests on the owning worker
#[async_trait]
pub trait LocalExecutor: Send + Sync {
    /// Run a forwarded request locally and produce the client response
    async fn execute_forwarded(&self, envelope: ForwardEnvelope) -> Value;
}

/// Relays requests to the worker owning their session
pub struct ForwardingRelay {
    store: Arc<dyn CoordinationStore>,
    heartbeat: Arc<WorkerHeartbeat>,
    metrics: Arc<AffinityMetrics>,
    client: Client,
    timeout: Duration,
}

impl ForwardingRelay {
    /// Create a relay bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        heartbeat: Arc<WorkerHeartbeat>,
        metrics: Arc<AffinityMetrics>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| Error::Forwarding(e.to_string()))?;
        Ok(Self {
            store,
            heartbeat,
            metrics,
            client,
            timeout,
        })
    }

    /// This worker's id
    #[must_use]
    pub fn worker_id(&self) -> &str {
        self.heartbeat.worker_id()
    }

    /// Relay `message` to `owner` and wait for its response.
    ///
    /// # Errors
    ///
    /// [`Error::ForwardingTimeout`] if the owner does not answer in time,
    /// [`Error::Forwarding`] if it cannot be reached.
    #[tracing::instrument(skip(self, message), fields(worker_id = %self.worker_id()))]
    pub async fn forward(
        &self,
        owner: &str,
        session_id: &str,
        identity: Option<&str>,
        transport: TransportKind,
        message: &Value,
    ) -> Result<Value> {
        let envelope = ForwardEnvelope {
            request_id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            identity: identity.map(str::to_string),
            origin: self.worker_id().to_string(),
            message: message.clone(),
        };

        let result = if transport.is_streaming() {
            self.forward_pubsub(owner, &envelope).await
        } else {
            self.forward_direct(owner, &envelope).await
        };
        self.metrics.record_forward(result.is_ok());

        match &result {
            Ok(_) => debug!(owner, request_id = %envelope.request_id, "Forwarded"),
            Err(e) => warn!(owner, request_id = %envelope.request_id, error = %e, "Forward failed"),
        }
        result
    }

    async fn forward_pubsub(&self, owner: &str, envelope: &ForwardEnvelope) -> Result<Value> {
        // Subscribe before publishing so the reply cannot be missed
        let mut replies = self
            .store
            .subscribe(&keys::reply_channel(&envelope.request_id))
            .await
            .map_err(|e| Error::Forwarding(e.to_string()))?;

        let payload = serde_json::to_string(envelope)?;
        let reached = self
            .store
            .publish(&keys::forward_channel(owner), &payload)
            .await
            .map_err(|e| Error::Forwarding(e.to_string()))?;
        if reached == 0 {
            return Err(Error::Forwarding(format!("worker {owner} is not listening")));
        }

        let wait = async {
            while let Some(raw) = replies.next().await {
                match serde_json::from_str::<ForwardReply>(&raw) {
                    Ok(reply) if reply.request_id == envelope.request_id => {
                        return Some(reply.response);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "Ignoring malformed forward reply"),
                }
            }
            None
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(Error::Forwarding(format!(
                "reply channel for worker {owner} closed"
            ))),
            Err(_) => Err(Error::ForwardingTimeout(owner.to_string())),
        }
    }

    async fn forward_direct(&self, owner: &str, envelope: &ForwardEnvelope) -> Result<Value> {
        let metadata = self
            .heartbeat
            .worker_metadata(owner)
            .await
            .map_err(|e| Error::Forwarding(e.to_string()))?
            .ok_or_else(|| Error::Forwarding(format!("no metadata published by worker {owner}")))?;

        let url = format!(
            "{}/internal/forward",
            metadata.advertise_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .json(envelope)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::ForwardingTimeout(owner.to_string())
                } else {
                    Error::Forwarding(format!("{url}: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Forwarding(format!("worker {owner} answered {status}")));
        }

        let reply: ForwardReply = response.json().await.map_err(|e| {
            if e.is_timeout() {
                Error::ForwardingTimeout(owner.to_string())
            } else {
                Error::Forwarding(format!("invalid reply from worker {owner}: {e}"))
            }
        })?;
        Ok(reply.response)
    }

    /// Serve requests published on this worker's forward channel
    pub fn listen(
        self: &Arc<Self>,
        executor: Arc<dyn LocalExecutor>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let channel = keys::forward_channel(relay.worker_id());
            loop {
                let mut requests = match relay.store.subscribe(&channel).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Forward subscription failed");
                        tokio::select! {
                            () = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                            _ = shutdown_rx.recv() => break,
                        }
                    }
                };
                info!(channel = %channel, "Listening for forwarded requests");

                loop {
                    tokio::select! {
                        next = requests.next() => {
                            let Some(raw) = next else { break };
                            relay.spawn_reply(Arc::clone(&executor), raw);
                        }
                        _ = shutdown_rx.recv() => return,
                    }
                }
            }
        })
    }

    fn spawn_reply(self: &Arc<Self>, executor: Arc<dyn LocalExecutor>, raw: String) {
        let envelope: ForwardEnvelope = match serde_json::from_str(&raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping malformed forward envelope");
                return;
            }
        };
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let request_id = envelope.request_id.clone();
            let reply = ForwardReply {
                request_id: request_id.clone(),
                response: executor.execute_forwarded(envelope).await,
            };
            let published = match serde_json::to_string(&reply) {
                Ok(payload) => {
                    relay
                        .store
                        .publish(&keys::reply_channel(&request_id), &payload)
                        .await
                }
                Err(e) => Err(e.into()),
            };
            if let Err(e) = published {
                warn!(request_id = %request_id, error = %e, "Failed to publish forward reply");
            }
        });
    }
}
