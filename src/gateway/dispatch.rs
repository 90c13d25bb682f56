//! Request dispatch: resolve, claim, then execute locally or forward
//!
//! Every fallback ends in one of three places: a local execution, a
//! response relayed from the owner, or a typed error once forwarding and
//! exactly one reclaim attempt have both failed.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::forward::{ForwardEnvelope, ForwardingRelay, LocalExecutor};
use super::resolver::{Target, TargetResolver};
use crate::affinity::{Ownership, OwnershipDirectory, ReclaimOutcome};
use crate::pool::PoolKey;
use crate::protocol::{JsonRpcResponse, RequestId, operation_name, request_id};
use crate::{Error, Result};

/// Routes client messages to a pooled upstream connection
pub struct Dispatcher {
    directory: Arc<OwnershipDirectory>,
    resolver: Arc<dyn TargetResolver>,
    relay: Arc<ForwardingRelay>,
}

impl Dispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(
        directory: Arc<OwnershipDirectory>,
        resolver: Arc<dyn TargetResolver>,
        relay: Arc<ForwardingRelay>,
    ) -> Self {
        Self {
            directory,
            resolver,
            relay,
        }
    }

    /// Ownership directory used for claims
    #[must_use]
    pub fn directory(&self) -> &Arc<OwnershipDirectory> {
        &self.directory
    }

    /// Dispatch one client message and return the upstream response.
    ///
    /// Without a session id the message is independent and runs locally.
    ///
    /// # Errors
    ///
    /// [`Error::TargetNotFound`] for unroutable messages, pool errors from
    /// local execution, or the forwarding error once reclaim also failed.
    #[tracing::instrument(skip(self, message), fields(backend = tracing::field::Empty))]
    pub async fn dispatch(
        &self,
        session_id: Option<&str>,
        identity: Option<&str>,
        message: Value,
    ) -> Result<Value> {
        let target = self.resolve(&message)?;
        tracing::Span::current().record("backend", target.backend.as_str());
        let key = self.prepare_pool(&target, identity).await?;

        let Some(session_id) = session_id else {
            return self.execute_local(None, &key, message).await;
        };
        self.directory.register_mapping(session_id, &key);

        match self.directory.claim_ownership(session_id).await {
            Ownership::Owned | Ownership::Unknown => {
                self.execute_local(Some(session_id), &key, message).await
            }
            Ownership::OwnedBy(owner) => {
                self.forward_or_reclaim(session_id, identity, &owner, &target, &key, message)
                    .await
            }
        }
    }

    fn resolve(&self, message: &Value) -> Result<Target> {
        self.resolver.resolve(message).ok_or_else(|| {
            Error::TargetNotFound(operation_name(message).unwrap_or_else(|| "<none>".to_string()))
        })
    }

    async fn prepare_pool(&self, target: &Target, identity: Option<&str>) -> Result<PoolKey> {
        let key = target.pool_key(identity);
        let pools = self.directory.pools();
        let config = target.pool.clone().unwrap_or_else(|| pools.default_config());
        let pool = pools.get_or_create_pool(&key, config).await?;
        pool.set_stateful(target.stateful);
        Ok(key)
    }

    async fn forward_or_reclaim(
        &self,
        session_id: &str,
        identity: Option<&str>,
        owner: &str,
        target: &Target,
        key: &PoolKey,
        message: Value,
    ) -> Result<Value> {
        let failure = match self
            .relay
            .forward(owner, session_id, identity, target.transport, &message)
            .await
        {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        match self.directory.attempt_reclaim(session_id, owner).await {
            ReclaimOutcome::Reclaimed => self.execute_local(Some(session_id), key, message).await,
            ReclaimOutcome::LostRace { owner: Some(winner) } if winner == self.directory.worker_id() => {
                self.execute_local(Some(session_id), key, message).await
            }
            ReclaimOutcome::LostRace { owner: Some(winner) } => {
                debug!(session_id, owner = %winner, "Retrying forward to new owner");
                self.relay
                    .forward(&winner, session_id, identity, target.transport, &message)
                    .await
            }
            // The record vanished between claim and swap: the session is free again
            ReclaimOutcome::LostRace { owner: None } => {
                match self.directory.claim_ownership(session_id).await {
                    Ownership::Owned => self.execute_local(Some(session_id), key, message).await,
                    Ownership::OwnedBy(winner) if winner != owner => {
                        self.relay
                            .forward(&winner, session_id, identity, target.transport, &message)
                            .await
                    }
                    Ownership::OwnedBy(_) | Ownership::Unknown => {
                        warn!(session_id, owner, error = %failure, "Forward failed and session could not be claimed");
                        Err(failure)
                    }
                }
            }
            ReclaimOutcome::OwnerAlive | ReclaimOutcome::Unavailable => {
                warn!(session_id, owner, error = %failure, "Forward and reclaim both failed");
                Err(failure)
            }
        }
    }

    async fn execute_local(
        &self,
        session_id: Option<&str>,
        key: &PoolKey,
        message: Value,
    ) -> Result<Value> {
        let leased = self.directory.acquire_for_session(session_id, Some(key)).await?;
        let id = leased.lease.id();
        let Some(pool) = self.directory.pools().get_pool(&leased.key) else {
            return Err(Error::PoolNotFound(leased.key.to_string()));
        };
        // Dropping this future mid-request destroys the connection instead of stranding it
        let in_flight = pool.track(id);
        let result = leased.lease.request(message).await;
        match &result {
            Ok(_) => in_flight.finish(true, None).await,
            Err(e) => in_flight.finish(false, Some(e.to_string())).await,
        }

        match result {
            Ok(response) => {
                if let Some(session_id) = session_id {
                    self.directory.refresh_ownership(session_id).await;
                }
                Ok(response)
            }
            Err(e) => Err(Error::SessionUnhealthy(format!("{id}: {e}"))),
        }
    }
}

#[async_trait]
impl LocalExecutor for Dispatcher {
    async fn execute_forwarded(&self, envelope: ForwardEnvelope) -> Value {
        let id = request_id(&envelope.message);
        let result = self.serve_forwarded(&envelope).await;
        match result {
            Ok(response) => response,
            Err(e) => error_response(id, &e),
        }
    }
}

impl Dispatcher {
    async fn serve_forwarded(&self, envelope: &ForwardEnvelope) -> Result<Value> {
        let target = self.resolve(&envelope.message)?;
        let key = self.prepare_pool(&target, envelope.identity.as_deref()).await?;
        self.directory.register_mapping(&envelope.session_id, &key);

        match self.directory.claim_ownership(&envelope.session_id).await {
            Ownership::Owned | Ownership::Unknown => {
                self.execute_local(Some(&envelope.session_id), &key, envelope.message.clone())
                    .await
            }
            // Never relay a relayed request; the origin retries through its own path
            Ownership::OwnedBy(owner) => Err(Error::OwnershipConflict {
                session_id: envelope.session_id.clone(),
                owner,
            }),
        }
    }
}

/// JSON-RPC error response for `error`
#[must_use]
pub fn error_response(id: Option<RequestId>, error: &Error) -> Value {
    let response = JsonRpcResponse::error(id, error.to_rpc_code(), error.to_string());
    serde_json::to_value(response).unwrap_or(Value::Null)
}
