//! Error types for the session pool and affinity engine

use std::io;
use std::time::Duration;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Result type alias for the session pool
pub type Result<T> = std::result::Result<T, Error>;

/// Session pool errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pool saturated at `max_size` for longer than the acquire timeout
    #[error("Timed out after {waited:?} waiting for a connection from pool {pool}")]
    AcquisitionTimeout {
        /// Pool key
        pool: String,
        /// How long the caller waited
        waited: Duration,
    },

    /// Connection creation or pre-ping failed
    #[error("Upstream connect failed for pool {pool}: {message}")]
    UpstreamConnect {
        /// Pool key
        pool: String,
        /// Underlying failure
        message: String,
    },

    /// A connection failed while in use
    #[error("Session {0} is unhealthy")]
    SessionUnhealthy(String),

    /// Pool is draining or shut down and no longer hands out connections
    #[error("Pool {0} is draining")]
    PoolDraining(String),

    /// No pool exists for the key
    #[error("Pool not found: {0}")]
    PoolNotFound(String),

    /// The operation does not resolve to a known upstream
    #[error("No upstream target for operation: {0}")]
    TargetNotFound(String),

    /// A reclaim lost its compare-and-swap to another worker
    #[error("Session {session_id} is now owned by {owner}")]
    OwnershipConflict {
        /// Logical session id
        session_id: String,
        /// Worker that holds ownership now
        owner: String,
    },

    /// The owning worker did not answer in time
    #[error("Forwarding to worker {0} timed out")]
    ForwardingTimeout(String),

    /// The owning worker could not be reached
    #[error("Forwarding error: {0}")]
    Forwarding(String),

    /// The coordination store could not be reached
    #[error("Coordination store unavailable: {0}")]
    CoordinationStoreUnavailable(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether a client may retry the request unchanged
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquisitionTimeout { .. }
                | Self::UpstreamConnect { .. }
                | Self::ForwardingTimeout(_)
                | Self::OwnershipConflict { .. }
        )
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::TargetNotFound(_) => rpc_codes::METHOD_NOT_FOUND,
            Self::AcquisitionTimeout { .. } | Self::ForwardingTimeout(_) => rpc_codes::TIMEOUT,
            Self::UpstreamConnect { .. }
            | Self::SessionUnhealthy(_)
            | Self::PoolDraining(_)
            | Self::Forwarding(_)
            | Self::OwnershipConflict { .. }
            | Self::Transport(_) => rpc_codes::UNAVAILABLE,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// HTTP status for the management and forwarding surface
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PoolNotFound(_) | Self::TargetNotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_) | Self::Protocol(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::AcquisitionTimeout { .. } | Self::ForwardingTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            Self::OwnershipConflict { .. } => StatusCode::CONFLICT,
            Self::UpstreamConnect { .. }
            | Self::SessionUnhealthy(_)
            | Self::PoolDraining(_)
            | Self::Forwarding(_)
            | Self::Transport(_)
            | Self::CoordinationStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

/// JSON-RPC error codes used in client responses
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Upstream or owning worker unavailable
    pub const UNAVAILABLE: i32 = -32000;
    /// Timed out waiting for a connection or a forwarded reply
    pub const TIMEOUT: i32 = -32001;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let timeout = Error::AcquisitionTimeout {
            pool: "p".to_string(),
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_retryable());
        assert!(Error::ForwardingTimeout("w1".to_string()).is_retryable());
        assert!(!Error::PoolNotFound("p".to_string()).is_retryable());
        assert!(!Error::Config("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_rpc_codes() {
        assert_eq!(
            Error::TargetNotFound("x".to_string()).to_rpc_code(),
            rpc_codes::METHOD_NOT_FOUND
        );
        assert_eq!(
            Error::ForwardingTimeout("w".to_string()).to_rpc_code(),
            rpc_codes::TIMEOUT
        );
        assert_eq!(
            Error::Internal("boom".to_string()).to_rpc_code(),
            rpc_codes::INTERNAL_ERROR
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Error::PoolNotFound("k".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::OwnershipConflict {
                session_id: "s".to_string(),
                owner: "w".to_string()
            }
            .status_code(),
            StatusCode::CONFLICT
        );
    }
}
