//! Request and reply envelopes, plus the two lookups routing needs

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::PROTOCOL_VERSION;

const VERSION_TAG: &str = "2.0";

fn version_tag() -> String {
    VERSION_TAG.to_owned()
}

/// Outbound call sent to an upstream by the gateway itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol tag, `"2.0"`
    #[serde(default = "version_tag")]
    pub jsonrpc: String,
    /// Correlates the upstream's reply
    pub id: RequestId,
    /// Upstream method, e.g. `initialize` or `ping`
    pub method: String,
    /// Method arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Request with the current protocol tag
    pub fn new(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: version_tag(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Handshake opening every upstream session this gateway creates
    #[must_use]
    pub fn initialize(id: RequestId) -> Self {
        let client = json!({
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        });
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": client,
        });
        Self::new(id, "initialize", Some(params))
    }
}

/// Reply produced locally when a message cannot be delivered upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol tag, `"2.0"`
    #[serde(default = "version_tag")]
    pub jsonrpc: String,
    /// `None` when the offending message had no readable id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    /// Present on success only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Present on failure only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Failure reply with no `data` payload
    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        let error = JsonRpcError {
            code,
            message: message.into(),
            data: None,
        };
        Self {
            jsonrpc: version_tag(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Error object of a failed reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric code, see `error::rpc_codes`
    pub code: i32,
    /// Human-readable summary
    pub message: String,
    /// Extra detail, never set by the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Ids are opaque: clients may use strings or integers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Textual id
    String(String),
    /// Integer id
    Number(i64),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(text) => f.write_str(text),
            Self::Number(n) => n.fmt(f),
        }
    }
}

/// Request id of a raw message, if it has one
#[must_use]
pub fn request_id(message: &Value) -> Option<RequestId> {
    message
        .get("id")
        .and_then(|id| serde_json::from_value(id.clone()).ok())
}

/// Name of the operation a message targets.
///
/// `tools/call` and `prompts/get` carry the operation in `params.name`,
/// `resources/read` in `params.uri`; anything else is routed by method.
#[must_use]
pub fn operation_name(message: &Value) -> Option<String> {
    let method = message.get("method")?.as_str()?;
    let params = message.get("params");
    let field = match method {
        "tools/call" | "prompts/get" => "name",
        "resources/read" => "uri",
        _ => return Some(method.to_string()),
    };
    params
        .and_then(|p| p.get(field))
        .and_then(Value::as_str)
        .map(str::to_string)
}
