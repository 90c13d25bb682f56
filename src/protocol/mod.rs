//! JSON-RPC envelope types
//!
//! The gateway does not interpret the proxied protocol beyond the envelope:
//! it reads the method and the operation name to pick an upstream, and
//! rewrites request ids when multiplexing a subprocess.

mod messages;

pub use messages::*;

/// MCP Protocol version announced to upstreams
pub const PROTOCOL_VERSION: &str = "2025-03-26";
