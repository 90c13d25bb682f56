//! Pool identity

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;
use crate::{Error, Result};

/// Group used when the target belongs to no upstream group
pub const DEFAULT_GROUP: &str = "default";

/// Isolation identity for unauthenticated callers
pub const ANONYMOUS: &str = "anonymous";

/// Deterministic identity of one logical pool.
///
/// Two keys that differ only in `identity` never share a connection: the
/// identity is an isolation boundary between callers of the same upstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PoolKey {
    /// Upstream target address (URL or command line)
    pub address: String,
    /// Transport used to reach the target
    pub transport: TransportKind,
    /// Upstream group or gateway identity
    pub group: String,
    /// Caller isolation identity
    pub identity: String,
}

impl PoolKey {
    /// Build a key, defaulting the group and identity
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        transport: TransportKind,
        group: Option<&str>,
        identity: Option<&str>,
    ) -> Self {
        Self {
            address: address.into(),
            transport,
            group: group.unwrap_or(DEFAULT_GROUP).to_string(),
            identity: identity.unwrap_or(ANONYMOUS).to_string(),
        }
    }

    /// Same target, different caller
    #[must_use]
    pub fn for_identity(&self, identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            ..self.clone()
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.address, self.transport, self.group, self.identity
        )
    }
}

impl FromStr for PoolKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // The address may itself contain '|', so split from the right
        let mut parts = s.rsplitn(4, '|');
        let identity = parts.next();
        let group = parts.next();
        let transport = parts.next();
        let address = parts.next();

        let (Some(address), Some(transport), Some(group), Some(identity)) =
            (address, transport, group, identity)
        else {
            return Err(Error::Config(format!("Malformed pool key: {s}")));
        };

        let transport = serde_json::from_value(serde_json::Value::String(transport.to_string()))
            .map_err(|_| Error::Config(format!("Unknown transport in pool key: {transport}")))?;

        Ok(Self {
            address: address.to_string(),
            transport,
            group: group.to_string(),
            identity: identity.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_defaults() {
        let key = PoolKey::new("http://a/mcp", TransportKind::Sse, None, None);
        assert_eq!(key.group, DEFAULT_GROUP);
        assert_eq!(key.identity, ANONYMOUS);
        assert_eq!(key.to_string(), "http://a/mcp|sse|default|anonymous");
    }

    #[test]
    fn test_identity_isolates_keys() {
        let alice = PoolKey::new("http://a/mcp", TransportKind::Sse, None, Some("alice"));
        let bob = alice.for_identity("bob");
        assert_ne!(alice, bob);
        assert_eq!(alice.address, bob.address);
    }

    #[test]
    fn test_parse_display_form() {
        let key = PoolKey::new(
            "npx -y server | tee",
            TransportKind::Stdio,
            Some("tools"),
            Some("u1"),
        );
        let parsed: PoolKey = key.to_string().parse().unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("no-separators".parse::<PoolKey>().is_err());
        assert!("a|carrier-pigeon|g|i".parse::<PoolKey>().is_err());
    }
}
