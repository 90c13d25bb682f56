//! Operation → upstream target resolution

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::config::{Config, PoolConfig};
use crate::pool::PoolKey;
use crate::protocol::operation_name;
use crate::transport::TransportKind;

/// An upstream a message can be routed to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Target {
    /// Backend name from configuration
    pub backend: String,
    /// Upstream address
    pub address: String,
    /// Transport kind
    pub transport: TransportKind,
    /// Pool group
    pub group: Option<String>,
    /// Whether the upstream keeps per-session state
    pub stateful: bool,
    /// Pool override for this backend
    pub pool: Option<PoolConfig>,
}

impl Target {
    /// Pool key for this target on behalf of `identity`
    #[must_use]
    pub fn pool_key(&self, identity: Option<&str>) -> PoolKey {
        PoolKey::new(
            self.address.clone(),
            self.transport,
            self.group.as_deref(),
            identity,
        )
    }
}

/// Finds the upstream a message targets
pub trait TargetResolver: Send + Sync {
    /// Target for `message`, if any
    fn resolve(&self, message: &Value) -> Option<Target>;

    /// Every known target
    fn targets(&self) -> Vec<Target>;
}

/// Resolver built from the `backends` section.
///
/// Each backend lists the operations it serves; an entry ending in `*`
/// matches by prefix. With a single backend, unlisted operations go to it.
pub struct StaticResolver {
    exact: HashMap<String, usize>,
    prefixes: Vec<(String, usize)>,
    targets: Vec<Target>,
}

impl StaticResolver {
    /// Build from the enabled backends of `config`
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let mut backends: Vec<_> = config.enabled_backends().collect();
        backends.sort_by(|a, b| a.0.cmp(b.0));

        let mut exact = HashMap::new();
        let mut prefixes = Vec::new();
        let mut targets = Vec::with_capacity(backends.len());

        for (index, (name, backend)) in backends.into_iter().enumerate() {
            for operation in &backend.tools {
                match operation.strip_suffix('*') {
                    Some(prefix) => prefixes.push((prefix.to_string(), index)),
                    None => {
                        exact.insert(operation.clone(), index);
                    }
                }
            }
            targets.push(Target {
                backend: name.clone(),
                address: backend.transport.address().to_string(),
                transport: backend.transport.kind(),
                group: backend.group.clone(),
                stateful: backend.stateful,
                pool: backend.pool.clone(),
            });
        }
        // Longest prefix wins
        prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            exact,
            prefixes,
            targets,
        }
    }

    /// Target serving `operation`
    #[must_use]
    pub fn resolve_operation(&self, operation: &str) -> Option<&Target> {
        let index = self.exact.get(operation).copied().or_else(|| {
            self.prefixes
                .iter()
                .find(|(prefix, _)| operation.starts_with(prefix.as_str()))
                .map(|(_, index)| *index)
        });
        match index {
            Some(index) => self.targets.get(index),
            None if self.targets.len() == 1 => self.targets.first(),
            None => None,
        }
    }
}

impl TargetResolver for StaticResolver {
    fn resolve(&self, message: &Value) -> Option<Target> {
        let operation = operation_name(message)?;
        self.resolve_operation(&operation).cloned()
    }

    fn targets(&self) -> Vec<Target> {
        self.targets.clone()
    }
}
