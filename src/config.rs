//! Gateway configuration: YAML file, then `MCP_POOL_*` environment overrides
//!
//! Nested keys use `__` in variable names, e.g.
//! `MCP_POOL_AFFINITY__HEARTBEAT_INTERVAL=10s`.

use std::{collections::HashMap, env, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::pool::PoolStrategy;
use crate::transport::TransportKind;
use crate::{Error, Result};

/// Prefix of environment overrides
const ENV_PREFIX: &str = "MCP_POOL_";

/// Top-level configuration of one gateway worker
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Dotenv files sourced before `${VAR}` placeholders are expanded.
    /// A leading `~` is the home directory; later files win.
    pub env_files: Vec<String>,
    /// Listener and shutdown settings
    pub server: ServerConfig,
    /// Pooling configuration
    pub pool: PoolSettings,
    /// Cross-worker affinity configuration
    pub affinity: AffinityConfig,
    /// Local session registry configuration
    pub registry: RegistryConfig,
    /// Upstream backends by name
    pub backends: HashMap<String, BackendConfig>,
}

impl Config {
    /// Read `path` (if given), apply environment overrides and validate
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file is missing or malformed, or
    /// when the merged result fails [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_layer = match path {
            Some(p) if !p.exists() => {
                return Err(Error::Config(format!("no config file at {}", p.display())));
            }
            Some(p) => Figment::from(Yaml::file(p)),
            None => Figment::new(),
        };

        let mut config: Self = file_layer
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.source_env_files();
        config.expand_placeholders();
        config.validate()?;
        Ok(config)
    }

    /// Check pool bounds and affinity timings
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.pool.defaults.validate()?;
        for (name, backend) in &self.backends {
            if let Some(pool) = &backend.pool {
                pool.validate()
                    .map_err(|e| Error::Config(format!("backend {name}: {e}")))?;
            }
        }
        let affinity = &self.affinity;
        let problem = if !(0.0..=1.0).contains(&self.pool.degraded_threshold) {
            Some("pool.degraded_threshold must be within 0.0..=1.0")
        } else if affinity.heartbeat_ttl <= affinity.heartbeat_interval {
            Some("affinity.heartbeat_ttl must exceed heartbeat_interval")
        } else if affinity.stale_threshold < affinity.heartbeat_ttl {
            Some("affinity.stale_threshold must be at least heartbeat_ttl")
        } else {
            None
        };
        problem.map_or(Ok(()), |msg| Err(Error::Config(msg.to_owned())))
    }

    /// Source each configured dotenv file into the process environment.
    /// Missing files are skipped.
    fn source_env_files(&self) {
        for raw in &self.env_files {
            let file = home_relative(raw);
            if !file.is_file() {
                tracing::debug!(path = %file.display(), "Skipping absent env file");
                continue;
            }
            if let Err(e) = dotenvy::from_path(&file) {
                tracing::warn!(path = %file.display(), error = %e, "Could not source env file");
            } else {
                tracing::info!(path = %file.display(), "Sourced env file");
            }
        }
    }

    /// Substitute `${VAR}` / `${VAR:-fallback}` in backend URLs and headers
    fn expand_placeholders(&mut self) {
        let Ok(placeholder) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };
        let substitute = |text: &str| {
            placeholder
                .replace_all(text, |c: &Captures| {
                    env::var(&c[1])
                        .unwrap_or_else(|_| c.get(2).map(|m| m.as_str().to_owned()).unwrap_or_default())
                })
                .into_owned()
        };

        for backend in self.backends.values_mut() {
            if let TransportConfig::Http { http_url, .. } = &mut backend.transport {
                *http_url = substitute(http_url);
            }
            backend
                .headers
                .values_mut()
                .for_each(|value| *value = substitute(value));
        }
    }

    /// Backends not switched off with `enabled: false`
    pub fn enabled_backends(&self) -> impl Iterator<Item = (&String, &BackendConfig)> {
        self.backends.iter().filter(|(_, b)| b.enabled)
    }
}

fn home_relative(raw: &str) -> PathBuf {
    match (raw.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(raw),
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,
    /// Bind port
    pub port: u16,
    /// URL other workers use to reach this one (defaults to `http://{host}:{port}`)
    pub advertise_url: Option<String>,
    /// Bound on one client request end to end
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long shutdown waits for in-flight work and pool drains
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl ServerConfig {
    /// Resolve the URL peers should use for direct forwarding
    #[must_use]
    pub fn advertise_url(&self) -> String {
        self.advertise_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 39410,
            advertise_url: None,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(15),
        }
    }
}

/// Per-pool configuration, also the operator-editable surface of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Selection strategy
    pub strategy: PoolStrategy,
    /// Connections created eagerly and kept as a floor
    pub min_size: usize,
    /// Hard ceiling on connections (in use + idle + being created)
    pub max_size: usize,
    /// How long `acquire` waits when the pool is saturated
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Connections older than this are replaced at next selection
    pub recycle_seconds: u64,
    /// Liveness-check a connection before handing it out
    pub pre_ping: bool,
}

impl PoolConfig {
    /// Maximum connection age before lazy recycling
    #[must_use]
    pub fn recycle_after(&self) -> Duration {
        Duration::from_secs(self.recycle_seconds)
    }

    /// Validate pool bounds
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `max_size` is zero or below `min_size`.
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("max_size must be at least 1".to_string()));
        }
        if self.min_size > self.max_size {
            return Err(Error::Config(format!(
                "min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: PoolStrategy::RoundRobin,
            min_size: 1,
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            recycle_seconds: 3600,
            pre_ping: true,
        }
    }
}

/// Global pooling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Enable pooling (disabled means every request gets a direct connection)
    pub enabled: bool,
    /// Defaults applied to pools without a backend override
    pub defaults: PoolConfig,
    /// Health score below which a pool is reported degraded
    pub degraded_threshold: f64,
    /// Pool monitoring interval
    #[serde(with = "humantime_serde")]
    pub monitor_interval: Duration,
    /// Strategy recommendation interval
    #[serde(with = "humantime_serde")]
    pub recommend_interval: Duration,
    /// Apply strategy recommendations automatically
    pub auto_adjust: bool,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            defaults: PoolConfig::default(),
            degraded_threshold: 0.7,
            monitor_interval: Duration::from_secs(60),
            recommend_interval: Duration::from_secs(3600),
            auto_adjust: false,
        }
    }
}

/// Cross-worker session affinity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Enable ownership tracking and forwarding
    pub enabled: bool,
    /// Worker identity (generated when unset)
    pub worker_id: Option<String>,
    /// How often the heartbeat is written
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// TTL of the heartbeat record
    #[serde(with = "humantime_serde")]
    pub heartbeat_ttl: Duration,
    /// Age after which a worker is considered dead
    #[serde(with = "humantime_serde")]
    pub stale_threshold: Duration,
    /// TTL of the worker metadata record
    #[serde(with = "humantime_serde")]
    pub metadata_ttl: Duration,
    /// TTL of ownership records, refreshed on use
    #[serde(with = "humantime_serde")]
    pub ownership_ttl: Duration,
    /// Bound on a forwarded request
    #[serde(with = "humantime_serde")]
    pub forward_timeout: Duration,
    /// Client header carrying the logical session id
    pub session_header: String,
}

impl AffinityConfig {
    /// Resolve this worker's id, generating one from the hostname if unset
    #[must_use]
    pub fn resolve_worker_id(&self) -> String {
        self.worker_id.clone().unwrap_or_else(|| {
            let host = env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
            format!("{host}-{}", uuid::Uuid::new_v4().simple())
        })
    }
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: None,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_ttl: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(70),
            metadata_ttl: Duration::from_secs(90),
            ownership_ttl: Duration::from_secs(3600),
            forward_timeout: Duration::from_secs(10),
            session_header: "mcp-session-id".to_string(),
        }
    }
}

/// Local session registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Cleanup pass interval
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// TTL of the durable last-accessed record
    #[serde(with = "humantime_serde")]
    pub session_ttl: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            session_ttl: Duration::from_secs(3600),
        }
    }
}

/// One upstream MCP server and how to pool connections to it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Free-form note shown in `/pools`
    pub description: String,
    /// Disabled backends are ignored entirely
    pub enabled: bool,
    /// `command` for a subprocess, `http_url` otherwise
    #[serde(flatten)]
    pub transport: TransportConfig,
    /// Upstream group (virtual server) this backend belongs to
    pub group: Option<String>,
    /// Operation names served by this backend
    pub tools: Vec<String>,
    /// Pool override for this backend
    pub pool: Option<PoolConfig>,
    /// Whether sessions against this backend carry server-side state
    pub stateful: bool,
    /// Upstream I/O bound
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Extra environment for a subprocess upstream
    pub env: HashMap<String, String>,
    /// Extra headers for an HTTP upstream; `${VAR}` is expanded
    pub headers: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            description: String::new(),
            enabled: true,
            transport: TransportConfig::default(),
            group: None,
            tools: vec![],
            pool: None,
            stateful: false,
            timeout: Duration::from_secs(30),
            env: HashMap::default(),
            headers: HashMap::default(),
        }
    }
}

/// How the gateway reaches an upstream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransportConfig {
    /// Subprocess speaking newline-delimited JSON on stdin/stdout
    Stdio {
        /// Command line, split on whitespace
        command: String,
        /// Directory the subprocess starts in
        #[serde(default)]
        cwd: Option<String>,
    },
    /// `http(s)://` (SSE or Streamable HTTP) or `ws(s)://` URL
    Http {
        /// Upstream URL
        http_url: String,
        /// POST directly instead of discovering an endpoint over SSE
        #[serde(default)]
        streamable_http: bool,
    },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Http {
            http_url: String::new(),
            streamable_http: false,
        }
    }
}

impl TransportConfig {
    /// Transport kind used in pool keys
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio { .. } => TransportKind::Stdio,
            Self::Http { http_url, .. }
                if http_url.starts_with("ws://") || http_url.starts_with("wss://") =>
            {
                TransportKind::WebSocket
            }
            Self::Http {
                streamable_http: true,
                ..
            } => TransportKind::StreamableHttp,
            Self::Http { .. } => TransportKind::Sse,
        }
    }

    /// Upstream address used in pool keys
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Stdio { command, .. } => command,
            Self::Http { http_url, .. } => http_url,
        }
    }
}

/// Durations written as `"30s"`, `"5m"`, `"2h"`, `"100ms"` or bare seconds
pub mod humantime_serde {
    use std::num::ParseIntError;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    /// Whole seconds when exact, milliseconds otherwise
    ///
    /// # Errors
    ///
    /// Propagates the serializer's error.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let text = if value.subsec_millis() == 0 {
            format!("{}s", value.as_secs())
        } else {
            format!("{}ms", value.as_millis())
        };
        serializer.serialize_str(&text)
    }

    /// # Errors
    ///
    /// Fails on anything [`parse`] rejects.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(de::Error::custom)
    }

    /// Parse one duration literal
    ///
    /// # Errors
    ///
    /// Returns the integer parse error for malformed input.
    pub fn parse(text: &str) -> Result<Duration, ParseIntError> {
        const UNITS: [(&str, u64); 4] = [("ms", 0), ("h", 3600), ("m", 60), ("s", 1)];
        let text = text.trim();
        for (suffix, scale) in UNITS {
            if let Some(number) = text.strip_suffix(suffix) {
                let n: u64 = number.parse()?;
                return Ok(if scale == 0 {
                    Duration::from_millis(n)
                } else {
                    Duration::from_secs(n * scale)
                });
            }
        }
        text.parse().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_affinity_schema() {
        let config = Config::default();
        assert_eq!(config.affinity.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.affinity.heartbeat_ttl, Duration::from_secs(60));
        assert_eq!(config.affinity.stale_threshold, Duration::from_secs(70));
        assert_eq!(config.affinity.metadata_ttl, Duration::from_secs(90));
        assert_eq!(config.affinity.ownership_ttl, Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pool_config_validation() {
        let mut pool = PoolConfig::default();
        assert!(pool.validate().is_ok());

        pool.min_size = 5;
        pool.max_size = 2;
        assert!(matches!(pool.validate(), Err(Error::Config(_))));

        pool.min_size = 0;
        pool.max_size = 0;
        assert!(pool.validate().is_err());
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(humantime_serde::parse("15").unwrap(), Duration::from_secs(15));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn test_backend_yaml() {
        let yaml = r#"
pool:
  defaults:
    strategy: sticky
    min_size: 2
    max_size: 4
    acquire_timeout: 500ms
backends:
  search:
    http_url: "http://localhost:9000/mcp"
    streamable_http: true
    tools: ["web_search", "fetch_page"]
    stateful: true
  local:
    command: "python -m server"
    pool:
      strategy: none
      max_size: 1
      min_size: 0
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pool.defaults.strategy, PoolStrategy::Sticky);
        assert_eq!(config.pool.defaults.acquire_timeout, Duration::from_millis(500));

        let search = &config.backends["search"];
        assert_eq!(search.transport.kind(), TransportKind::StreamableHttp);
        assert_eq!(search.tools.len(), 2);
        assert!(search.stateful);

        let local = &config.backends["local"];
        assert_eq!(local.transport.kind(), TransportKind::Stdio);
        assert_eq!(local.pool.as_ref().unwrap().strategy, PoolStrategy::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_inverted_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pool.yaml");
        std::fs::write(&path, "pool:\n  defaults:\n    min_size: 8\n    max_size: 2\n").unwrap();

        assert!(matches!(Config::load(Some(&path)), Err(Error::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/pool.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_absent_env_file_is_skipped() {
        let config = Config {
            env_files: vec!["/nonexistent/pool/.env".to_owned()],
            ..Config::default()
        };
        config.source_env_files();
    }

    #[test]
    fn test_home_relative_env_path() {
        assert_eq!(home_relative("/etc/pool.env"), PathBuf::from("/etc/pool.env"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(home_relative("~/pool.env"), home.join("pool.env"));
        }
    }

    #[test]
    fn test_placeholders_expand_with_fallback() {
        let mut config = Config::default();
        config.backends.insert(
            "search".to_owned(),
            BackendConfig {
                transport: TransportConfig::Http {
                    http_url: "http://${MCP_POOL_TEST_UNSET_HOST:-localhost}:9000/mcp".to_owned(),
                    streamable_http: true,
                },
                headers: HashMap::from([(
                    "Authorization".to_owned(),
                    "Bearer ${MCP_POOL_TEST_UNSET_TOKEN}".to_owned(),
                )]),
                ..BackendConfig::default()
            },
        );
        config.expand_placeholders();

        let search = &config.backends["search"];
        assert_eq!(search.transport.address(), "http://localhost:9000/mcp");
        assert_eq!(search.headers["Authorization"], "Bearer ");
    }

    #[test]
    fn test_advertise_url_default() {
        let server = ServerConfig::default();
        assert_eq!(server.advertise_url(), "http://127.0.0.1:39410");
    }
}
