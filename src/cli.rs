//! `mcp-session-pool` command line

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Pooled, session-affine gateway worker for MCP upstreams
#[derive(Parser, Debug)]
#[command(name = "mcp-session-pool")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "MCP_POOL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Listen port, overrides `server.port`
    #[arg(short, long, env = "MCP_POOL_PORT")]
    pub port: Option<u16>,

    /// Bind address, overrides `server.host`
    #[arg(long, env = "MCP_POOL_HOST")]
    pub host: Option<String>,

    /// Worker id (defaults to hostname plus a random suffix)
    #[arg(long, env = "MCP_POOL_WORKER_ID")]
    pub worker_id: Option<String>,

    /// Default log filter when `RUST_LOG` is unset
    #[arg(long, default_value = "info", env = "MCP_POOL_LOG_LEVEL", global = true)]
    pub log_level: String,

    /// `json` for structured logs, plain text otherwise
    #[arg(long, env = "MCP_POOL_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Disable pooling (every request gets a direct connection)
    #[arg(long)]
    pub no_pooling: bool,

    /// Runs the worker when omitted
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// What to run
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the worker (default)
    Serve,

    /// Load and validate the configuration, then print the resolved backends
    CheckConfig {
        /// Also print the effective configuration as YAML
        #[arg(long)]
        print: bool,
    },

    /// Suggest a pooling strategy for a target with the given behaviour
    Recommend {
        /// Mean response time in milliseconds
        #[arg(long, default_value_t = 0)]
        avg_response_ms: u64,

        /// Fraction of failed requests (0.0 - 1.0)
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,

        /// The target keeps per-session state
        #[arg(long)]
        stateful: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve() {
        let cli = Cli::try_parse_from(["mcp-session-pool"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_check_config_print_flag() {
        let cli = Cli::try_parse_from(["mcp-session-pool", "check-config", "--print"]).unwrap();
        assert!(matches!(cli.command, Some(Command::CheckConfig { print: true })));
    }

    #[test]
    fn test_recommend_arguments() {
        let cli = Cli::try_parse_from([
            "mcp-session-pool",
            "recommend",
            "--avg-response-ms",
            "1500",
            "--failure-rate",
            "0.02",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Recommend {
                avg_response_ms,
                failure_rate,
                stateful,
            }) => {
                assert_eq!(avg_response_ms, 1500);
                assert!((failure_rate - 0.02).abs() < f64::EPSILON);
                assert!(!stateful);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
