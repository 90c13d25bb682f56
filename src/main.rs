//! MCP Session Pool - pooled, session-affine gateway worker

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use mcp_session_pool::{
    cli::{Cli, Command},
    config::Config,
    gateway::{Gateway, StaticResolver, TargetResolver},
    pool::{PoolStrategy, StrategyRecommendation, StrategySignals},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::CheckConfig { print }) => run_check_config(&cli, print),
        Some(Command::Recommend {
            avg_response_ms,
            failure_rate,
            stateful,
        }) => run_recommend(avg_response_ms, failure_rate, stateful),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return None;
        }
    };

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = &cli.host {
        config.server.host.clone_from(host);
    }
    if let Some(worker_id) = &cli.worker_id {
        config.affinity.worker_id = Some(worker_id.clone());
    }
    if cli.no_pooling {
        config.pool.enabled = false;
    }
    Some(config)
}

/// Validate configuration and list what it resolves to
fn run_check_config(cli: &Cli, print: bool) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return ExitCode::FAILURE;
    }

    let resolver = StaticResolver::from_config(&config);
    println!("Configuration OK");
    println!(
        "  pooling: {} (default strategy: {}, size {}..={})",
        config.pool.enabled,
        config.pool.defaults.strategy,
        config.pool.defaults.min_size,
        config.pool.defaults.max_size
    );
    println!("  affinity: {}", config.affinity.enabled);
    for target in resolver.targets() {
        let pool = target.pool.as_ref().unwrap_or(&config.pool.defaults);
        println!(
            "  backend {}: {} [{}] strategy={} stateful={}",
            target.backend, target.address, target.transport, pool.strategy, target.stateful
        );
    }

    if print {
        match serde_yaml::to_string(&config) {
            Ok(yaml) => println!("---\n{yaml}"),
            Err(e) => {
                eprintln!("Failed to render configuration: {e}");
                return ExitCode::FAILURE;
            }
        }
    }
    ExitCode::SUCCESS
}

/// Print the advisory strategy for the given signals
fn run_recommend(avg_response_ms: u64, failure_rate: f64, stateful: bool) -> ExitCode {
    let signals = StrategySignals {
        avg_response_time: Duration::from_millis(avg_response_ms),
        failure_rate,
        has_state: stateful,
    };
    let recommendation = StrategyRecommendation::new(PoolStrategy::default(), signals);
    match serde_json::to_string_pretty(&recommendation) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize recommendation: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the worker
async fn run_server(cli: Cli) -> ExitCode {
    let Some(config) = load_config(&cli) else {
        return ExitCode::FAILURE;
    };

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!(error = %e, "Failed to create worker");
            return ExitCode::FAILURE;
        }
    };

    info!(worker_id = %gateway.worker_id(), "Starting worker");
    match gateway.run().await {
        Ok(()) => {
            info!("Worker shut down gracefully");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Worker error");
            ExitCode::FAILURE
        }
    }
}
