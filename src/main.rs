//! endpoint-health - keep a list of healthy endpoints
//!
//! Usage:
//!     endpoint-health --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info};

use endpoint_health::config::{load_config, Config, GlobalConfig, StrategyConfig};
use endpoint_health::discovery::EndpointGroup;
use endpoint_health::endpoint::Endpoint;
use endpoint_health::health::HealthCheckedEndpointGroup;
use endpoint_health::metrics::MetricsCollector;
use endpoint_health::util::init_logging;

/// Health-check a set of endpoints and report which ones are healthy.
#[derive(Parser, Debug)]
#[command(name = "endpoint-health")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format).context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Group: {}", config.global.name);
        match &config.discovery.file {
            Some(path) => println!("  Discovery: file {}", path.display()),
            None => println!("  Discovery: {} static endpoints", config.discovery.endpoints.len()),
        }
        println!(
            "  Health check: {:?} every {} ({})",
            config.health_check.probe(),
            humantime::format_duration(config.health_check.retry_interval),
            strategy_summary(&config.health_check.strategy)
        );
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        group = %config.global.name,
        probe = ?config.health_check.probe(),
        "endpoint-health starting"
    );

    run(config)
}

fn strategy_summary(strategy: &StrategyConfig) -> String {
    match strategy {
        StrategyConfig::All => "all endpoints".to_string(),
        StrategyConfig::Partial {
            max_endpoint_count: Some(count),
            ..
        } => format!("at most {} endpoints", count),
        StrategyConfig::Partial {
            max_endpoint_ratio: Some(ratio),
            ..
        } => format!("at most {}% of endpoints", ratio * 100.0),
        StrategyConfig::Partial { .. } => "partial".to_string(),
    }
}

/// Build the group on a fresh runtime and run until Ctrl+C.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let discovery = config
        .discovery
        .start(runtime.handle())
        .context("failed to start endpoint discovery")?;

    let metrics = MetricsCollector::new();
    let listener_metrics = metrics.clone();
    let name = config.global.name.clone();

    let builder = HealthCheckedEndpointGroup::builder(discovery, config.health_check.checker_factory())
        .runtime(runtime.handle().clone())
        .listener(Arc::new(move |endpoints: &[Endpoint]| {
            listener_metrics.record_publication(&name);
            info!(
                group = %name,
                healthy = endpoints.len(),
                endpoints = ?endpoints.iter().map(Endpoint::to_string).collect::<Vec<_>>(),
                "healthy endpoints changed"
            );
        }));

    // Blocks until every endpoint was checked once
    let group = config
        .health_check
        .configure(builder)
        .build()
        .context("failed to build health checked endpoint group")?;
    info!(group = %group, "initial health check complete");

    runtime.block_on(run_async(group, metrics, config.global))
}

/// Report health periodically until shutdown, then close the group.
async fn run_async(
    group: HealthCheckedEndpointGroup,
    metrics: MetricsCollector,
    global: GlobalConfig,
) -> Result<()> {
    let mut report = tokio::time::interval(global.report_interval);
    report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    info!("press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = report.tick() => {
                let snapshot = group.health_snapshot();
                metrics.record_snapshot(&global.name, &snapshot);
                info!(
                    group = %global.name,
                    candidates = snapshot.candidates,
                    healthy = snapshot.healthy,
                    "health snapshot"
                );
                match metrics.encode() {
                    Ok(text) => debug!(metrics = %text, "metrics"),
                    Err(e) => error!(error = %e, "failed to encode metrics"),
                }
            }

            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("received shutdown signal"),
                    Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
                }
                break;
            }
        }
    }

    group.close().await;
    info!("endpoint-health shut down complete");
    Ok(())
}
