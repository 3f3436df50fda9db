//! WolfGalera - Cluster-aware connection router for Galera clusters
//!
//! Command-line front end: runs a router against a live cluster, probes a
//! single node, and manages the configuration file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfgalera::cluster::ClusterManager;
use wolfgalera::config::{LoggingConfig, RouterConfig};
use wolfgalera::consistency::ConsistencyLevel;
use wolfgalera::node::{Node, NodeContext};
use wolfgalera::pool::{Connection, MySqlPoolProvider};

/// WolfGalera - Cluster-aware connection router for Galera clusters
#[derive(Parser)]
#[command(name = "wolfgalera")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfgalera.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a test query through the cluster until interrupted
    Run {
        /// Delay between borrowed connections
        #[arg(short, long, default_value_t = 1000)]
        interval_ms: u64,

        /// Consistency level for each borrowed connection (e.g. sync_reads)
        #[arg(long)]
        consistency: Option<ConsistencyLevel>,
    },

    /// Probe one node and print its parsed status as JSON
    Probe {
        /// Node address (host:port)
        address: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfgalera.toml")]
        output: PathBuf,

        /// Seed nodes, comma separated
        #[arg(long, default_value = "127.0.0.1:3306")]
        seeds: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The logging section is optional, so a missing file still gets defaults
    let logging = RouterConfig::from_file(&cli.config)
        .map(|config| config.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Run { interval_ms, consistency } => {
            run_router(&cli.config, Duration::from_millis(interval_ms), consistency).await
        }
        Commands::Probe { address } => {
            run_probe(&cli.config, &address).await
        }
        Commands::Validate => {
            run_validate(&cli.config)
        }
        Commands::Init { output, seeds } => {
            run_init(&output, &seeds)
        }
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<RouterConfig> {
    RouterConfig::from_file(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Start a router and borrow a connection every interval
async fn run_router(
    config_path: &Path,
    interval: Duration,
    consistency: Option<ConsistencyLevel>,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(
        "Starting WolfGalera with seeds {}",
        config.cluster.seeds.join(",")
    );

    let manager = ClusterManager::connect(config)
        .await
        .context("failed to start cluster manager")?;

    let mut ticker = tokio::time::interval(interval);
    let mut served: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match borrow_and_query(&manager, consistency).await {
                    Ok(node) => {
                        served += 1;
                        tracing::debug!("SELECT 1 served by {}", node);
                        if served % 10 == 0 {
                            let state = manager.state().await;
                            tracing::info!(
                                active = ?state.active,
                                downed = ?state.downed,
                                served,
                                "Cluster state"
                            );
                        }
                    }
                    Err(e) if e.is_retryable() => {
                        tracing::warn!("Connection request failed, will retry: {}", e)
                    }
                    Err(e) => tracing::error!("Connection request failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn borrow_and_query(
    manager: &Arc<ClusterManager>,
    consistency: Option<ConsistencyLevel>,
) -> wolfgalera::Result<String> {
    let mut conn = manager.get_connection_with(consistency, None).await?;
    let node = conn.node().to_string();

    let result = conn.execute("SELECT 1").await;
    match result {
        Ok(_) => conn.close().await?,
        Err(e) => {
            conn.discard().await;
            return Err(e);
        }
    }
    Ok(node)
}

/// One-shot status probe of a single node
async fn run_probe(config_path: &Path, address: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let context = Arc::new(NodeContext::from_config(&config, Arc::new(MySqlPoolProvider::new())));

    let node = Node::new(address, context)?;
    let status = node.refresh_status().await;
    node.shutdown().await;

    let status = status.with_context(|| format!("failed to probe {}", address))?;
    println!("{}", serde_json::to_string_pretty(&*status)?);
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    match load_config(config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Seeds: {}", config.cluster.seeds.join(","));
            println!("  User: {}", config.database.user);
            println!("  Database: {}", config.database.database.as_deref().unwrap_or("(none)"));
            println!("  Policy: {:?}", config.cluster.default_policy);
            println!("  Discovery period: {:?}", config.discovery_period());
            println!("  Ignore donor: {}", config.discovery.ignore_donor);
            println!("  Max connections per host: {}", config.pool.max_connections_per_host);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {:#}", e);
            Err(e)
        }
    }
}

/// Initialize configuration file
fn run_init(output: &Path, seeds: &str) -> anyhow::Result<()> {
    let seeds = wolfgalera::config::parse_seeds(seeds)
        .iter()
        .map(|s| format!("\"{}\"", s))
        .collect::<Vec<_>>()
        .join(", ");

    let config_content = format!(r#"# WolfGalera Configuration
# Generated configuration file

[database]
user = "wolfgalera"
password = "changeme"
database = "myapp"

[cluster]
seeds = [{seeds}]
retries_to_get_connection = 3
default_policy = "round_robin"
# consistency_level = "sync_reads"

[discovery]
period_ms = 2000
ignore_donor = true

[pool]
name = "wolfgalera"
max_connections_per_host = 10
min_connections_idle_per_host = 0
acquire_timeout_ms = 1000
idle_timeout_ms = 30000
autocommit = true
read_only = false
metrics_enabled = false

[status_pool]
max_connections_per_host = 1
min_connections_idle_per_host = 1

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(output, config_content)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your database credentials and seed nodes.");
    println!("Then start with: wolfgalera --config {} run", output.display());

    Ok(())
}
