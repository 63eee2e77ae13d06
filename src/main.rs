//! ShardSync - Follower-side Shard Synchronization
//!
//! Operator tool: configuration handling and one-off leader requests.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardsync::config::ShardSyncConfig;
use shardsync::leader::LeaderClient;
use shardsync::maintenance::backoff_delay;
use shardsync::rpc::RpcLeaderClient;

/// ShardSync - Follower-side Shard Synchronization
#[derive(Parser)]
#[command(name = "shardsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shardsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shardsync.toml")]
        output: PathBuf,

        /// Server ID of this node
        #[arg(long, default_value = "PRMR-0001")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show the document count of a shard on its leader
    Count {
        /// Leader endpoint (host:port or tcp://host:port)
        #[arg(long)]
        leader: String,

        #[arg(long)]
        database: String,

        #[arg(long)]
        shard: String,
    },

    /// Make the leader recalculate the document count of a shard
    Recount {
        /// Leader endpoint (host:port or tcp://host:port)
        #[arg(long)]
        leader: String,

        #[arg(long)]
        database: String,

        #[arg(long)]
        shard: String,
    },

    /// Release a lock left behind on a leader
    CancelLock {
        /// Leader endpoint (host:port or tcp://host:port)
        #[arg(long)]
        leader: String,

        #[arg(long)]
        database: String,

        /// Lock id handed out by the leader
        #[arg(long)]
        id: u64,

        /// Client id the lock was taken for (database, collection, shard and leader concatenated)
        #[arg(long, default_value = "")]
        client_id: String,
    },

    /// Show the delay before the next attempt after consecutive failures
    Backoff {
        /// Number of consecutive failures
        #[arg(long)]
        failures: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // A missing config file is fine for everything but `validate`
    let config = load_or_default(&cli.config);
    let level = cli.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, &config.logging.format);

    match cli.command {
        Commands::Init { output, node_id } => run_init(&output, node_id),
        Commands::Validate => run_validate(&cli.config),
        Commands::Count { leader, database, shard } => {
            run_count(&config, &leader, &database, &shard, false, cli.json).await
        }
        Commands::Recount { leader, database, shard } => {
            run_count(&config, &leader, &database, &shard, true, cli.json).await
        }
        Commands::CancelLock { leader, database, id, client_id } => {
            run_cancel_lock(&config, &leader, &database, id, &client_id).await
        }
        Commands::Backoff { failures } => run_backoff(&config, failures, cli.json),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_or_default(path: &Path) -> ShardSyncConfig {
    ShardSyncConfig::from_file(path).unwrap_or_else(|_| ShardSyncConfig::for_node("shardsync"))
}

/// Write a default configuration file
fn run_init(output: &Path, node_id: String) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite", output.display());
    }

    let config = ShardSyncConfig::for_node(node_id);
    let content = config.to_toml()?;
    std::fs::write(output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Configuration written to {}", output.display());
    Ok(())
}

/// Validate configuration file
fn run_validate(path: &Path) -> anyhow::Result<()> {
    let config = ShardSyncConfig::from_file(path)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;

    let settings = config.settings();
    println!("Configuration is valid");
    println!("  Node ID: {} (reboot {})", config.node.id, config.node.reboot_id);
    println!(
        "  Soft lock: {} rounds of {:?}, catch-up budget {:?}",
        settings.soft_lock_max_rounds,
        settings.soft_lock_timeout,
        settings.soft_catch_up_budget()
    );
    println!("  Hard lock: {:?}", settings.hard_lock_timeout);
    match settings.attempt_timeout {
        Some(timeout) => println!("  Attempt timeout: {:?}", timeout),
        None => println!("  Attempt timeout: none"),
    }
    println!("  Requeue threshold: {} documents", settings.requeue_doc_diff_threshold);
    Ok(())
}

/// Read or recalculate a shard count on the leader
async fn run_count(
    config: &ShardSyncConfig,
    leader: &str,
    database: &str,
    shard: &str,
    recalculate: bool,
    json: bool,
) -> anyhow::Result<()> {
    let client = RpcLeaderClient::new(config.connect_timeout());
    let settings = config.settings();

    let result = if recalculate {
        tracing::info!("Recalculating count of {}/{} on {}", database, shard, leader);
        client
            .recalculate_count(leader, database, shard, settings.leader_recount_timeout)
            .await
    } else {
        client
            .collection_count(leader, database, shard, config.request_timeout())
            .await
    };
    let count = result
        .with_context(|| format!("failed to get count of {}/{} from {}", database, shard, leader))?;

    if json {
        let out = serde_json::json!({
            "database": database,
            "shard": shard,
            "leader": leader,
            "count": count,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!("{}/{}: {} documents", database, shard, count);
    }
    Ok(())
}

/// Release a lock on the leader
async fn run_cancel_lock(
    config: &ShardSyncConfig,
    leader: &str,
    database: &str,
    id: u64,
    client_id: &str,
) -> anyhow::Result<()> {
    let client = RpcLeaderClient::new(config.connect_timeout());
    client
        .cancel_lock(leader, database, id, client_id, config.request_timeout())
        .await
        .with_context(|| format!("failed to cancel lock {} on {}", id, leader))?;

    println!("Lock {} on {} released", id, leader);
    Ok(())
}

/// Show the pre-attempt delay
fn run_backoff(config: &ShardSyncConfig, failures: usize, json: bool) -> anyhow::Result<()> {
    let settings = config.settings();
    let delay = backoff_delay(failures, settings.backoff_failure_threshold, settings.backoff_max);

    if json {
        let out = serde_json::json!({
            "failures": failures,
            "delay_secs": delay.map(|d| d.as_secs_f64()).unwrap_or(0.0),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        match delay {
            Some(d) => println!("{} failures: next attempt delayed by {:.1} s", failures, d.as_secs_f64()),
            None => println!("{} failures: no delay", failures),
        }
    }
    Ok(())
}
