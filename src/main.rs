//! Concord demo binary.
//!
//! Runs three parties and a notary in one process and walks an obligation
//! through issue, transfer, and settlement.
//!
//! Usage:
//!   concord                              # in-memory vaults, fresh keys
//!   concord --persistent                 # keys and vaults under --data-dir
//!   concord --data-dir ./data --amount 250

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Bilateral obligations with notarised finality.
#[derive(Parser, Debug)]
#[command(name = "concord", version, about = "Concord obligation ledger demo")]
struct Cli {
    /// Data directory holding concord.toml, keys, and vaults.
    #[arg(long, default_value = "./concord-data")]
    data_dir: PathBuf,

    /// Keep keys and vaults on disk instead of in memory.
    #[arg(long)]
    persistent: bool,

    /// Amount Bob borrows from Alice.
    #[arg(long, default_value_t = 100)]
    amount: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let mut config = concord::config::ConcordConfig::load(&cli.data_dir);
    config.node.data_dir = cli.data_dir.to_string_lossy().into_owned();
    if cli.persistent {
        config.node.ephemeral = false;
    }

    tracing::info!("Starting Concord demo as {}", config.node.name);
    tracing::info!("Data: {}", cli.data_dir.display());

    let summary = concord::demo::run_demo(&config, cli.amount).await?;
    tracing::info!(
        "Obligation {} closed after {} updates",
        summary.obligation,
        summary.updates.len()
    );
    Ok(())
}
