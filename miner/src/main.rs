use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use oceans_common::chain::{ChainClient, SubtensorClient};
use oceans_common::config::Config;
use oceans_common::logging;

/// Oceans subnet miner. Liquidity itself is provided on chain; this
/// process only has to stay registered and report its position within
/// the epoch.
#[derive(Parser, Clone, Debug)]
#[command(name = "oceans-miner")]
#[command(about = "Oceans subnet miner")]
struct CliConfig {
    /// Set log level (overrides LOG_LEVEL)
    #[clap(long)]
    log_level: Option<String>,

    /// Subnet to mine on (overrides DEFAULT_NETUID)
    #[clap(long)]
    netuid: Option<u16>,

    /// Subtensor RPC address (overrides SUBTENSOR_RPC)
    #[clap(long)]
    subtensor_rpc: Option<String>,

    /// Disable the log file
    #[clap(long)]
    disable_file_logging: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliConfig::parse();
    let mut config = Config::from_env()?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if let Some(netuid) = cli.netuid {
        config.default_netuid = netuid;
    }
    if let Some(rpc) = cli.subtensor_rpc {
        config.subtensor_rpc = rpc;
    }
    if cli.disable_file_logging {
        config.disable_file_logging = true;
    }
    config.validate()?;

    logging::init(logging::LogConfig {
        level: config.parse_log_level()?,
        json: config.json_logs,
        disable_file_logging: config.disable_file_logging,
        logs_path: &config.logs_path,
        filename_log: "oceans-miner.log",
    })?;

    info!(
        "Oceans miner v{} starting (network {}, netuid {})",
        env!("CARGO_PKG_VERSION"),
        config.bittensor_network,
        config.default_netuid
    );
    info!("Wallet: {}", config.wallet_name);

    let chain = SubtensorClient::with_config(
        &config.subtensor_rpc,
        config.to_chain_client_config(),
    )?;

    let should_exit = Arc::new(AtomicBool::new(false));
    let stop = should_exit.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            stop.store(true, Ordering::SeqCst);
        }
    });

    let poll = Duration::from_secs(config.vote_poll_interval_secs.max(1));
    while !should_exit.load(Ordering::SeqCst) {
        match chain.current_block().await {
            Ok(block) => match chain.tempo(config.default_netuid).await {
                Ok(tempo) if tempo > 0 => {
                    let into = block % tempo;
                    info!(
                        "[status] Block {} | Epoch {} [{}/{}]",
                        block,
                        block / tempo,
                        into,
                        tempo
                    );
                }
                Ok(_) | Err(_) => info!("[status] Block {}", block),
            },
            Err(e) => warn!("[status] chain unreachable: {}", e),
        }
        let mut remaining = poll;
        while !remaining.is_zero() && !should_exit.load(Ordering::SeqCst) {
            let slice = remaining.min(Duration::from_secs(1));
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
    }

    info!("Miner stopped");
    Ok(())
}
