use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use oceans_common::alerts::AlertSender;
use oceans_common::api::VoteApiClient;
use oceans_common::chain::SubtensorClient;
use oceans_common::config::Config;
use oceans_common::logging;

use oceans_validator::ingest::{LiquidityIngestor, VoteIngestor};
use oceans_validator::metrics;
use oceans_validator::rewards::RewardCalculator;
use oceans_validator::scheduler::EpochScheduler;
use oceans_validator::state_cache::StateCache;

/// Oceans subnet validator - rewards miners in proportion to the
/// liquidity they provide, weighted by governance votes.
#[derive(Parser, Clone, Debug)]
#[command(name = "oceans-validator")]
#[command(about = "Oceans subnet validator")]
pub struct CliConfig {
    /// Set log level (overrides LOG_LEVEL)
    #[clap(long)]
    log_level: Option<String>,

    /// Subnet to validate on (overrides DEFAULT_NETUID)
    #[clap(long)]
    netuid: Option<u16>,

    /// Vote API endpoint, or "TODO" for offline mode (overrides VOTE_API_ENDPOINT)
    #[clap(long)]
    vote_api_endpoint: Option<String>,

    /// Subtensor RPC address (overrides SUBTENSOR_RPC)
    #[clap(long)]
    subtensor_rpc: Option<String>,

    /// Path of the local snapshot store (overrides DB_URI)
    #[clap(long)]
    db_uri: Option<String>,

    /// Disable the log file
    #[clap(long)]
    disable_file_logging: bool,
}

impl CliConfig {
    fn apply(self, config: &mut Config) {
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(netuid) = self.netuid {
            config.default_netuid = netuid;
        }
        if let Some(endpoint) = self.vote_api_endpoint {
            config.vote_api_endpoint = endpoint;
        }
        if let Some(rpc) = self.subtensor_rpc {
            config.subtensor_rpc = rpc;
        }
        if let Some(db_uri) = self.db_uri {
            config.db_uri = db_uri;
        }
        if self.disable_file_logging {
            config.disable_file_logging = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliConfig::parse();
    let mut config = Config::from_env()?;
    cli.apply(&mut config);
    config.validate()?;

    logging::init(logging::LogConfig {
        level: config.parse_log_level()?,
        json: config.json_logs,
        disable_file_logging: config.disable_file_logging,
        logs_path: &config.logs_path,
        filename_log: &config.filename_log,
    })?;

    info!(
        "Oceans validator v{} starting (network {}, netuid {})",
        env!("CARGO_PKG_VERSION"),
        config.bittensor_network,
        config.default_netuid
    );
    info!("Wallet: {}", config.wallet_name);

    if let Err(e) = metrics::init(config.prometheus_port) {
        warn!("Metrics exporter unavailable: {}", e);
    }

    let chain = Arc::new(SubtensorClient::with_config(
        &config.subtensor_rpc,
        config.to_chain_client_config(),
    )?);
    let cache = Arc::new(StateCache::open(&config.db_uri)?);
    info!("Snapshot store opened at {}", config.db_uri);

    let vote_client = Arc::new(VoteApiClient::new(
        &config.vote_api_endpoint,
        oceans_common::api::DEFAULT_TIMEOUT,
        config.active_subnets.clone(),
    )?);

    let votes = VoteIngestor::new(cache.clone(), vote_client);
    let liquidity = LiquidityIngestor::new(
        cache.clone(),
        chain.clone(),
        config.active_subnets.clone(),
        config.default_netuid,
        config.max_concurrency,
        config.liquidity_refresh_blocks,
    );
    let rewards = RewardCalculator::new(cache.clone());
    let alerts = AlertSender::new(config.alert_webhook_url.clone());

    let mut scheduler = EpochScheduler::new(
        chain,
        cache,
        votes,
        liquidity,
        rewards,
        alerts,
        config,
    );

    let stop = scheduler.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, stopping at the next sleep boundary");
            stop.store(true, Ordering::SeqCst);
        }
    });

    scheduler.run().await?;
    Ok(())
}
