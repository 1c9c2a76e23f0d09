use std::net::{Ipv4Addr, SocketAddr};

use anyhow::{anyhow, Result};
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;

pub const VOTE_SNAPSHOTS_PERSISTED: &str = "oceans_vote_snapshots_persisted_total";
pub const LIQUIDITY_SNAPSHOTS_PERSISTED: &str = "oceans_liquidity_snapshots_persisted_total";
pub const WEIGHT_SUBMISSIONS: &str = "oceans_weight_submissions_total";
pub const WEIGHT_SUBMISSION_FAILURES: &str = "oceans_weight_submission_failures_total";
pub const EPOCH_INDEX: &str = "oceans_epoch_index";
pub const SUBNET_WEIGHT_SUM: &str = "oceans_subnet_weight_sum";
pub const REWARD_SUM: &str = "oceans_reward_sum";

/// Install the Prometheus recorder and its scrape listener. Call once at
/// process start, after logging is up.
pub fn init(port: u16) -> Result<()> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow!("Failed to start prometheus exporter on {}: {}", addr, e))?;
    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}
