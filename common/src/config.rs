use std::collections::BTreeSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use log::{warn, LevelFilter};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::chain::ChainClientConfig;
use crate::error::ConfigError;

/// Default values for configuration
pub mod defaults {
    pub const LOG_LEVEL: &str = "info";
    pub const FILENAME_LOG: &str = "oceans-validator.log";
    pub const LOGS_PATH: &str = "logs/";
    pub const DB_URI: &str = "oceans-cache.db";
    pub const BITTENSOR_NETWORK: &str = "finney";
    pub const SUBTENSOR_RPC: &str = "wss://finney.subtensor.network";
    pub const DEFAULT_NETUID: u16 = 66;
    pub const VOTE_API_ENDPOINT: &str = "TODO";
    pub const VOTE_POLL_INTERVAL_SECS: u64 = 30;
    pub const LIQUIDITY_REFRESH_BLOCKS: u64 = 1;
    pub const EPOCH_SECONDS: u64 = 600;
    pub const MAX_CONCURRENCY: usize = 5;
    pub const PROMETHEUS_PORT: u16 = 8000;
    pub const WALLET_NAME: &str = "default";
    pub const LOG_INTERVAL_BLOCKS: u64 = 2;

    // Chain client defaults
    pub const REQUEST_TIMEOUT_SECS: u64 = 30;
    pub const CONNECTION_TIMEOUT_SECS: u64 = 10;
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_DELAY_MS: u64 = 1000;

    // Nominal seconds between chain blocks
    pub const BLOCK_TIME_SECS: f64 = 12.0;

    // Version tag attached to every weight submission
    pub const WEIGHTS_VERSION_KEY: u64 = 1;
}

/// Subnets that are registered on chain but excluded from voting and
/// liquidity scoring. The default active set is 1..=128 minus this list.
pub const INACTIVE_SUBNETS: &[u16] = &[
    15, 46, 67, 69, 74, 78, 82, 83, 95, 100, 101, 104, 110, 112, 115, 116, 117, 118, 119, 120,
];

/// Immutable process configuration, built once at startup from the
/// environment and threaded into every component via constructors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub log_level: String,
    pub json_logs: bool,
    pub disable_file_logging: bool,
    pub filename_log: String,
    pub logs_path: String,

    pub db_uri: String,

    pub bittensor_network: String,
    pub subtensor_rpc: String,
    pub default_netuid: u16,

    pub vote_api_endpoint: String,
    pub vote_poll_interval_secs: u64,
    pub liquidity_refresh_blocks: u64,
    pub epoch_seconds: u64,
    pub max_concurrency: usize,

    pub active_subnets: BTreeSet<u16>,

    pub prometheus_port: u16,

    pub wallet_name: String,
    pub wallet_mnemonic: Option<String>,
    pub wallet_passphrase: Option<String>,

    pub alert_webhook_url: Option<String>,

    pub request_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,

    pub log_interval_blocks: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: defaults::LOG_LEVEL.to_string(),
            json_logs: false,
            disable_file_logging: false,
            filename_log: defaults::FILENAME_LOG.to_string(),
            logs_path: defaults::LOGS_PATH.to_string(),
            db_uri: defaults::DB_URI.to_string(),
            bittensor_network: defaults::BITTENSOR_NETWORK.to_string(),
            subtensor_rpc: defaults::SUBTENSOR_RPC.to_string(),
            default_netuid: defaults::DEFAULT_NETUID,
            vote_api_endpoint: defaults::VOTE_API_ENDPOINT.to_string(),
            vote_poll_interval_secs: defaults::VOTE_POLL_INTERVAL_SECS,
            liquidity_refresh_blocks: defaults::LIQUIDITY_REFRESH_BLOCKS,
            epoch_seconds: defaults::EPOCH_SECONDS,
            max_concurrency: defaults::MAX_CONCURRENCY,
            active_subnets: default_active_subnets(),
            prometheus_port: defaults::PROMETHEUS_PORT,
            wallet_name: defaults::WALLET_NAME.to_string(),
            wallet_mnemonic: None,
            wallet_passphrase: None,
            alert_webhook_url: None,
            request_timeout_secs: defaults::REQUEST_TIMEOUT_SECS,
            connection_timeout_secs: defaults::CONNECTION_TIMEOUT_SECS,
            max_retries: defaults::MAX_RETRIES,
            retry_delay_ms: defaults::RETRY_DELAY_MS,
            log_interval_blocks: defaults::LOG_INTERVAL_BLOCKS,
        }
    }
}

/// The default active set: every subnet in 1..=128 that is not in
/// [`INACTIVE_SUBNETS`].
pub fn default_active_subnets() -> BTreeSet<u16> {
    (1..=128u16)
        .filter(|id| !INACTIVE_SUBNETS.contains(id))
        .collect()
}

/// Parse an `ACTIVE_SUBNETS` value such as `"1,2,5-10,64"` into a set.
///
/// Subnet 0 is the root subnet and is silently dropped with a warning.
pub fn parse_subnet_set(raw: &str) -> Result<BTreeSet<u16>, ConfigError> {
    let mut set = BTreeSet::new();
    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        if let Some((lo, hi)) = token.split_once('-') {
            let lo: u16 = lo
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidSubnetId(token.to_string()))?;
            let hi: u16 = hi
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidSubnetId(token.to_string()))?;
            if lo > hi {
                return Err(ConfigError::InvalidSubnetId(token.to_string()));
            }
            set.extend(lo..=hi);
        } else {
            let id: u16 = token
                .parse()
                .map_err(|_| ConfigError::InvalidSubnetId(token.to_string()))?;
            set.insert(id);
        }
    }
    if set.remove(&0) {
        warn!("Subnet 0 is not a valid target and was dropped from ACTIVE_SUBNETS");
    }
    Ok(set)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            field: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Build the configuration from environment variables and validate it.
    /// Any invalid value is fatal at startup.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Config {
            log_level: env_string("LOG_LEVEL", defaults::LOG_LEVEL),
            json_logs: env_parse("JSON_LOGS", false)?,
            disable_file_logging: env_parse("DISABLE_FILE_LOGGING", false)?,
            filename_log: env_string("FILENAME_LOG", defaults::FILENAME_LOG),
            logs_path: env_string("LOGS_PATH", defaults::LOGS_PATH),
            db_uri: env_string("DB_URI", defaults::DB_URI),
            bittensor_network: env_string("BITTENSOR_NETWORK", defaults::BITTENSOR_NETWORK),
            subtensor_rpc: env_string("SUBTENSOR_RPC", defaults::SUBTENSOR_RPC),
            default_netuid: env_parse("DEFAULT_NETUID", defaults::DEFAULT_NETUID)?,
            vote_api_endpoint: env_string("VOTE_API_ENDPOINT", defaults::VOTE_API_ENDPOINT),
            vote_poll_interval_secs: env_parse(
                "VOTE_POLL_INTERVAL",
                defaults::VOTE_POLL_INTERVAL_SECS,
            )?,
            liquidity_refresh_blocks: env_parse(
                "LIQUIDITY_REFRESH_BLOCKS",
                defaults::LIQUIDITY_REFRESH_BLOCKS,
            )?,
            epoch_seconds: env_parse("EPOCH_SECONDS", defaults::EPOCH_SECONDS)?,
            max_concurrency: env_parse("MAX_CONCURRENCY", defaults::MAX_CONCURRENCY)?,
            active_subnets: match env_opt("ACTIVE_SUBNETS") {
                Some(raw) => parse_subnet_set(&raw)?,
                None => default_active_subnets(),
            },
            prometheus_port: env_parse("PROMETHEUS_PORT", defaults::PROMETHEUS_PORT)?,
            wallet_name: env_string("WALLET_NAME", defaults::WALLET_NAME),
            wallet_mnemonic: env_opt("WALLET_MNEMONIC"),
            wallet_passphrase: env_opt("WALLET_PASSPHRASE"),
            alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
            request_timeout_secs: env_parse("REQUEST_TIMEOUT_SECS", defaults::REQUEST_TIMEOUT_SECS)?,
            connection_timeout_secs: env_parse(
                "CONNECTION_TIMEOUT_SECS",
                defaults::CONNECTION_TIMEOUT_SECS,
            )?,
            max_retries: env_parse("MAX_RETRIES", defaults::MAX_RETRIES)?,
            retry_delay_ms: env_parse("RETRY_DELAY_MS", defaults::RETRY_DELAY_MS)?,
            log_interval_blocks: env_parse("LOG_INTERVAL_BLOCKS", defaults::LOG_INTERVAL_BLOCKS)?,
        };
        config.log_interval_blocks = config.log_interval_blocks.max(1);
        config.validate()?;
        Ok(config)
    }

    /// Fail-fast validation of the assembled configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parse_log_level()?;

        if self.active_subnets.is_empty() {
            return Err(ConfigError::EmptyActiveSubnets);
        }

        let rpc = &self.subtensor_rpc;
        let parseable = if rpc.contains("://") {
            rpc.clone()
        } else {
            format!("http://{rpc}")
        };
        let url = Url::parse(&parseable)
            .map_err(|_| ConfigError::InvalidRpcAddress(rpc.clone()))?;
        if !matches!(url.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(ConfigError::InvalidRpcAddress(rpc.clone()));
        }

        Ok(())
    }

    /// Parsed log level. Invalid levels are a startup error.
    pub fn parse_log_level(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| ConfigError::InvalidLogLevel(self.log_level.clone()))
    }

    /// Create a [`ChainClientConfig`] from the validated settings.
    pub fn to_chain_client_config(&self) -> ChainClientConfig {
        ChainClientConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            max_retries: self.max_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_active_set_excludes_inactive_subnets() {
        let active = default_active_subnets();
        assert_eq!(active.len(), 128 - INACTIVE_SUBNETS.len());
        for id in INACTIVE_SUBNETS {
            assert!(!active.contains(id));
        }
        assert!(active.contains(&1));
        assert!(active.contains(&66));
        assert!(!active.contains(&0));
    }

    #[test]
    fn parse_subnet_set_accepts_lists_and_ranges() {
        let set = parse_subnet_set("1, 2,5-8,64").unwrap();
        assert_eq!(
            set.into_iter().collect::<Vec<_>>(),
            vec![1, 2, 5, 6, 7, 8, 64]
        );
    }

    #[test]
    fn parse_subnet_set_drops_root_subnet() {
        let set = parse_subnet_set("0,3").unwrap();
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn parse_subnet_set_rejects_garbage() {
        assert!(parse_subnet_set("a,b").is_err());
        assert!(parse_subnet_set("9-3").is_err());
    }

    #[test]
    fn empty_active_set_is_a_startup_error() {
        let config = Config {
            active_subnets: BTreeSet::new(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::EmptyActiveSubnets)
        ));
    }

    #[test]
    fn invalid_log_level_is_a_startup_error() {
        let config = Config {
            log_level: "verbose".to_string(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }

    #[test]
    fn ws_rpc_url_passes_validation() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }
}
