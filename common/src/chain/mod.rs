mod subtensor;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChainError;

pub use subtensor::SubtensorClient;

/// How many RAO make one TAO. On-chain liquidity amounts are reported in
/// RAO and converted to the canonical TAO unit with this divisor.
pub const RAO_PER_TAO: u64 = 1_000_000_000;

/// Configuration for chain client retries and timeouts
#[derive(Debug, Clone)]
pub struct ChainClientConfig {
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ChainClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// Point-in-time snapshot of a subnet's participant identifiers:
/// parallel uid and coldkey lists, index-aligned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metagraph {
    pub uids: Vec<u16>,
    pub coldkeys: Vec<String>,
}

impl Metagraph {
    /// Resolve a coldkey to its uid on this subnet, if registered.
    /// A coldkey maps to at most one uid per subnet; first match wins.
    pub fn uid_of(&self, coldkey: &str) -> Option<u16> {
        self.coldkeys
            .iter()
            .position(|ck| ck == coldkey)
            .map(|idx| self.uids[idx])
    }
}

/// One on-chain liquidity position. The raw amount is in RAO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityPosition {
    pub liquidity: u64,
}

impl LiquidityPosition {
    /// Canonical amount in TAO.
    pub fn tao_value(&self) -> f64 {
        self.liquidity as f64 / RAO_PER_TAO as f64
    }
}

/// Read-only facade over the chain node, plus weight submission.
/// All operations may fail transiently; implementations retry a bounded
/// number of times before surfacing the error.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn current_block(&self) -> Result<u64, ChainError>;

    /// Nominal number of blocks per epoch for a subnet.
    async fn tempo(&self, netuid: u16) -> Result<u64, ChainError>;

    /// First block of the next epoch for a subnet.
    async fn next_epoch_start(&self, netuid: u16) -> Result<u64, ChainError>;

    async fn get_metagraph(
        &self,
        netuid: u16,
        block: Option<u64>,
        lite: bool,
    ) -> Result<Metagraph, ChainError>;

    async fn get_liquidity(
        &self,
        coldkey: &str,
        netuid: u16,
        block: Option<u64>,
    ) -> Result<Vec<LiquidityPosition>, ChainError>;

    async fn submit_weights(
        &self,
        netuid: u16,
        uids: Vec<u16>,
        weights: Vec<f64>,
        version: u64,
    ) -> Result<(), ChainError>;
}

/// Derive the effective epoch length from a tempo probe.
///
/// The chain sometimes includes a boundary block, so the derived length
/// may come out one above the tempo; anything else is treated as a failed
/// probe and falls back to `tempo + 1`. Callers re-probe at every epoch
/// head since the length can shift by one between epochs.
pub fn derive_epoch_length(tempo: u64, head: u64, next_epoch_start: u64) -> u64 {
    let tempo = tempo.max(1);
    let derived = next_epoch_start.saturating_sub(head - head % tempo);
    if derived == tempo || derived == tempo + 1 {
        derived
    } else {
        tempo + 1
    }
}
