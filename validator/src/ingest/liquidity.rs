use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use log::{debug, info, warn};
use metrics::counter;
use tokio::sync::Semaphore;

use oceans_common::chain::ChainClient;
use oceans_common::error::ChainError;
use oceans_common::OceansError;

use crate::metrics::LIQUIDITY_SNAPSHOTS_PERSISTED;
use crate::state_cache::{LiquiditySnapshot, StateCache};

/// Pulls liquidity positions from the chain, persists only new
/// `(coldkey, subnet, block)` snapshots and publishes the
/// `subnet -> uid -> TAO` map for the reward step.
///
/// Coldkeys to query come from the source subnet's metagraph (the
/// validator's own subnet) and are reused for every target subnet.
pub struct LiquidityIngestor {
    cache: Arc<StateCache>,
    chain: Arc<dyn ChainClient>,
    active_subnets: BTreeSet<u16>,
    source_netuid: u16,
    max_concurrency: usize,
    refresh_blocks: u64,
    // coldkey -> uid per target subnet; populated lazily, never evicted
    // during a run
    uid_index: Mutex<HashMap<(String, u16), u16>>,
    last_fetch_block: Mutex<Option<u64>>,
}

impl LiquidityIngestor {
    pub fn new(
        cache: Arc<StateCache>,
        chain: Arc<dyn ChainClient>,
        active_subnets: BTreeSet<u16>,
        source_netuid: u16,
        max_concurrency: usize,
        refresh_blocks: u64,
    ) -> Self {
        Self {
            cache,
            chain,
            active_subnets,
            source_netuid,
            max_concurrency: max_concurrency.max(1),
            refresh_blocks,
            uid_index: Mutex::new(HashMap::new()),
            last_fetch_block: Mutex::new(None),
        }
    }

    /// Collect liquidity, persist only new `(coldkey, subnet, block)`
    /// combinations and return the list of persisted snapshots.
    ///
    /// With `netuid = None` all active subnets are queried in ascending
    /// order; a requested subnet outside the active set yields an empty
    /// result with a warning. Subnet 0 is always refused.
    pub async fn fetch_and_store(
        &self,
        netuid: Option<u16>,
        block: Option<u64>,
    ) -> Result<Vec<LiquiditySnapshot>, OceansError> {
        let targets: Vec<u16> = match netuid {
            Some(0) => {
                warn!("[LiquidityIngestor] Subnet 0 is not a valid target");
                return Ok(Vec::new());
            }
            Some(id) if !self.active_subnets.contains(&id) => {
                warn!(
                    "[LiquidityIngestor] Subnet {} is not in the active set, skipping",
                    id
                );
                return Ok(Vec::new());
            }
            Some(id) => vec![id],
            None => self.active_subnets.iter().copied().collect(),
        };

        let block_height = match block {
            Some(b) => b,
            None => {
                let head = self.chain.current_block().await?;
                let last = *lock(&self.last_fetch_block);
                if let Some(last) = last {
                    if head.saturating_sub(last) < self.refresh_blocks {
                        debug!(
                            "[LiquidityIngestor] Head {} within {} blocks of last fetch {}, skipping",
                            head, self.refresh_blocks, last
                        );
                        return Ok(Vec::new());
                    }
                }
                head
            }
        };

        // Coldkeys are loaded once from the source subnet and reused for
        // every target subnet, first occurrence wins.
        let source = self
            .chain
            .get_metagraph(self.source_netuid, block, true)
            .await?;
        let mut seen = HashSet::new();
        let mut coldkeys: Vec<String> = Vec::with_capacity(source.coldkeys.len());
        for ck in &source.coldkeys {
            if seen.insert(ck.clone()) {
                coldkeys.push(ck.clone());
            }
        }
        if coldkeys.is_empty() {
            return Err(ChainError::UnexpectedPayload(format!(
                "metagraph of subnet {} returned no coldkeys",
                self.source_netuid
            ))
            .into());
        }
        info!(
            "[LiquidityIngestor] Source metagraph fetched - {} miners, {} unique coldkeys",
            source.coldkeys.len(),
            coldkeys.len()
        );

        // Aggregate TAO per (coldkey, subnet). Subnets are walked
        // sequentially; coldkeys within one subnet fan out under the
        // semaphore.
        let mut aggregated: BTreeMap<(String, u16), f64> = BTreeMap::new();
        for subnet in &targets {
            self.populate_uid_index(*subnet, &coldkeys, block).await;

            let results = self
                .query_single_subnet(*subnet, &coldkeys, block)
                .await;
            for (coldkey, positions) in results {
                let tao_total: f64 = positions.iter().map(|p| p.tao_value()).sum();
                aggregated.insert((coldkey, *subnet), tao_total);
            }
        }

        // Persist only unseen (coldkey, subnet, block) triples with a
        // positive amount.
        let mut snapshots: Vec<LiquiditySnapshot> = Vec::new();
        for ((coldkey, subnet), tao_value) in &aggregated {
            if *tao_value <= 0.0 {
                continue;
            }
            if self
                .cache
                .liquidity_changed(coldkey, *subnet, block_height)?
            {
                snapshots.push(LiquiditySnapshot::new(
                    coldkey.clone(),
                    *subnet,
                    *tao_value,
                    block_height,
                ));
            }
        }
        if !snapshots.is_empty() {
            self.cache.persist_liquidity(&mut snapshots)?;
            counter!(LIQUIDITY_SNAPSHOTS_PERSISTED).increment(snapshots.len() as u64);
        }
        info!(
            "[LiquidityIngestor] Stored {} new liquidity snapshots at block {}",
            snapshots.len(),
            block_height
        );

        // Publish subnet -> uid -> TAO, dropping coldkeys without a uid
        // on the target subnet.
        let mut liquidity_map: BTreeMap<u16, BTreeMap<u16, f64>> = BTreeMap::new();
        {
            let index = lock(&self.uid_index);
            for ((coldkey, subnet), tao_value) in &aggregated {
                if *tao_value <= 0.0 {
                    continue;
                }
                match index.get(&(coldkey.clone(), *subnet)) {
                    Some(uid) => {
                        liquidity_map
                            .entry(*subnet)
                            .or_default()
                            .insert(*uid, *tao_value);
                    }
                    None => debug!(
                        "[LiquidityIngestor] No uid for coldkey {} on subnet {}, dropping",
                        coldkey, subnet
                    ),
                }
            }
        }
        self.cache.set_liquidity(liquidity_map);

        if block.is_none() {
            *lock(&self.last_fetch_block) = Some(block_height);
        }

        Ok(snapshots)
    }

    /// Query every coldkey of one subnet in parallel, bounded by the
    /// configured concurrency. A failed coldkey query yields an empty
    /// position list and never aborts the subnet.
    async fn query_single_subnet(
        &self,
        subnet: u16,
        coldkeys: &[String],
        block: Option<u64>,
    ) -> Vec<(String, Vec<oceans_common::chain::LiquidityPosition>)> {
        debug!(
            "[LiquidityIngestor] Querying {} coldkeys on subnet {} (max_concurrency={})",
            coldkeys.len(),
            subnet,
            self.max_concurrency
        );
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let tasks = coldkeys.iter().cloned().map(|coldkey| {
            let semaphore = semaphore.clone();
            let chain = self.chain.clone();
            async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return (coldkey, Vec::new()),
                };
                match chain.get_liquidity(&coldkey, subnet, block).await {
                    Ok(positions) => (coldkey, positions),
                    Err(e) => {
                        let head: String = coldkey.chars().take(6).collect();
                        warn!(
                            "[LiquidityIngestor] [{}] error fetching positions on subnet {}: {}",
                            head, subnet, e
                        );
                        (coldkey, Vec::new())
                    }
                }
            }
        });
        join_all(tasks).await
    }

    /// Read the target subnet's metagraph when coldkeys are missing from
    /// the resolution index, and extend it. Entries are never evicted.
    async fn populate_uid_index(&self, subnet: u16, coldkeys: &[String], block: Option<u64>) {
        let missing = {
            let index = lock(&self.uid_index);
            coldkeys
                .iter()
                .any(|ck| !index.contains_key(&(ck.clone(), subnet)))
        };
        if !missing {
            return;
        }

        match self.chain.get_metagraph(subnet, block, true).await {
            Ok(metagraph) => {
                let mut index = lock(&self.uid_index);
                for (uid, coldkey) in metagraph.uids.iter().zip(metagraph.coldkeys.iter()) {
                    index.entry((coldkey.clone(), subnet)).or_insert(*uid);
                }
            }
            Err(e) => warn!(
                "[LiquidityIngestor] Failed to read metagraph of subnet {}: {}",
                subnet, e
            ),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
