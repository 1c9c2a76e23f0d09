//! End-to-end pipeline tests with a mocked chain node and vote source:
//! ingest -> cache -> rewards, including dedup and fallback behavior.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tempdir::TempDir;

use oceans_common::api::{Vote, VoteSource};
use oceans_common::chain::{ChainClient, LiquidityPosition, Metagraph, RAO_PER_TAO};
use oceans_common::error::{ApiError, ChainError};

use oceans_validator::ingest::{LiquidityIngestor, VoteIngestor};
use oceans_validator::rewards::RewardCalculator;
use oceans_validator::state_cache::StateCache;

const TOL: f64 = 1e-9;
const SOURCE_NETUID: u16 = 66;
const BLOCK: u64 = 7;

// ---------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------

struct StaticVotes(Vec<Vote>);

#[async_trait]
impl VoteSource for StaticVotes {
    async fn get_latest_votes(&self) -> Result<Vec<Vote>, ApiError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
struct MockChain {
    block: u64,
    metagraphs: HashMap<u16, Metagraph>,
    // (coldkey, subnet) -> positions in RAO
    positions: HashMap<(String, u16), Vec<u64>>,
    failing_coldkeys: HashSet<String>,
}

#[async_trait]
impl ChainClient for MockChain {
    async fn current_block(&self) -> Result<u64, ChainError> {
        Ok(self.block)
    }

    async fn tempo(&self, _netuid: u16) -> Result<u64, ChainError> {
        Ok(360)
    }

    async fn next_epoch_start(&self, _netuid: u16) -> Result<u64, ChainError> {
        Ok(self.block - self.block % 360 + 360)
    }

    async fn get_metagraph(
        &self,
        netuid: u16,
        _block: Option<u64>,
        _lite: bool,
    ) -> Result<Metagraph, ChainError> {
        self.metagraphs
            .get(&netuid)
            .cloned()
            .ok_or_else(|| ChainError::UnexpectedPayload(format!("no metagraph for {netuid}")))
    }

    async fn get_liquidity(
        &self,
        coldkey: &str,
        netuid: u16,
        _block: Option<u64>,
    ) -> Result<Vec<LiquidityPosition>, ChainError> {
        if self.failing_coldkeys.contains(coldkey) {
            return Err(ChainError::Connection(format!("{coldkey} unreachable")));
        }
        Ok(self
            .positions
            .get(&(coldkey.to_string(), netuid))
            .map(|raos| {
                raos.iter()
                    .map(|rao| LiquidityPosition { liquidity: *rao })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn submit_weights(
        &self,
        _netuid: u16,
        _uids: Vec<u16>,
        _weights: Vec<f64>,
        _version: u64,
    ) -> Result<(), ChainError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Fixture builders
// ---------------------------------------------------------------------

fn open_cache() -> (TempDir, Arc<StateCache>) {
    let dir = TempDir::new("oceans-pipeline-test").unwrap();
    let cache = Arc::new(StateCache::open(dir.path()).unwrap());
    (dir, cache)
}

fn vote(hotkey: &str, subnet: u16, weight: f64, stake: f64, block: u64) -> Vote {
    Vote {
        voter_hotkey: hotkey.to_string(),
        block_height: block,
        voter_stake: stake,
        weights: [(subnet, weight)].into_iter().collect(),
        timestamp: None,
    }
}

/// Two coldkeys per subnet across subnets 1..=3, deterministic amounts:
/// `ck{X}a` holds 100*X TAO and `ck{X}b` 200*X TAO on subnet X only.
fn liquidity_chain() -> MockChain {
    let mut chain = MockChain {
        block: BLOCK,
        ..Default::default()
    };

    let all_coldkeys: Vec<String> = (1..=3u16)
        .flat_map(|s| [format!("ck{s}a"), format!("ck{s}b")])
        .collect();

    // Source metagraph: every coldkey, with a duplicate to exercise dedup
    let mut source_coldkeys = all_coldkeys.clone();
    source_coldkeys.push("ck1a".to_string());
    chain.metagraphs.insert(
        SOURCE_NETUID,
        Metagraph {
            uids: (0..source_coldkeys.len() as u16).collect(),
            coldkeys: source_coldkeys,
        },
    );

    // Target metagraphs: all coldkeys registered, uid = index
    for subnet in 1..=3u16 {
        chain.metagraphs.insert(
            subnet,
            Metagraph {
                uids: (0..all_coldkeys.len() as u16).collect(),
                coldkeys: all_coldkeys.clone(),
            },
        );
    }

    for subnet in 1..=3u16 {
        chain.positions.insert(
            (format!("ck{subnet}a"), subnet),
            vec![100 * subnet as u64 * RAO_PER_TAO],
        );
        chain.positions.insert(
            (format!("ck{subnet}b"), subnet),
            vec![100 * subnet as u64 * RAO_PER_TAO, 100 * subnet as u64 * RAO_PER_TAO],
        );
    }

    chain
}

fn liquidity_ingestor(cache: Arc<StateCache>, chain: Arc<MockChain>) -> LiquidityIngestor {
    LiquidityIngestor::new(
        cache,
        chain,
        (1..=3u16).collect::<BTreeSet<_>>(),
        SOURCE_NETUID,
        4,
        1,
    )
}

// ---------------------------------------------------------------------
// Vote ingest
// ---------------------------------------------------------------------

#[tokio::test]
async fn vote_aggregation_normalizes_across_voters() {
    let (_dir, cache) = open_cache();
    let votes = vec![
        vote("hk-voter-0001", 1, 0.3, 1.0, 123),
        vote("hk-voter-0002", 1, 0.7, 1.0, 123),
        vote("hk-voter-0003", 2, 1.0, 1.0, 123),
    ];
    let ingestor = VoteIngestor::new(cache.clone(), Arc::new(StaticVotes(votes)));

    let pairs = ingestor.fetch_and_store().await.unwrap();
    assert_eq!(pairs.len(), 3);
    // input order, raw weights untouched
    assert_eq!(pairs[0].0, 1.0);
    assert_eq!(pairs[0].1[&1], 0.3);

    let weights = cache.subnet_weights();
    assert_eq!(weights.keys().copied().collect::<Vec<_>>(), vec![1, 2]);
    assert!((weights[&1] - 0.5).abs() < TOL);
    assert!((weights[&2] - 0.5).abs() < TOL);
    assert!((weights.values().sum::<f64>() - 1.0).abs() < TOL);
}

#[tokio::test]
async fn stake_scales_vote_influence() {
    let (_dir, cache) = open_cache();
    let votes = vec![
        vote("hk-voter-0001", 1, 1.0, 3.0, 50),
        vote("hk-voter-0002", 2, 1.0, 1.0, 50),
    ];
    let ingestor = VoteIngestor::new(cache.clone(), Arc::new(StaticVotes(votes)));
    ingestor.fetch_and_store().await.unwrap();

    let weights = cache.subnet_weights();
    assert!((weights[&1] - 0.75).abs() < TOL);
    assert!((weights[&2] - 0.25).abs() < TOL);
}

#[tokio::test]
async fn empty_vote_payload_publishes_empty_weights() {
    let (_dir, cache) = open_cache();
    let ingestor = VoteIngestor::new(cache.clone(), Arc::new(StaticVotes(Vec::new())));

    let pairs = ingestor.fetch_and_store().await.unwrap();
    assert!(pairs.is_empty());
    assert!(cache.subnet_weights().is_empty());
    assert!(cache.latest_votes().unwrap().is_empty());
}

#[tokio::test]
async fn zero_mass_votes_publish_empty_weights() {
    let (_dir, cache) = open_cache();
    let votes = vec![
        vote("hk-voter-000a", 4, 0.0, 1.0, 222),
        vote("hk-voter-000b", 5, 0.0, 1.0, 222),
    ];
    let ingestor = VoteIngestor::new(cache.clone(), Arc::new(StaticVotes(votes)));

    ingestor.fetch_and_store().await.unwrap();
    assert!(cache.subnet_weights().is_empty());
    // snapshots are still persisted; only the published vector is empty
    assert_eq!(cache.latest_votes().unwrap().len(), 2);
}

#[tokio::test]
async fn vote_ingest_is_idempotent_on_unchanged_input() {
    let (_dir, cache) = open_cache();
    let votes = vec![
        vote("hk-voter-0001", 1, 0.3, 1.0, 123),
        vote("hk-voter-0002", 1, 0.7, 1.0, 123),
        vote("hk-voter-0003", 2, 1.0, 1.0, 123),
    ];
    let ingestor = VoteIngestor::new(cache.clone(), Arc::new(StaticVotes(votes)));

    ingestor.fetch_and_store().await.unwrap();
    let first_weights = cache.subnet_weights();
    assert_eq!(cache.latest_votes_scratch().len(), 3);
    assert_eq!(cache.latest_votes().unwrap().len(), 3);

    ingestor.fetch_and_store().await.unwrap();
    assert_eq!(cache.latest_votes_scratch().len(), 0);
    assert_eq!(cache.latest_votes().unwrap().len(), 3);
    assert_eq!(cache.subnet_weights(), first_weights);
}

// ---------------------------------------------------------------------
// Liquidity ingest
// ---------------------------------------------------------------------

#[tokio::test]
async fn liquidity_ingest_persists_and_deduplicates() {
    let (_dir, cache) = open_cache();
    let chain = Arc::new(liquidity_chain());
    let ingestor = liquidity_ingestor(cache.clone(), chain);

    let first = ingestor.fetch_and_store(None, Some(BLOCK)).await.unwrap();
    assert_eq!(first.len(), 6); // 2 coldkeys x 3 subnets

    let stored = cache.latest_liquidity().unwrap();
    assert_eq!(stored.len(), 6);
    for snap in &stored {
        let subnet = snap.subnet_id as f64;
        let expected = if snap.wallet_hotkey.ends_with('a') {
            100.0 * subnet
        } else {
            200.0 * subnet
        };
        assert!((snap.tao_value - expected).abs() < TOL);
        assert_eq!(snap.block_height, BLOCK);
    }

    // second identical run persists nothing and leaves the row count alone
    let second = ingestor.fetch_and_store(None, Some(BLOCK)).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(cache.latest_liquidity().unwrap().len(), 6);
}

#[tokio::test]
async fn liquidity_map_is_keyed_by_uid() {
    let (_dir, cache) = open_cache();
    let chain = Arc::new(liquidity_chain());
    let ingestor = liquidity_ingestor(cache.clone(), chain.clone());

    ingestor.fetch_and_store(None, Some(BLOCK)).await.unwrap();

    let map = cache.liquidity();
    for subnet in 1..=3u16 {
        let by_uid = &map[&subnet];
        assert_eq!(by_uid.len(), 2);
        let mg = &chain.metagraphs[&subnet];
        let uid_a = mg.uid_of(&format!("ck{subnet}a")).unwrap();
        let uid_b = mg.uid_of(&format!("ck{subnet}b")).unwrap();
        assert!((by_uid[&uid_a] - 100.0 * subnet as f64).abs() < TOL);
        assert!((by_uid[&uid_b] - 200.0 * subnet as f64).abs() < TOL);
    }
}

#[tokio::test]
async fn liquidity_ingest_refuses_inactive_and_root_subnets() {
    let (_dir, cache) = open_cache();
    let chain = Arc::new(liquidity_chain());
    let ingestor = liquidity_ingestor(cache.clone(), chain);

    assert!(ingestor
        .fetch_and_store(Some(0), Some(BLOCK))
        .await
        .unwrap()
        .is_empty());
    assert!(ingestor
        .fetch_and_store(Some(42), Some(BLOCK))
        .await
        .unwrap()
        .is_empty());
    assert!(cache.latest_liquidity().unwrap().is_empty());
}

#[tokio::test]
async fn single_subnet_fetch_only_touches_that_subnet() {
    let (_dir, cache) = open_cache();
    let chain = Arc::new(liquidity_chain());
    let ingestor = liquidity_ingestor(cache.clone(), chain);

    let rows = ingestor.fetch_and_store(Some(2), Some(BLOCK)).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.subnet_id == 2));
    assert_eq!(cache.liquidity().keys().copied().collect::<Vec<_>>(), vec![2]);
}

#[tokio::test]
async fn failing_coldkey_yields_empty_unit_not_abort() {
    let (_dir, cache) = open_cache();
    let mut chain = liquidity_chain();
    chain.failing_coldkeys.insert("ck2a".to_string());
    let ingestor = liquidity_ingestor(cache.clone(), Arc::new(chain));

    let rows = ingestor.fetch_and_store(None, Some(BLOCK)).await.unwrap();
    // ck2a dropped, everything else unaffected
    assert_eq!(rows.len(), 5);
    assert!(!rows
        .iter()
        .any(|r| r.wallet_hotkey == "ck2a" && r.subnet_id == 2));
}

// ---------------------------------------------------------------------
// Full tick: votes -> liquidity -> rewards
// ---------------------------------------------------------------------

#[tokio::test]
async fn serial_tick_produces_normalized_rewards() {
    let (_dir, cache) = open_cache();
    let chain = Arc::new(liquidity_chain());

    let votes = vec![
        vote("hk-voter-0001", 1, 0.5, 1.0, 9000),
        vote("hk-voter-0002", 2, 0.5, 1.0, 9000),
    ];
    let vote_ingestor = VoteIngestor::new(cache.clone(), Arc::new(StaticVotes(votes)));
    let liq_ingestor = liquidity_ingestor(cache.clone(), chain.clone());
    let calculator = RewardCalculator::new(cache.clone());

    vote_ingestor.fetch_and_store().await.unwrap();
    liq_ingestor.fetch_and_store(None, Some(BLOCK)).await.unwrap();

    let metagraph = chain.metagraphs[&1].clone();
    let rewards = calculator.compute(&metagraph);

    let sum: f64 = rewards.values().sum();
    assert!((sum - 1.0).abs() < 1e-6);
    // Only subnets 1 and 2 carry master weight; each splits 1:2 between
    // its `a` (100X) and `b` (200X) coldkeys.
    let mg = &chain.metagraphs[&1];
    let uid_1a = mg.uid_of("ck1a").unwrap();
    let uid_1b = mg.uid_of("ck1b").unwrap();
    assert!((rewards[&uid_1a] - 0.5 / 3.0).abs() < 1e-6);
    assert!((rewards[&uid_1b] - 1.0 / 3.0).abs() < 1e-6);
    // subnet 3 received no vote weight, so its miners get nothing
    assert!(!rewards.contains_key(&mg.uid_of("ck3a").unwrap()));
    assert!(!rewards.contains_key(&mg.uid_of("ck3b").unwrap()));
}

#[tokio::test]
async fn zero_mass_tick_falls_back_to_uniform() {
    let (_dir, cache) = open_cache();
    let chain = Arc::new(liquidity_chain());

    // all-zero weights: published vector is empty, master becomes empty
    let votes = vec![vote("hk-voter-0001", 1, 0.0, 1.0, 9001)];
    let vote_ingestor = VoteIngestor::new(cache.clone(), Arc::new(StaticVotes(votes)));
    let liq_ingestor = liquidity_ingestor(cache.clone(), chain.clone());
    let calculator = RewardCalculator::new(cache.clone());

    vote_ingestor.fetch_and_store().await.unwrap();
    liq_ingestor.fetch_and_store(None, Some(BLOCK)).await.unwrap();

    let metagraph = chain.metagraphs[&1].clone();
    let rewards = calculator.compute(&metagraph);

    let uniform = 1.0 / metagraph.uids.len() as f64;
    assert_eq!(rewards.len(), metagraph.uids.len());
    for reward in rewards.values() {
        assert!((reward - uniform).abs() < TOL);
    }
}
