use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

use oceans_common::OceansError;

/// One snapshot of a voter's full subnet-weights vector.
/// Natural key: `(voter_hotkey, block_height)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoteSnapshot {
    pub id: u64,
    pub voter_hotkey: String,
    pub block_height: u64,
    pub voter_stake: f64,
    pub weights: BTreeMap<u16, f64>,
    pub ts: DateTime<Utc>,
}

impl VoteSnapshot {
    pub fn new(
        voter_hotkey: String,
        block_height: u64,
        voter_stake: f64,
        weights: BTreeMap<u16, f64>,
    ) -> Self {
        Self {
            id: 0,
            voter_hotkey,
            block_height,
            voter_stake,
            weights,
            ts: Utc::now(),
        }
    }
}

/// Liquidity provided by one coldkey in one subnet at a given block.
/// Natural key: `(wallet_hotkey, subnet_id, block_height)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySnapshot {
    pub id: u64,
    pub wallet_hotkey: String,
    pub subnet_id: u16,
    pub tao_value: f64,
    pub block_height: u64,
    pub ts: DateTime<Utc>,
}

impl LiquiditySnapshot {
    pub fn new(wallet_hotkey: String, subnet_id: u16, tao_value: f64, block_height: u64) -> Self {
        Self {
            id: 0,
            wallet_hotkey,
            subnet_id,
            tao_value,
            block_height,
            ts: Utc::now(),
        }
    }
}

/// Per-epoch derived state. Replaced as a whole by each producer; no
/// partial updates mid-epoch.
#[derive(Debug, Clone, Default)]
struct EpochScratch {
    subnet_weights: BTreeMap<u16, f64>,
    master_subnet_weights: BTreeMap<u16, f64>,
    liquidity: BTreeMap<u16, BTreeMap<u16, f64>>,
    latest_votes: Vec<VoteSnapshot>,
}

/// Durable snapshot store plus the in-memory scratch the pipeline stages
/// hand data through within one epoch tick.
///
/// Snapshots are keyed by their natural key, so inserts are idempotent at
/// the store level even if a caller skips the `*_changed` probe. There is
/// no eviction.
pub struct StateCache {
    db: sled::Db,
    votes: sled::Tree,
    liquidity: sled::Tree,
    scratch: RwLock<EpochScratch>,
}

fn storage_err(e: sled::Error) -> OceansError {
    OceansError::Storage(e.to_string())
}

fn vote_key(voter_hotkey: &str, block_height: u64) -> Vec<u8> {
    format!("{voter_hotkey}@{block_height}").into_bytes()
}

fn liquidity_key(wallet_hotkey: &str, subnet_id: u16, block_height: u64) -> Vec<u8> {
    format!("{wallet_hotkey}@{subnet_id}@{block_height}").into_bytes()
}

impl StateCache {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, OceansError> {
        let db = sled::open(path).map_err(storage_err)?;
        let votes = db.open_tree("vote_snapshots").map_err(storage_err)?;
        let liquidity = db.open_tree("liquidity_snapshots").map_err(storage_err)?;
        Ok(Self {
            db,
            votes,
            liquidity,
            scratch: RwLock::new(EpochScratch::default()),
        })
    }

    // ------------------------------------------------------------------
    // Votes
    // ------------------------------------------------------------------

    /// All vote snapshots, newest first: `(block_height DESC, id DESC)`.
    pub fn latest_votes(&self) -> Result<Vec<VoteSnapshot>, OceansError> {
        let mut rows = Vec::new();
        for entry in self.votes.iter() {
            let (_, value) = entry.map_err(storage_err)?;
            rows.push(serde_json::from_slice::<VoteSnapshot>(&value)?);
        }
        rows.sort_by(|a, b| {
            b.block_height
                .cmp(&a.block_height)
                .then(b.id.cmp(&a.id))
        });
        Ok(rows)
    }

    /// Bulk-insert vote snapshots atomically, stamping fresh row ids.
    pub fn persist_votes(&self, snapshots: &mut [VoteSnapshot]) -> Result<(), OceansError> {
        if snapshots.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        for snap in snapshots.iter_mut() {
            snap.id = self.db.generate_id().map_err(storage_err)?;
            batch.insert(
                vote_key(&snap.voter_hotkey, snap.block_height),
                serde_json::to_vec(snap)?,
            );
        }
        self.votes.apply_batch(batch).map_err(storage_err)?;
        self.db.flush().map_err(storage_err)?;
        debug!("Persisted {} vote snapshots", snapshots.len());
        Ok(())
    }

    /// True iff no snapshot with this natural key exists yet.
    pub fn votes_changed(
        &self,
        block_height: u64,
        voter_hotkey: &str,
    ) -> Result<bool, OceansError> {
        let exists = self
            .votes
            .contains_key(vote_key(voter_hotkey, block_height))
            .map_err(storage_err)?;
        Ok(!exists)
    }

    // ------------------------------------------------------------------
    // Liquidity
    // ------------------------------------------------------------------

    /// All liquidity snapshots, newest first: `(block_height DESC, id DESC)`.
    pub fn latest_liquidity(&self) -> Result<Vec<LiquiditySnapshot>, OceansError> {
        let mut rows = Vec::new();
        for entry in self.liquidity.iter() {
            let (_, value) = entry.map_err(storage_err)?;
            rows.push(serde_json::from_slice::<LiquiditySnapshot>(&value)?);
        }
        rows.sort_by(|a, b| {
            b.block_height
                .cmp(&a.block_height)
                .then(b.id.cmp(&a.id))
        });
        Ok(rows)
    }

    /// Bulk-insert liquidity snapshots atomically, stamping fresh row ids.
    pub fn persist_liquidity(
        &self,
        snapshots: &mut [LiquiditySnapshot],
    ) -> Result<(), OceansError> {
        if snapshots.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        for snap in snapshots.iter_mut() {
            snap.id = self.db.generate_id().map_err(storage_err)?;
            batch.insert(
                liquidity_key(&snap.wallet_hotkey, snap.subnet_id, snap.block_height),
                serde_json::to_vec(snap)?,
            );
        }
        self.liquidity.apply_batch(batch).map_err(storage_err)?;
        self.db.flush().map_err(storage_err)?;
        debug!("Persisted {} liquidity snapshots", snapshots.len());
        Ok(())
    }

    /// True iff no snapshot with this natural key exists yet.
    pub fn liquidity_changed(
        &self,
        wallet_hotkey: &str,
        subnet_id: u16,
        block_height: u64,
    ) -> Result<bool, OceansError> {
        let exists = self
            .liquidity
            .contains_key(liquidity_key(wallet_hotkey, subnet_id, block_height))
            .map_err(storage_err)?;
        Ok(!exists)
    }

    // ------------------------------------------------------------------
    // Epoch scratch
    // ------------------------------------------------------------------

    fn read_scratch(&self) -> std::sync::RwLockReadGuard<'_, EpochScratch> {
        self.scratch.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_scratch(&self) -> std::sync::RwLockWriteGuard<'_, EpochScratch> {
        self.scratch.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subnet_weights(&self) -> BTreeMap<u16, f64> {
        self.read_scratch().subnet_weights.clone()
    }

    pub fn set_subnet_weights(&self, weights: BTreeMap<u16, f64>) {
        self.write_scratch().subnet_weights = weights;
    }

    pub fn master_subnet_weights(&self) -> BTreeMap<u16, f64> {
        self.read_scratch().master_subnet_weights.clone()
    }

    pub fn set_master_subnet_weights(&self, weights: BTreeMap<u16, f64>) {
        self.write_scratch().master_subnet_weights = weights;
    }

    pub fn liquidity(&self) -> BTreeMap<u16, BTreeMap<u16, f64>> {
        self.read_scratch().liquidity.clone()
    }

    pub fn set_liquidity(&self, liquidity: BTreeMap<u16, BTreeMap<u16, f64>>) {
        self.write_scratch().liquidity = liquidity;
    }

    /// Most recent fetch's persisted snapshots (may be empty).
    pub fn latest_votes_scratch(&self) -> Vec<VoteSnapshot> {
        self.read_scratch().latest_votes.clone()
    }

    pub fn set_latest_votes(&self, votes: Vec<VoteSnapshot>) {
        self.write_scratch().latest_votes = votes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn open_cache() -> (TempDir, StateCache) {
        let dir = TempDir::new("oceans-cache-test").unwrap();
        let cache = StateCache::open(dir.path()).unwrap();
        (dir, cache)
    }

    fn vote_snapshot(hotkey: &str, block: u64) -> VoteSnapshot {
        let weights = (1..=128u16).map(|sid| (sid, 1.0 / 128.0)).collect();
        VoteSnapshot::new(hotkey.to_string(), block, 1.0, weights)
    }

    #[test]
    fn persist_and_fetch_votes_newest_first() {
        let (_dir, cache) = open_cache();
        let mut batch = vec![vote_snapshot("hk-A", 10), vote_snapshot("hk-B", 11)];
        cache.persist_votes(&mut batch).unwrap();

        let latest = cache.latest_votes().unwrap();
        assert_eq!(
            latest.iter().map(|v| v.block_height).collect::<Vec<_>>(),
            vec![11, 10]
        );
        assert_eq!(latest[0].voter_hotkey, "hk-B");
        assert_eq!(latest[1].voter_hotkey, "hk-A");

        for v in &latest {
            assert_eq!(v.weights.len(), 128);
            let sum: f64 = v.weights.values().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn same_block_rows_are_ordered_by_id_desc() {
        let (_dir, cache) = open_cache();
        let mut batch = vec![vote_snapshot("hk-A", 7), vote_snapshot("hk-B", 7)];
        cache.persist_votes(&mut batch).unwrap();

        let latest = cache.latest_votes().unwrap();
        assert!(latest[0].id > latest[1].id);
    }

    #[test]
    fn votes_changed_reports_unseen_pairs() {
        let (_dir, cache) = open_cache();
        assert!(cache.votes_changed(99, "hk-C").unwrap());

        cache
            .persist_votes(&mut [vote_snapshot("hk-C", 99)])
            .unwrap();
        assert!(!cache.votes_changed(99, "hk-C").unwrap());
        assert!(cache.votes_changed(100, "hk-C").unwrap());
    }

    #[test]
    fn persist_and_fetch_liquidity() {
        let (_dir, cache) = open_cache();
        let mut batch = vec![
            LiquiditySnapshot::new("wallet-1".into(), 1, 1_000.0, 1234),
            LiquiditySnapshot::new("wallet-2".into(), 2, 2_000.0, 1235),
        ];
        cache.persist_liquidity(&mut batch).unwrap();

        let latest = cache.latest_liquidity().unwrap();
        assert_eq!(
            latest.iter().map(|l| l.block_height).collect::<Vec<_>>(),
            vec![1235, 1234]
        );
        assert_eq!(latest[0].tao_value, 2_000.0);
        assert_eq!(latest[1].tao_value, 1_000.0);
    }

    #[test]
    fn natural_key_appears_at_most_once() {
        let (_dir, cache) = open_cache();
        let mut first = vec![LiquiditySnapshot::new("wallet-1".into(), 1, 100.0, 7)];
        cache.persist_liquidity(&mut first).unwrap();
        // Same natural key inserted again does not create a second row
        let mut dup = vec![LiquiditySnapshot::new("wallet-1".into(), 1, 100.0, 7)];
        cache.persist_liquidity(&mut dup).unwrap();

        assert_eq!(cache.latest_liquidity().unwrap().len(), 1);
        assert!(!cache.liquidity_changed("wallet-1", 1, 7).unwrap());
    }

    #[test]
    fn scratch_values_are_replaced_whole() {
        let (_dir, cache) = open_cache();
        assert!(cache.subnet_weights().is_empty());

        cache.set_subnet_weights([(10u16, 0.5), (11u16, 0.5)].into_iter().collect());
        assert_eq!(cache.subnet_weights().len(), 2);

        cache.set_subnet_weights(BTreeMap::new());
        assert!(cache.subnet_weights().is_empty());

        let mut liq = BTreeMap::new();
        liq.insert(10u16, [(0u16, 100.0)].into_iter().collect());
        cache.set_liquidity(liq);
        assert_eq!(cache.liquidity()[&10][&0], 100.0);
    }
}
