use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};

use oceans_common::chain::Metagraph;

use crate::state_cache::StateCache;

/// Computes the per-miner reward weights for the current epoch:
///
/// `reward(uid) = sum over subnets of (lp_uid / total_lp) * master_weight`
///
/// normalized so the vector sums to 1, with a uniform fallback when the
/// accumulator stays at zero.
pub struct RewardCalculator {
    cache: Arc<StateCache>,
}

impl RewardCalculator {
    pub fn new(cache: Arc<StateCache>) -> Self {
        Self { cache }
    }

    pub fn compute(&self, metagraph: &Metagraph) -> BTreeMap<u16, f64> {
        let uids = &metagraph.uids;
        if uids.is_empty() {
            warn!("[RewardCalc] Metagraph contained no UIDs");
            return BTreeMap::new();
        }

        let master = self.build_master_vector();
        if log::log_enabled!(log::Level::Debug) {
            let sum: f64 = master.values().sum();
            debug!(
                "[RewardCalc] Master vector: {} subnets (sum = {:.6})",
                master.len(),
                sum
            );
        }
        if master.is_empty() {
            warn!("[RewardCalc] Master vector empty - all miners will be uniform");
        }

        let liquidity = self.cache.liquidity();
        let mut rewards: BTreeMap<u16, f64> = BTreeMap::new();

        for (subnet_id, subnet_weight) in &master {
            if *subnet_weight <= 0.0 {
                continue;
            }
            let Some(lp_by_uid) = liquidity.get(subnet_id) else {
                continue;
            };
            let total_lp: f64 = lp_by_uid.values().sum();
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "[RewardCalc] Subnet {}: total LP={:.9}, weight={:.6}",
                    subnet_id, total_lp, subnet_weight
                );
            }
            if total_lp <= 0.0 {
                // No liquidity yet, nothing to distribute here
                continue;
            }

            for (uid, lp_amount) in lp_by_uid {
                if *lp_amount <= 0.0 {
                    continue;
                }
                *rewards.entry(*uid).or_default() += lp_amount / total_lp * subnet_weight;
            }
        }

        let total: f64 = rewards.values().sum();
        if total > 0.0 {
            let rewards: BTreeMap<u16, f64> =
                rewards.iter().map(|(uid, r)| (*uid, r / total)).collect();
            info!(
                "[RewardCalc] Rewards normalized, {} active miners (sum = {:.6})",
                rewards.len(),
                rewards.values().sum::<f64>()
            );
            rewards
        } else {
            warn!("[RewardCalc] Reward vector zero - using uniform distribution");
            let uniform = 1.0 / uids.len() as f64;
            uids.iter().map(|uid| (*uid, uniform)).collect()
        }
    }

    /// `{subnet_id: weight}` with the weights summing to 1. Built from
    /// the fresh vote snapshots; falls back to the cached subnet weights
    /// when no fresh votes are present.
    fn build_master_vector(&self) -> BTreeMap<u16, f64> {
        let votes = self.cache.latest_votes_scratch();

        if votes.is_empty() {
            let cached = self.cache.subnet_weights();
            if !cached.is_empty() {
                info!("[RewardCalc] Using cached subnet weights (no fresh votes)");
            }
            return cached;
        }

        let mut raw: BTreeMap<u16, f64> = BTreeMap::new();
        let mut total_stake = 0.0;

        for snapshot in &votes {
            let stake = snapshot.voter_stake;
            if stake <= 0.0 || snapshot.weights.is_empty() {
                continue;
            }
            let weight_sum: f64 = snapshot.weights.values().sum();
            if weight_sum <= 0.0 {
                continue;
            }
            for (sid, w) in &snapshot.weights {
                *raw.entry(*sid).or_default() += stake * (w / weight_sum);
            }
            total_stake += stake;
        }

        if total_stake <= 0.0 {
            return BTreeMap::new();
        }

        let master: BTreeMap<u16, f64> = raw
            .iter()
            .map(|(sid, w)| (*sid, w / total_stake))
            .collect();
        self.cache.set_master_subnet_weights(master.clone());
        info!(
            "[RewardCalc] Master subnet vector: {} subnets (sum = {:.6})",
            master.len(),
            master.values().sum::<f64>()
        );
        master
    }
}
