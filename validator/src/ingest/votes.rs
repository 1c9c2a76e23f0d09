use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info, warn};
use metrics::counter;

use oceans_common::api::VoteSource;
use oceans_common::OceansError;

use crate::metrics::VOTE_SNAPSHOTS_PERSISTED;
use crate::state_cache::{StateCache, VoteSnapshot};

/// Ingests the latest vote set once per epoch: fetch, aggregate
/// stake-weighted subnet weights, publish the normalized vector on the
/// cache, persist one snapshot per voter.
pub struct VoteIngestor {
    cache: Arc<StateCache>,
    client: Arc<dyn VoteSource>,
}

impl VoteIngestor {
    pub fn new(cache: Arc<StateCache>, client: Arc<dyn VoteSource>) -> Self {
        Self { cache, client }
    }

    /// Fetch -> aggregate -> normalize -> cache -> persist.
    ///
    /// Returns one `(voter_stake, weights)` pair per voter in input
    /// order, with the weights exactly as submitted (no normalization).
    pub async fn fetch_and_store(
        &self,
    ) -> Result<Vec<(f64, BTreeMap<u16, f64>)>, OceansError> {
        let votes = self.client.get_latest_votes().await?;
        info!("[VoteIngestor] Fetched {} votes", votes.len());

        if votes.is_empty() {
            warn!("[VoteIngestor] Empty vote list - all weights = 0");
            self.cache.set_subnet_weights(BTreeMap::new());
            self.cache.set_latest_votes(Vec::new());
            return Ok(Vec::new());
        }

        // Stake-weighted raw mass per subnet. Voters are not required to
        // pre-normalize; larger stakes simply carry more mass.
        let mut raw: BTreeMap<u16, f64> = BTreeMap::new();
        for vote in &votes {
            for (sid, weight) in &vote.weights {
                *raw.entry(*sid).or_default() += weight * vote.voter_stake;
            }
        }

        let total: f64 = raw.values().sum();
        info!(
            "[VoteIngestor] Aggregated stake-weighted weights for {} subnets (sum = {:.6})",
            raw.len(),
            total
        );

        let normalized: BTreeMap<u16, f64> = if total > 0.0 {
            raw.iter().map(|(sid, w)| (*sid, w / total)).collect()
        } else {
            warn!(
                "[VoteIngestor] Total stake-weighted mass is zero - \
                 all subnets will receive 0 reward weight"
            );
            BTreeMap::new()
        };
        self.cache.set_subnet_weights(normalized);

        // One snapshot per voter, carrying the whole raw weights map.
        let mut snapshots: Vec<VoteSnapshot> = Vec::new();
        for vote in &votes {
            if !self
                .cache
                .votes_changed(vote.block_height, &vote.voter_hotkey)?
            {
                continue;
            }
            snapshots.push(VoteSnapshot::new(
                vote.voter_hotkey.clone(),
                vote.block_height,
                vote.voter_stake,
                vote.weights.clone(),
            ));
        }

        if !snapshots.is_empty() {
            self.cache.persist_votes(&mut snapshots)?;
            counter!(VOTE_SNAPSHOTS_PERSISTED).increment(snapshots.len() as u64);
            info!(
                "[VoteIngestor] Persisted {} new vote snapshots",
                snapshots.len()
            );
        } else {
            debug!("[VoteIngestor] No new vote snapshots to persist");
        }
        self.cache.set_latest_votes(snapshots);

        if log::log_enabled!(log::Level::Debug) {
            let preview: Vec<String> = votes
                .iter()
                .take(5)
                .map(|v| {
                    let head: String = v.voter_hotkey.chars().take(6).collect();
                    format!("({head}.., stake={}, {} weights)", v.voter_stake, v.weights.len())
                })
                .collect();
            debug!("[VoteIngestor] First voters preview: {:?}", preview);
        }

        Ok(votes
            .into_iter()
            .map(|v| (v.voter_stake, v.weights))
            .collect())
    }
}
