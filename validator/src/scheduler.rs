use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use metrics::{counter, gauge};

use oceans_common::alerts::AlertSender;
use oceans_common::chain::{derive_epoch_length, ChainClient};
use oceans_common::config::{defaults, Config};
use oceans_common::OceansError;

use crate::ingest::{LiquidityIngestor, VoteIngestor};
use crate::metrics::{
    EPOCH_INDEX, REWARD_SUM, SUBNET_WEIGHT_SUM, WEIGHT_SUBMISSIONS, WEIGHT_SUBMISSION_FAILURES,
};
use crate::rewards::RewardCalculator;
use crate::state_cache::StateCache;

/// Backoff after a failed pipeline run (bootstrap or epoch head).
const PIPELINE_BACKOFF: Duration = Duration::from_secs(5);

/// Position of the current block within its epoch.
#[derive(Debug, Clone, Copy)]
struct EpochSnapshot {
    block: u64,
    start: u64,
    index: u64,
    length: u64,
}

/// Drives the whole validator: detects epoch boundaries, sleeps until
/// each new epoch head, then runs the ingest -> reward -> submit pipeline
/// exactly once per epoch. A bootstrap run happens immediately on start,
/// regardless of the position within the epoch.
pub struct EpochScheduler {
    chain: Arc<dyn ChainClient>,
    cache: Arc<StateCache>,
    votes: VoteIngestor,
    liquidity: LiquidityIngestor,
    rewards: RewardCalculator,
    alerts: AlertSender,
    config: Config,
    should_exit: Arc<AtomicBool>,
    epoch_len: Option<u64>,
    bootstrapped: bool,
    step: u64,
}

impl EpochScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainClient>,
        cache: Arc<StateCache>,
        votes: VoteIngestor,
        liquidity: LiquidityIngestor,
        rewards: RewardCalculator,
        alerts: AlertSender,
        config: Config,
    ) -> Self {
        Self {
            chain,
            cache,
            votes,
            liquidity,
            rewards,
            alerts,
            config,
            should_exit: Arc::new(AtomicBool::new(false)),
            epoch_len: None,
            bootstrapped: false,
            step: 0,
        }
    }

    /// Handle for requesting a cooperative stop from outside the loop.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.should_exit.clone()
    }

    fn should_exit(&self) -> bool {
        self.should_exit.load(Ordering::SeqCst)
    }

    /// Sleep in short slices so a stop request is honored at every sleep
    /// boundary.
    async fn sleep_cooperative(&self, duration: Duration) {
        let mut remaining = duration;
        while !remaining.is_zero() && !self.should_exit() {
            let slice = remaining.min(Duration::from_secs(1));
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
    }

    /// Probe the chain for the effective epoch length. The chain
    /// sometimes includes a boundary block, so the result may be
    /// `tempo + 1`; a failed probe falls back to `tempo + 1` as well.
    async fn discover_epoch_length(&mut self) -> u64 {
        let netuid = self.config.default_netuid;
        let tempo = match self.chain.tempo(netuid).await {
            Ok(t) if t > 0 => t,
            Ok(_) | Err(_) => {
                let fallback = (self.config.epoch_seconds as f64
                    / defaults::BLOCK_TIME_SECS)
                    .max(1.0) as u64;
                warn!(
                    "[epoch] tempo unavailable, falling back to {} blocks (EPOCH_SECONDS)",
                    fallback
                );
                fallback
            }
        };

        let length = match (
            self.chain.current_block().await,
            self.chain.next_epoch_start(netuid).await,
        ) {
            (Ok(head), Ok(next_head)) => derive_epoch_length(tempo, head, next_head),
            (head, next_head) => {
                let err = head.err().or(next_head.err());
                if let Some(e) = err {
                    warn!("[epoch] probe error: {}", e);
                }
                tempo + 1
            }
        };

        if self.epoch_len != Some(length) {
            info!("[epoch] length = {}", length);
        }
        self.epoch_len = Some(length);
        length
    }

    async fn epoch_snapshot(&mut self) -> Result<EpochSnapshot, OceansError> {
        let block = self.chain.current_block().await?;
        let length = match self.epoch_len {
            Some(len) => len,
            None => self.discover_epoch_length().await,
        };
        let start = block - (block % length);
        Ok(EpochSnapshot {
            block,
            start,
            index: block / length,
            length,
        })
    }

    /// Sleep until the first block of the next epoch, in bounded
    /// increments of at least one and at most thirty blocks.
    async fn wait_for_next_head(&mut self) -> Result<(), OceansError> {
        let head = self.chain.current_block().await?;
        let length = match self.epoch_len {
            Some(len) => len,
            None => self.discover_epoch_length().await,
        };
        let target = head - (head % length) + length;

        while !self.should_exit() {
            let block = match self.chain.current_block().await {
                Ok(b) => b,
                Err(e) => {
                    warn!("[status] block probe failed: {}", e);
                    self.sleep_cooperative(Duration::from_secs_f64(defaults::BLOCK_TIME_SECS))
                        .await;
                    continue;
                }
            };
            if block >= target {
                return Ok(());
            }
            let remain = target - block;
            let eta = remain as f64 * defaults::BLOCK_TIME_SECS;
            info!(
                "[status] Block {} | {} blocks -> next epoch (~{:.0} m {:02.0} s)",
                block,
                remain,
                (eta / 60.0).floor(),
                eta % 60.0
            );
            let sleep_blocks = (remain / 2).clamp(1, 30);
            self.sleep_cooperative(Duration::from_secs_f64(
                sleep_blocks as f64 * defaults::BLOCK_TIME_SECS * 0.95,
            ))
            .await;
        }
        Ok(())
    }

    /// One strictly serial pipeline tick: votes -> liquidity -> rewards
    /// -> submission.
    async fn run_pipeline(&mut self, epoch: &EpochSnapshot) -> Result<(), OceansError> {
        let netuid = self.config.default_netuid;

        info!("[forward] Fetching latest off-chain and on-chain data...");
        let vote_pairs = self.votes.fetch_and_store().await?;
        let new_liquidity = self.liquidity.fetch_and_store(None, None).await?;

        let metagraph = self.chain.get_metagraph(netuid, None, true).await?;
        info!("[forward] Computing miner rewards...");
        let rewards = self.rewards.compute(&metagraph);

        if metagraph.uids.is_empty() {
            warn!("[forward] Empty metagraph - skipping weight submission");
            return Ok(());
        }

        // Convert {uid: reward} into parallel vectors in metagraph order,
        // zero-filling absent uids, then renormalize.
        let uids = metagraph.uids.clone();
        let mut weights: Vec<f64> = uids
            .iter()
            .map(|uid| rewards.get(uid).copied().unwrap_or(0.0))
            .collect();
        let total: f64 = weights.iter().sum();
        if total > 0.0 {
            for w in weights.iter_mut() {
                *w /= total;
            }
        } else {
            let uniform = 1.0 / weights.len() as f64;
            weights.fill(uniform);
        }

        let subnet_weight_sum: f64 = self.cache.subnet_weights().values().sum();
        let reward_sum: f64 = weights.iter().sum();
        gauge!(EPOCH_INDEX).set(epoch.index as f64);
        gauge!(SUBNET_WEIGHT_SUM).set(subnet_weight_sum);
        gauge!(REWARD_SUM).set(reward_sum);

        let submission = self
            .chain
            .submit_weights(
                netuid,
                uids,
                weights,
                defaults::WEIGHTS_VERSION_KEY,
            )
            .await;
        let outcome = match &submission {
            Ok(()) => {
                counter!(WEIGHT_SUBMISSIONS).increment(1);
                "submitted".to_string()
            }
            Err(e) => {
                counter!(WEIGHT_SUBMISSION_FAILURES).increment(1);
                format!("failed: {e}")
            }
        };

        info!(
            "[epoch {}] block {} | voters={} new_vote_rows={} new_liquidity_rows={} \
             subnet_weight_sum={:.6} reward_sum={:.6} submission={}",
            epoch.index,
            epoch.block,
            vote_pairs.len(),
            self.cache.latest_votes_scratch().len(),
            new_liquidity.len(),
            subnet_weight_sum,
            reward_sum,
            outcome
        );

        submission.map_err(OceansError::from)?;
        Ok(())
    }

    /// Always-attempted end-of-tick sync; its own failure is only a
    /// warning.
    async fn sync(&self) {
        match self
            .chain
            .get_metagraph(self.config.default_netuid, None, true)
            .await
        {
            Ok(metagraph) => debug!("[sync] metagraph refreshed ({} uids)", metagraph.uids.len()),
            Err(e) => warn!("[sync] failed: {}", e),
        }
    }

    async fn handle_pipeline_failure(&self, context: &str, err: &OceansError) {
        error!("{} failed: {}", context, err);
        if self.alerts.is_enabled() {
            self.alerts
                .send(&format!("oceans validator: {context} failed: {err}"))
                .await;
        }
        self.sleep_cooperative(PIPELINE_BACKOFF).await;
    }

    /// Main loop. Returns once a cooperative stop is requested.
    pub async fn run(&mut self) -> Result<(), OceansError> {
        info!(
            "EpochValidator starting (netuid {}, {} active subnets)",
            self.config.default_netuid,
            self.config.active_subnets.len()
        );

        while !self.should_exit() {
            let snapshot = match self.epoch_snapshot().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("[epoch] snapshot probe failed: {}", e);
                    self.sleep_cooperative(Duration::from_secs_f64(defaults::BLOCK_TIME_SECS))
                        .await;
                    continue;
                }
            };

            // Bootstrap: run the pipeline immediately on first loop,
            // wherever we are within the epoch.
            if !self.bootstrapped {
                info!("[bootstrap] running pipeline immediately");
                if let Err(e) = self.run_pipeline(&snapshot).await {
                    self.handle_pipeline_failure("bootstrap pipeline", &e).await;
                }
                self.sync().await;
                self.bootstrapped = true;
            }

            let into = snapshot.block - snapshot.start;
            if into % self.config.log_interval_blocks == 0 {
                let left = (snapshot.start + snapshot.length).saturating_sub(snapshot.block).max(1);
                let eta = left as f64 * defaults::BLOCK_TIME_SECS;
                info!(
                    "[status] Block {} | Epoch {} [{}/{}] - next epoch in {} blocks (~{:.0} m {:02.0} s)",
                    snapshot.block,
                    snapshot.index,
                    into,
                    snapshot.length,
                    left,
                    (eta / 60.0).floor(),
                    eta % 60.0
                );
            }

            if let Err(e) = self.wait_for_next_head().await {
                warn!("[status] wait for epoch head failed: {}", e);
                self.sleep_cooperative(Duration::from_secs_f64(defaults::BLOCK_TIME_SECS))
                    .await;
                continue;
            }
            if self.should_exit() {
                break;
            }

            // New epoch head: the length can shift by one, so re-probe.
            self.epoch_len = None;
            let head = match self.epoch_snapshot().await {
                Ok(s) => s,
                Err(e) => {
                    warn!("[epoch] head probe failed: {}", e);
                    continue;
                }
            };
            info!(
                "[epoch {}] head at block {} - len={}",
                head.index, head.block, head.length
            );

            if let Err(e) = self.run_pipeline(&head).await {
                self.handle_pipeline_failure("pipeline", &e).await;
            }
            self.sync().await;
            self.step += 1;
        }

        info!("Validator stopped after {} epoch ticks", self.step);
        Ok(())
    }
}
