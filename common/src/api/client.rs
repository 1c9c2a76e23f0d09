use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::Client;
use tokio::time::sleep;

use super::Vote;
use crate::error::ApiError;

/// Endpoint value that puts the client into offline mode. Compared
/// case-insensitively after trimming trailing slashes.
const OFFLINE_SENTINEL: &str = "TODO";

/// Fixed voter set returned in offline mode.
const OFFLINE_VOTER_HOTKEYS: &[&str] = &[
    "5HdK1zyMbMoq1NM2sDL2Len9h2CsmBcVbrFthePccMN5R8jU",
    "5CdG8JDyzBPvXD1PM3ctdVmk3DbC52aTmYbQNezasVUXsn66",
    "5CsvRJXuR955WojnGMdok1hbhffZyB4N5ocrv82f3p5A2zVp",
    "5ExiuLNctkEUL5xMijujmAdhJGdzb5d6vxdzLdjpH3MLNovF",
];
const OFFLINE_BLOCK_HEIGHT: u64 = 6_073_385;
const OFFLINE_VOTER_STAKE: f64 = 1.0;

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of the latest vote set. The HTTP client implements this; tests
/// inject their own.
#[async_trait]
pub trait VoteSource: Send + Sync {
    async fn get_latest_votes(&self) -> Result<Vec<Vote>, ApiError>;
}

/// HTTP client for the vote API with bounded exponential backoff.
///
/// When the configured endpoint equals the `"TODO"` sentinel the client
/// performs no network I/O at all and returns a deterministic vote set,
/// so the downstream pipeline stays exercisable without the API.
pub struct VoteApiClient {
    base_url: String,
    offline: bool,
    client: Option<Client>,
    timeout: Duration,
    active_subnets: BTreeSet<u16>,
}

impl VoteApiClient {
    pub fn new(
        endpoint: &str,
        timeout: Duration,
        active_subnets: BTreeSet<u16>,
    ) -> Result<Self, ApiError> {
        let base_url = endpoint.trim_end_matches('/').to_string();
        let offline = base_url.to_uppercase() == OFFLINE_SENTINEL;

        let client = if offline {
            warn!(
                "VoteApiClient initialized in offline mode - \
                 returning fixed votes until a real endpoint is configured"
            );
            None
        } else {
            info!("VoteApiClient initialized in online mode -> {}", base_url);
            Some(
                Client::builder()
                    .timeout(timeout)
                    .build()
                    .map_err(ApiError::Network)?,
            )
        };

        Ok(Self {
            base_url,
            offline,
            client,
            timeout,
            active_subnets,
        })
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    async fn fetch_once(&self, client: &Client) -> Result<Vec<Vote>, ApiError> {
        let url = format!("{}/votes/latest", self.base_url);
        let response = client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout(self.timeout)
            } else if e.is_connect() {
                ApiError::Connection(e.to_string())
            } else {
                ApiError::Network(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown error").to_string(),
            });
        }

        let payload: serde_json::Value = response.json().await.map_err(ApiError::Network)?;
        let rows = payload.as_array().ok_or(ApiError::NotAnArray)?;

        let mut votes = Vec::with_capacity(rows.len());
        for row in rows {
            // A bad optional timestamp drops the row; anything else
            // malformed fails the whole call.
            let timestamp = match row.get("timestamp") {
                None | Some(serde_json::Value::Null) => None,
                Some(raw) => match serde_json::from_value::<DateTime<Utc>>(raw.clone()) {
                    Ok(ts) => Some(ts),
                    Err(e) => {
                        debug!("Dropping vote row with malformed timestamp: {}", e);
                        continue;
                    }
                },
            };

            let mut stripped = row.clone();
            if let Some(obj) = stripped.as_object_mut() {
                obj.remove("timestamp");
            }
            let mut vote: Vote = serde_json::from_value(stripped)
                .map_err(|e| ApiError::MalformedVote(e.to_string()))?;
            vote.timestamp = timestamp;
            vote.validate()?;
            votes.push(vote);
        }

        debug!("Fetched {} votes from API", votes.len());
        Ok(votes)
    }

    fn offline_votes(&self) -> Vec<Vote> {
        let weight = 1.0 / self.active_subnets.len() as f64;
        let weights = self
            .active_subnets
            .iter()
            .map(|sid| (*sid, weight))
            .collect::<std::collections::BTreeMap<_, _>>();
        let now = Utc::now();

        OFFLINE_VOTER_HOTKEYS
            .iter()
            .map(|hk| Vote {
                voter_hotkey: hk.to_string(),
                block_height: OFFLINE_BLOCK_HEIGHT,
                voter_stake: OFFLINE_VOTER_STAKE,
                weights: weights.clone(),
                timestamp: Some(now),
            })
            .collect()
    }
}

fn is_retryable(err: &ApiError) -> bool {
    match err {
        ApiError::Timeout(_) | ApiError::Connection(_) | ApiError::Network(_) => true,
        ApiError::Status { status, .. } => *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl VoteSource for VoteApiClient {
    /// Return the most recent vote vector per voter.
    ///
    /// Retries transport and 5xx failures with exponential backoff
    /// (factor 2, no jitter, at most [`MAX_ATTEMPTS`] attempts).
    async fn get_latest_votes(&self) -> Result<Vec<Vote>, ApiError> {
        let client = match &self.client {
            Some(client) => client,
            None => return Ok(self.offline_votes()),
        };

        let mut delay = BACKOFF_BASE;
        let mut last_error = None;
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                warn!(
                    "Retrying vote fetch (attempt {}/{}) after {:?}",
                    attempt + 1,
                    MAX_ATTEMPTS,
                    delay
                );
                sleep(delay).await;
                delay *= 2;
            }
            match self.fetch_once(client).await {
                Ok(votes) => return Ok(votes),
                Err(e) if is_retryable(&e) => last_error = Some(e),
                Err(e) => return Err(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| ApiError::Connection("unknown error during vote fetch".to_string())))
    }
}
