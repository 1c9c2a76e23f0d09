use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

pub const MIN_HOTKEY_LEN: usize = 10;
pub const MAX_HOTKEY_LEN: usize = 64;

/// One vote entry as served by `/votes/latest`.
///
/// `voter_stake` is the amount of stake held by the voter; the external
/// JSON may supply the field as either `voter_stake` or `alpha_stake`.
/// Weights are a raw subnet_id -> weight mapping exactly as the voter
/// submitted it; normalization happens downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub voter_hotkey: String,
    pub block_height: u64,
    #[serde(alias = "alpha_stake")]
    pub voter_stake: f64,
    pub weights: BTreeMap<u16, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Vote {
    /// Shape checks beyond what deserialization enforces. Trims the
    /// hotkey in place before validating its length.
    pub fn validate(&mut self) -> Result<(), ApiError> {
        self.voter_hotkey = self.voter_hotkey.trim().to_string();
        let len = self.voter_hotkey.len();
        if !(MIN_HOTKEY_LEN..=MAX_HOTKEY_LEN).contains(&len) {
            return Err(ApiError::MalformedVote(format!(
                "voter_hotkey length {} out of range {}..={}",
                len, MIN_HOTKEY_LEN, MAX_HOTKEY_LEN
            )));
        }
        if !self.voter_stake.is_finite() || self.voter_stake < 0.0 {
            return Err(ApiError::MalformedVote(format!(
                "voter_stake {} must be a finite value >= 0",
                self.voter_stake
            )));
        }
        if self.weights.is_empty() {
            return Err(ApiError::MalformedVote(
                "weights must not be empty".to_string(),
            ));
        }
        if let Some((sid, w)) = self
            .weights
            .iter()
            .find(|(_, w)| !w.is_finite() || **w < 0.0)
        {
            return Err(ApiError::MalformedVote(format!(
                "weight {} for subnet {} must be a finite value >= 0",
                w, sid
            )));
        }
        Ok(())
    }
}
