mod client;
mod schemas;

pub use client::{VoteApiClient, VoteSource, DEFAULT_TIMEOUT};
pub use schemas::Vote;
