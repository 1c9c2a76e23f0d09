mod liquidity;
mod votes;

pub use liquidity::LiquidityIngestor;
pub use votes::VoteIngestor;
