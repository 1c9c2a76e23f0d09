pub mod alerts;
pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod logging;

pub use error::OceansError;
