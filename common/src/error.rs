use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: '{0}' - must be one of: error, warn, info, debug, trace")]
    InvalidLogLevel(String),

    #[error("Invalid RPC address: '{0}' - must be a valid HTTP/HTTPS/WS/WSS URL")]
    InvalidRpcAddress(String),

    #[error("Invalid vote API endpoint: '{0}'")]
    InvalidVoteEndpoint(String),

    #[error("Active subnet set is empty - set ACTIVE_SUBNETS to at least one subnet id")]
    EmptyActiveSubnets,

    #[error("Invalid subnet id in ACTIVE_SUBNETS: '{0}'")]
    InvalidSubnetId(String),

    #[error("Invalid value for {field}: '{value}'")]
    InvalidValue { field: String, value: String },
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP error {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("Expected JSON array from /votes/latest")]
    NotAnArray,

    #[error("Malformed vote row: {0}")]
    MalformedVote(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("HTTP error {status}: {reason}")]
    Status { status: u16, reason: String },

    #[error("No result in RPC response")]
    EmptyResult,

    #[error("Unexpected RPC payload: {0}")]
    UnexpectedPayload(String),

    #[error("Invalid RPC URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

/// Top-level error type shared by both binaries.
#[derive(Debug, Error)]
pub enum OceansError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
