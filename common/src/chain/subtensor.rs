use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::time::sleep;
use url::Url;

use super::{ChainClient, ChainClientConfig, LiquidityPosition, Metagraph};
use crate::error::ChainError;

/// JSON-RPC request structure
#[derive(Debug, serde::Serialize)]
struct JsonRpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: Value,
}

/// JSON-RPC response structure
#[derive(Debug, serde::Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    jsonrpc: String,
    #[allow(dead_code)]
    id: u64,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, serde::Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// JSON-RPC client for the subtensor node.
///
/// The configured RPC address may use a `ws://`/`wss://` scheme; requests
/// are POSTed to the equivalent `http(s)://` endpoint.
pub struct SubtensorClient {
    client: Client,
    base_url: Url,
    config: ChainClientConfig,
    request_id: AtomicU64,
}

impl SubtensorClient {
    pub fn new(rpc_address: &str) -> Result<Self, ChainError> {
        Self::with_config(rpc_address, ChainClientConfig::default())
    }

    pub fn with_config(rpc_address: &str, config: ChainClientConfig) -> Result<Self, ChainError> {
        let normalized = if rpc_address.contains("://") {
            rpc_address
                .replacen("wss://", "https://", 1)
                .replacen("ws://", "http://", 1)
        } else {
            format!("http://{rpc_address}")
        };
        let base_url = Url::parse(&normalized)?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connection_timeout)
            .build()
            .map_err(ChainError::Network)?;

        Ok(Self {
            client,
            base_url,
            config,
            request_id: AtomicU64::new(1),
        })
    }

    /// Make a JSON-RPC request with bounded retries.
    async fn make_request(&self, method: &'static str, params: Value) -> Result<Value, ChainError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        if log::log_enabled!(log::Level::Debug) {
            debug!("RPC request to {}: {}", self.base_url, method);
        }

        let mut last_error = None;
        let mut delay = self.config.retry_delay;
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                warn!(
                    "Retrying RPC {} (attempt {}/{}) after {:?}",
                    method, attempt, self.config.max_retries, delay
                );
                sleep(delay).await;
                delay *= 2;
            }

            match self.make_single_request(&request).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if !is_retryable(&e) {
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ChainError::Connection("unknown error during request".to_string())))
    }

    async fn make_single_request(&self, request: &JsonRpcRequest) -> Result<Value, ChainError> {
        let response = self
            .client
            .post(self.base_url.clone())
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ChainError::Timeout(self.config.request_timeout)
                } else if e.is_connect() {
                    ChainError::Connection(e.to_string())
                } else {
                    ChainError::Network(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChainError::Status {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("Unknown error").to_string(),
            });
        }

        let rpc_response: JsonRpcResponse =
            response.json().await.map_err(ChainError::Network)?;

        if let Some(error) = rpc_response.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }

        rpc_response.result.ok_or(ChainError::EmptyResult)
    }

    fn parse_u64(result: Value, method: &str) -> Result<u64, ChainError> {
        result.as_u64().ok_or_else(|| {
            ChainError::UnexpectedPayload(format!("{method} returned non-integer: {result}"))
        })
    }
}

fn is_retryable(err: &ChainError) -> bool {
    match err {
        ChainError::Timeout(_) | ChainError::Connection(_) | ChainError::Network(_) => true,
        ChainError::Status { status, .. } => *status >= 500,
        // RPC-level errors are the node rejecting the call, not transport
        _ => false,
    }
}

#[async_trait]
impl ChainClient for SubtensorClient {
    async fn current_block(&self) -> Result<u64, ChainError> {
        let result = self.make_request("get_current_block", Value::Null).await?;
        Self::parse_u64(result, "get_current_block")
    }

    async fn tempo(&self, netuid: u16) -> Result<u64, ChainError> {
        let result = self
            .make_request("get_tempo", json!({ "netuid": netuid }))
            .await?;
        Self::parse_u64(result, "get_tempo")
    }

    async fn next_epoch_start(&self, netuid: u16) -> Result<u64, ChainError> {
        let result = self
            .make_request("get_next_epoch_start", json!({ "netuid": netuid }))
            .await?;
        Self::parse_u64(result, "get_next_epoch_start")
    }

    async fn get_metagraph(
        &self,
        netuid: u16,
        block: Option<u64>,
        lite: bool,
    ) -> Result<Metagraph, ChainError> {
        let result = self
            .make_request(
                "get_metagraph",
                json!({ "netuid": netuid, "block": block, "lite": lite }),
            )
            .await?;
        let metagraph: Metagraph = serde_json::from_value(result)
            .map_err(|e| ChainError::UnexpectedPayload(format!("get_metagraph: {e}")))?;
        if metagraph.uids.len() != metagraph.coldkeys.len() {
            return Err(ChainError::UnexpectedPayload(format!(
                "get_metagraph: {} uids vs {} coldkeys",
                metagraph.uids.len(),
                metagraph.coldkeys.len()
            )));
        }
        Ok(metagraph)
    }

    async fn get_liquidity(
        &self,
        coldkey: &str,
        netuid: u16,
        block: Option<u64>,
    ) -> Result<Vec<LiquidityPosition>, ChainError> {
        let result = self
            .make_request(
                "get_liquidity_positions",
                json!({ "coldkey": coldkey, "netuid": netuid, "block": block }),
            )
            .await?;
        serde_json::from_value(result)
            .map_err(|e| ChainError::UnexpectedPayload(format!("get_liquidity_positions: {e}")))
    }

    async fn submit_weights(
        &self,
        netuid: u16,
        uids: Vec<u16>,
        weights: Vec<f64>,
        version: u64,
    ) -> Result<(), ChainError> {
        self.make_request(
            "set_weights",
            json!({
                "netuid": netuid,
                "uids": uids,
                "weights": weights,
                "version_key": version,
            }),
        )
        .await?;
        Ok(())
    }
}

impl std::fmt::Debug for SubtensorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubtensorClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}
