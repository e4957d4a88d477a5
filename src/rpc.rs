//! Bitcoin Core JSON-RPC client with rate limiting and retry logic.
//!
//! Provides a thin wrapper around the node's RPC interface with:
//! - Rate limiting
//! - Bounded exponential backoff on transient failures
//! - Connectivity and auth failures reported apart from "not found"
//!
//! The ingestion pipeline only sees the [`BlockSource`] trait, so tests can
//! swap the node for an in-memory double.

use crate::config::{NodeConfig, RateLimitConfig};
use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// RPC_INVALID_ADDRESS_OR_KEY: unknown txid / block hash
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
/// RPC_INVALID_PARAMETER: e.g. block height out of range
const RPC_INVALID_PARAMETER: i64 = -8;
/// RPC_IN_WARMUP: node still loading the block index
const RPC_IN_WARMUP: i64 = -28;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Connection to node failed after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("Node rejected credentials (HTTP {0})")]
    Auth(u16),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("JSON-RPC error: code={code}, message={message}")]
    JsonRpc { code: i64, message: String },

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Deserialization error: {0}")]
    Deserialize(#[from] serde_json::Error),

    #[error("Node unavailable after {0} attempts")]
    Unavailable(u32),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// Whether the failure means the node itself is unreachable or refusing us
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            RpcError::Connection { .. } | RpcError::Auth(_) | RpcError::Unavailable(_)
        )
    }
}

/// JSON-RPC request structure
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P: Serialize> {
    jsonrpc: &'static str,
    method: &'a str,
    params: P,
    id: u64,
}

/// JSON-RPC response structure
#[derive(Debug, Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    error: Option<JsonRpcError>,
    #[allow(dead_code)]
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Block as returned by `getblock <hash> 2`
#[derive(Debug, Clone, Deserialize)]
pub struct Block {
    pub hash: String,
    pub height: u64,
    /// Block header time (unix seconds)
    pub time: i64,
    #[serde(rename = "tx", default)]
    pub transactions: Vec<Transaction>,
}

/// Decoded transaction (`getrawtransaction <txid> true`, or embedded in a block)
#[derive(Debug, Clone, Deserialize)]
pub struct Transaction {
    pub txid: String,
    #[serde(default)]
    pub vin: Vec<TxInput>,
    #[serde(default)]
    pub vout: Vec<TxOutput>,
    /// Only present for confirmed transactions fetched individually
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub blocktime: Option<i64>,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.vin.first().is_some_and(|v| v.coinbase.is_some())
    }

    /// Time of the block that confirmed this transaction, if the node told us
    pub fn confirmed_at(&self) -> Option<i64> {
        self.blocktime.or(self.time)
    }

    /// Output whose `n` matches; never guessed from position
    pub fn output(&self, n: u32) -> Option<&TxOutput> {
        self.vout.iter().find(|o| o.n == n)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxInput {
    #[serde(default)]
    pub coinbase: Option<String>,
    /// Spent transaction
    #[serde(default)]
    pub txid: Option<String>,
    /// Spent output index
    #[serde(default)]
    pub vout: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TxOutput {
    /// Value in BTC
    pub value: f64,
    pub n: u32,
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScriptPubKey {
    #[serde(default)]
    pub address: Option<String>,
    /// Pre-22.0 nodes
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(rename = "type", default)]
    pub script_type: Option<String>,
}

/// Raw ledger data needed by ingestion
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Full block with decoded transactions
    async fn block_by_height(&self, height: u64) -> Result<Block, RpcError>;

    /// Single decoded transaction, used to resolve spent outputs
    async fn transaction(&self, txid: &str) -> Result<Transaction, RpcError>;
}

/// Rate-limited Bitcoin Core RPC client.
pub struct BitcoinRpcClient {
    client: reqwest::Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
    rate_limiter: RateLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    config: RateLimitConfig,
    request_id: AtomicU64,
}

impl BitcoinRpcClient {
    pub fn new(node: &NodeConfig, config: RateLimitConfig) -> Result<Self, RpcError> {
        let quota = Quota::per_second(NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN));
        let rate_limiter = RateLimiter::direct(quota);

        let client = reqwest::Client::builder()
            .timeout(node.timeout())
            .pool_max_idle_per_host(20)
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            url: node.rpc_url(),
            user: node.user.clone(),
            password: node.password.clone(),
            rate_limiter,
            config,
            request_id: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Determine if a JSON-RPC error code is worth retrying.
    fn is_transient_error(code: i64) -> bool {
        code == RPC_IN_WARMUP
    }

    /// Codes the node uses for unknown heights, hashes and txids.
    fn is_not_found(code: i64) -> bool {
        matches!(code, RPC_INVALID_ADDRESS_OR_KEY | RPC_INVALID_PARAMETER)
    }

    /// Make a single RPC call, retrying transient failures with backoff.
    async fn call<P: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: P,
    ) -> Result<R, RpcError> {
        let mut delay = Duration::from_millis(self.config.base_delay_ms);
        let max_delay = Duration::from_secs(60);
        let max_attempts = self.config.max_retries + 1;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            // Wait for rate limiter
            self.rate_limiter.until_ready().await;

            let request = JsonRpcRequest {
                jsonrpc: "1.0",
                method,
                params: &params,
                id: self.next_id(),
            };

            let mut builder = self.client.post(&self.url).json(&request);
            if let Some(user) = &self.user {
                builder = builder.basic_auth(user, self.password.as_ref());
            }

            let response = match builder.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(RpcError::Connection {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    warn!(
                        "[attempt {}] Network error on {}: {} — retrying in {:?}",
                        attempt, method, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(RpcError::Auth(status.as_u16()));
            }

            let body = match response.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    if attempt >= max_attempts {
                        return Err(RpcError::Connection {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    warn!(
                        "[attempt {}] Failed reading body for {}: {} — retrying in {:?}",
                        attempt, method, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                    continue;
                }
            };

            // Bitcoin Core answers RPC errors with HTTP 500 and a JSON body,
            // so parse before looking at the status.
            let json_response: JsonRpcResponse<R> = match serde_json::from_slice(&body) {
                Ok(j) => j,
                Err(e) => {
                    if status.is_server_error() {
                        if attempt >= max_attempts {
                            return Err(RpcError::Unavailable(attempt));
                        }
                        warn!(
                            "[attempt {}] HTTP {} on {} — retrying in {:?}",
                            attempt, status, method, delay
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(max_delay);
                        continue;
                    }
                    return Err(RpcError::Deserialize(e));
                }
            };

            if let Some(error) = json_response.error {
                if Self::is_transient_error(error.code) && attempt < max_attempts {
                    warn!(
                        "[attempt {}] Transient RPC error on {}: code={}, msg={} — retrying in {:?}",
                        attempt, method, error.code, error.message, delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max_delay);
                    continue;
                }
                if Self::is_not_found(error.code) {
                    return Err(RpcError::NotFound(format!("{}: {}", method, error.message)));
                }
                return Err(RpcError::JsonRpc {
                    code: error.code,
                    message: error.message,
                });
            }

            return json_response
                .result
                .ok_or_else(|| RpcError::InvalidResponse(format!("{} returned no result", method)));
        }
    }

    /// Get current chain height; doubles as the startup connectivity check
    pub async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.call("getblockcount", ()).await
    }

    /// Fail fast if the node is unreachable or rejects our credentials
    pub async fn ping(&self) -> Result<u64, RpcError> {
        let height = self.get_block_count().await?;
        debug!("Connected to node at {} (height {})", self.url, height);
        Ok(height)
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.call("getblockhash", [height]).await
    }

    /// Get block with fully decoded transactions (verbosity 2)
    pub async fn get_block(&self, hash: &str) -> Result<Block, RpcError> {
        self.call("getblock", (hash, 2)).await
    }

    /// Get decoded transaction (requires `-txindex` for non-wallet transactions)
    pub async fn get_raw_transaction(&self, txid: &str) -> Result<Transaction, RpcError> {
        self.call("getrawtransaction", (txid, true)).await
    }
}

#[async_trait]
impl BlockSource for BitcoinRpcClient {
    async fn block_by_height(&self, height: u64) -> Result<Block, RpcError> {
        let hash = self.get_block_hash(height).await?;
        self.get_block(&hash).await
    }

    async fn transaction(&self, txid: &str) -> Result<Transaction, RpcError> {
        self.get_raw_transaction(txid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_JSON: &str = r#"{
        "hash": "00000000000000000002a7c4c1e48d76c5a37902165a270156b7a8d72728a054",
        "height": 700000,
        "time": 1631333672,
        "tx": [
            {
                "txid": "cb",
                "vin": [{ "coinbase": "03e0ae0a", "sequence": 4294967295 }],
                "vout": [
                    { "value": 6.25, "n": 0, "scriptPubKey": { "address": "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", "type": "pubkeyhash" } },
                    { "value": 0.0, "n": 1, "scriptPubKey": { "type": "nulldata" } }
                ]
            },
            {
                "txid": "spend",
                "vin": [{ "txid": "cb", "vout": 0 }],
                "vout": [
                    { "value": 1.0, "n": 0, "scriptPubKey": { "addresses": ["3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy"] } }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_block_deserialization() {
        let block: Block = serde_json::from_str(BLOCK_JSON).unwrap();
        assert_eq!(block.height, 700000);
        assert_eq!(block.transactions.len(), 2);
        assert!(block.transactions[0].is_coinbase());
        assert!(!block.transactions[1].is_coinbase());
        assert_eq!(block.transactions[1].vin[0].vout, Some(0));
        assert_eq!(
            block.transactions[1].vout[0].script_pub_key.addresses,
            vec!["3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy".to_string()]
        );
    }

    #[test]
    fn test_output_lookup_by_n() {
        let block: Block = serde_json::from_str(BLOCK_JSON).unwrap();
        let cb = &block.transactions[0];
        assert_eq!(cb.output(0).map(|o| o.value), Some(6.25));
        assert_eq!(cb.output(1).map(|o| o.value), Some(0.0));
        assert!(cb.output(7).is_none());
    }

    #[test]
    fn test_output_lookup_ignores_position() {
        let tx: Transaction = serde_json::from_str(
            r#"{
                "txid": "gap",
                "vout": [
                    { "value": 1.0, "n": 3, "scriptPubKey": {} },
                    { "value": 2.0, "n": 5, "scriptPubKey": {} }
                ]
            }"#,
        )
        .unwrap();
        assert!(tx.output(0).is_none());
        assert!(tx.output(1).is_none());
        assert_eq!(tx.output(5).map(|o| o.value), Some(2.0));
    }

    #[test]
    fn test_confirmed_at_prefers_blocktime() {
        let tx: Transaction =
            serde_json::from_str(r#"{ "txid": "a", "time": 10, "blocktime": 20 }"#).unwrap();
        assert_eq!(tx.confirmed_at(), Some(20));
        let tx: Transaction = serde_json::from_str(r#"{ "txid": "a", "time": 10 }"#).unwrap();
        assert_eq!(tx.confirmed_at(), Some(10));
    }

    #[test]
    fn test_error_classification() {
        assert!(BitcoinRpcClient::is_transient_error(-28));
        assert!(!BitcoinRpcClient::is_transient_error(-5));
        assert!(BitcoinRpcClient::is_not_found(-5));
        assert!(BitcoinRpcClient::is_not_found(-8));
        assert!(!BitcoinRpcClient::is_not_found(-32601));
    }

    #[test]
    fn test_connectivity_errors() {
        assert!(RpcError::Auth(401).is_connectivity());
        assert!(RpcError::Unavailable(3).is_connectivity());
        assert!(!RpcError::NotFound("getblockhash".into()).is_connectivity());
    }

    #[test]
    fn test_error_response_parses_without_result() {
        let resp: JsonRpcResponse<String> = serde_json::from_str(
            r#"{"result":null,"error":{"code":-8,"message":"Block height out of range"},"id":1}"#,
        )
        .unwrap();
        assert!(resp.result.is_none());
        assert_eq!(resp.error.map(|e| e.code), Some(-8));
    }
}
