//! Chain client: JSON-RPC abstraction with automatic failover.
//!
//! One client per network; there is no cross-network state. Wraps a plain
//! JSON-RPC transport with primary -> fallback failover, bounded retry with
//! exponential backoff, and a circuit breaker. `broadcast` is at-least-once
//! from the client's perspective but at-most-once observable: a node that
//! already knows the signed bytes yields the same hash.

use alloy::primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::Error;

/// Consecutive failures before the circuit breaker opens.
const CIRCUIT_BREAKER_THRESHOLD: u64 = 5;
/// How long (ms) before a tripped breaker retries the primary.
const CIRCUIT_BREAKER_WINDOW_MS: u64 = 30_000;
/// Max retry attempts per call.
const MAX_RETRIES: u32 = 2;
/// Base delay for exponential backoff (ms).
const BASE_DELAY_MS: u64 = 200;
/// Per-call HTTP timeout.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);
/// Priority fee fallback when the node lacks `eth_maxPriorityFeePerGas`.
const DEFAULT_PRIORITY_FEE_WEI: u64 = 1_000_000_000;

/// Fee fields suggested by the chain for the next submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSuggestion {
    pub max_fee: U256,
    pub priority_fee: U256,
}

/// A call the relayer intends to submit, used for simulation and gas
/// estimation.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Receipt fields the tracker consumes.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptInfo {
    pub status: bool,
    pub gas_used: u64,
    pub block_number: u64,
    pub effective_gas_price: U256,
}

/// The chain capability. All operations are idempotent except `broadcast`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn network(&self) -> &str;

    fn chain_id(&self) -> u64;

    async fn head_block(&self) -> Result<u64, Error>;

    /// Pending-inclusive transaction count for an account.
    async fn pending_count(&self, address: Address) -> Result<u64, Error>;

    async fn fee_suggestion(&self) -> Result<FeeSuggestion, Error>;

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, Error>;

    /// Dry-run the call against latest state. A revert surfaces as
    /// [`Error::WouldRevert`].
    async fn simulate(&self, call: &CallRequest) -> Result<(), Error>;

    /// Submit raw signed bytes. Returns the transaction hash.
    async fn broadcast(&self, raw: &[u8]) -> Result<B256, Error>;

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptInfo>, Error>;
}

// --- JSON-RPC wire types ---

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize, Debug)]
struct RpcErrorBody {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

struct CircuitState {
    failures: u64,
    last_failure_ms: u64,
    open: bool,
}

/// JSON-RPC chain client with primary -> fallback failover.
pub struct RpcChainClient {
    network: String,
    chain_id: u64,
    http: reqwest::Client,
    primary_url: String,
    fallback_url: Option<String>,
    /// Private-orderflow submission endpoint; `broadcast` tries it first
    /// when set and falls back to the public path on transport failure.
    private_url: Option<String>,
    circuit: Mutex<CircuitState>,
    total_failovers: AtomicU64,
    next_id: AtomicU64,
}

impl RpcChainClient {
    pub fn new(
        network: &str,
        chain_id: u64,
        primary_url: &str,
        fallback_url: Option<&str>,
        private_url: Option<&str>,
    ) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(CALL_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("HTTP client build failed: {e}")))?;
        info!(
            network,
            chain_id,
            primary = primary_url,
            fallback = fallback_url.unwrap_or("none"),
            "Chain client initialized"
        );
        Ok(Self {
            network: network.to_string(),
            chain_id,
            http,
            primary_url: primary_url.to_string(),
            fallback_url: fallback_url.map(String::from),
            private_url: private_url.map(String::from),
            circuit: Mutex::new(CircuitState {
                failures: 0,
                last_failure_ms: 0,
                open: false,
            }),
            total_failovers: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        })
    }

    /// The URL requests currently route to (primary unless the circuit is
    /// open and a fallback exists).
    fn active_url(&self) -> &str {
        if self.is_circuit_open() {
            self.fallback_url.as_deref().unwrap_or(&self.primary_url)
        } else {
            &self.primary_url
        }
    }

    fn is_circuit_open(&self) -> bool {
        let mut circuit = self.circuit.lock().unwrap();
        if !circuit.open {
            return false;
        }
        // Half-open: retry primary after the window.
        if now_ms() - circuit.last_failure_ms > CIRCUIT_BREAKER_WINDOW_MS {
            circuit.open = false;
            circuit.failures = 0;
            info!(network = %self.network, "Circuit breaker half-open, retrying primary");
            return false;
        }
        true
    }

    fn record_success(&self) {
        let mut circuit = self.circuit.lock().unwrap();
        if circuit.failures > 0 {
            circuit.failures = 0;
            circuit.open = false;
        }
    }

    fn record_failure(&self) {
        let mut circuit = self.circuit.lock().unwrap();
        circuit.failures += 1;
        circuit.last_failure_ms = now_ms();
        if circuit.failures >= CIRCUIT_BREAKER_THRESHOLD && !circuit.open {
            circuit.open = true;
            self.total_failovers.fetch_add(1, Ordering::Relaxed);
            warn!(
                network = %self.network,
                failures = circuit.failures,
                "Circuit breaker opened"
            );
        }
    }

    pub fn failover_count(&self) -> u64 {
        self.total_failovers.load(Ordering::Relaxed)
    }

    /// One JSON-RPC exchange against `url`, no retry.
    async fn call_once(&self, url: &str, method: &str, params: Value) -> Result<Value, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::ChainTransient(format!("{method}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::ChainTransient(format!(
                "{method}: HTTP {}",
                response.status()
            )));
        }
        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| Error::ChainTransient(format!("{method}: bad body: {e}")))?;
        if let Some(err) = envelope.error {
            return Err(classify_rpc_error(method, err));
        }
        envelope
            .result
            .ok_or_else(|| Error::ChainTransient(format!("{method}: empty result")))
    }

    /// JSON-RPC with retry/backoff on the active endpoint, then one pass on
    /// the fallback. Non-transient errors (reverts, rejections) propagate
    /// immediately.
    async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(retry_delay(attempt - 1)).await;
            }
            match self.call_once(self.active_url(), method, params.clone()).await {
                Ok(v) => {
                    self.record_success();
                    return Ok(v);
                }
                Err(e @ Error::ChainTransient(_)) => {
                    self.record_failure();
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        // Active endpoint exhausted; one direct try on the fallback.
        if let Some(fallback) = &self.fallback_url {
            if fallback != self.active_url() {
                warn!(network = %self.network, method, "Primary exhausted, trying fallback");
                match self.call_once(fallback, method, params).await {
                    Ok(v) => return Ok(v),
                    Err(e) => last_err = Some(e),
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::ChainTransient(format!("{method}: no attempt"))))
    }

    fn call_object(call: &CallRequest) -> Value {
        json!({
            "from": format!("{:#x}", call.from),
            "to": format!("{:#x}", call.to),
            "value": format!("{:#x}", call.value),
            "data": format!("{}", call.data),
        })
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    fn network(&self) -> &str {
        &self.network
    }

    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn head_block(&self) -> Result<u64, Error> {
        let v = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64("eth_blockNumber", &v)
    }

    async fn pending_count(&self, address: Address) -> Result<u64, Error> {
        let v = self
            .call(
                "eth_getTransactionCount",
                json!([format!("{address:#x}"), "pending"]),
            )
            .await?;
        parse_hex_u64("eth_getTransactionCount", &v)
    }

    async fn fee_suggestion(&self) -> Result<FeeSuggestion, Error> {
        let gas_price = self.call("eth_gasPrice", json!([])).await?;
        let max_fee = parse_hex_u256("eth_gasPrice", &gas_price)?;
        // Optional method; older nodes lack it.
        let priority_fee = match self.call("eth_maxPriorityFeePerGas", json!([])).await {
            Ok(v) => parse_hex_u256("eth_maxPriorityFeePerGas", &v)?,
            Err(_) => U256::from(DEFAULT_PRIORITY_FEE_WEI),
        };
        Ok(FeeSuggestion {
            max_fee,
            priority_fee: priority_fee.min(max_fee),
        })
    }

    async fn estimate_gas(&self, call: &CallRequest) -> Result<u64, Error> {
        let v = self
            .call("eth_estimateGas", json!([Self::call_object(call)]))
            .await?;
        parse_hex_u64("eth_estimateGas", &v)
    }

    async fn simulate(&self, call: &CallRequest) -> Result<(), Error> {
        self.call("eth_call", json!([Self::call_object(call), "latest"]))
            .await?;
        Ok(())
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<B256, Error> {
        let raw_hex = format!("0x{}", alloy::hex::encode(raw));
        // Private orderflow first when configured; transport failure there
        // falls through to the public path.
        if let Some(private) = &self.private_url {
            match self
                .call_once(private, "eth_sendRawTransaction", json!([raw_hex.clone()]))
                .await
            {
                Ok(v) => return parse_hex_b256("eth_sendRawTransaction", &v),
                Err(Error::BroadcastFailed(msg)) if is_already_known(&msg) => {
                    return Ok(keccak256(raw));
                }
                Err(Error::ChainTransient(e)) => {
                    warn!(network = %self.network, error = %e, "Private submission failed, using public path");
                }
                Err(e) => return Err(e),
            }
        }
        match self.call("eth_sendRawTransaction", json!([raw_hex])).await {
            Ok(v) => parse_hex_b256("eth_sendRawTransaction", &v),
            // A node that has seen these bytes already accepted this exact
            // transaction; resolve to the deterministic hash.
            Err(Error::BroadcastFailed(msg)) if is_already_known(&msg) => Ok(keccak256(raw)),
            Err(Error::ChainTransient(msg)) => Err(Error::BroadcastFailed(msg)),
            Err(e) => Err(e),
        }
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptInfo>, Error> {
        let v = self
            .call("eth_getTransactionReceipt", json!([format!("{tx_hash:#x}")]))
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        let status = v
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s == "0x1")
            .unwrap_or(false);
        let gas_used = v
            .get("gasUsed")
            .map(|g| parse_hex_u64("gasUsed", g))
            .transpose()?
            .unwrap_or(0);
        let block_number = v
            .get("blockNumber")
            .map(|b| parse_hex_u64("blockNumber", b))
            .transpose()?
            .unwrap_or(0);
        let effective_gas_price = v
            .get("effectiveGasPrice")
            .map(|p| parse_hex_u256("effectiveGasPrice", p))
            .transpose()?
            .unwrap_or(U256::ZERO);
        Ok(Some(ReceiptInfo {
            status,
            gas_used,
            block_number,
            effective_gas_price,
        }))
    }
}

/// Map a JSON-RPC error object onto an error kind. Execution reverts carry
/// code 3 or a "revert" message; everything else on the submission path is
/// the node rejecting or a transient fault.
fn classify_rpc_error(method: &str, err: RpcErrorBody) -> Error {
    let detail = match &err.data {
        Some(d) => format!("{} ({d})", err.message),
        None => err.message.clone(),
    };
    let lower = err.message.to_ascii_lowercase();
    if method == "eth_call" || method == "eth_estimateGas" {
        if err.code == 3 || lower.contains("revert") || lower.contains("execution") {
            return Error::WouldRevert(format!("execution would revert: {detail}"));
        }
    }
    if method == "eth_sendRawTransaction" {
        return Error::BroadcastFailed(detail);
    }
    Error::ChainTransient(format!("{method}: RPC error {}: {detail}", err.code))
}

fn is_already_known(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.contains("already known")
        || lower.contains("known transaction")
        || lower.contains("alreadyexists")
        || lower.contains("already_exists")
}

fn retry_delay(attempt: u32) -> Duration {
    Duration::from_millis(BASE_DELAY_MS * 2u64.pow(attempt))
}

fn parse_hex_u64(what: &str, v: &Value) -> Result<u64, Error> {
    let s = v
        .as_str()
        .ok_or_else(|| Error::ChainTransient(format!("{what}: non-string quantity")))?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| Error::ChainTransient(format!("{what}: {e}")))
}

fn parse_hex_u256(what: &str, v: &Value) -> Result<U256, Error> {
    let s = v
        .as_str()
        .ok_or_else(|| Error::ChainTransient(format!("{what}: non-string quantity")))?;
    U256::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|e| Error::ChainTransient(format!("{what}: {e}")))
}

fn parse_hex_b256(what: &str, v: &Value) -> Result<B256, Error> {
    let s = v
        .as_str()
        .ok_or_else(|| Error::ChainTransient(format!("{what}: non-string hash")))?;
    s.parse::<B256>()
        .map_err(|e| Error::ChainTransient(format!("{what}: {e}")))
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
