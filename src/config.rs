//! Relayer configuration.
//!
//! One immutable object, loaded at startup from file + `RELAYER_`-prefixed
//! environment, then injected everywhere. Nothing re-reads configuration at
//! runtime.

use alloy::primitives::{Address, U256};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::types::u256_dec;

/// Configuration for the relay service.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,

    /// Supported networks, keyed by network identifier. Requests naming a
    /// network outside this map are rejected with `unsupported-network`.
    #[serde(default)]
    pub networks: HashMap<String, NetworkConfig>,

    #[serde(default)]
    pub signer: SignerConfig,

    /// Hard ceiling on a request's declared gas limit. A floor defence
    /// independent of policy rules.
    #[serde(default = "defaults::hard_max_gas_limit")]
    pub hard_max_gas_limit: u64,

    /// Hard ceiling on a request's native value, in wei.
    #[serde(with = "u256_dec", default = "defaults::hard_max_value")]
    pub hard_max_value: U256,

    /// Percentage applied to the chain's fee suggestion (120 = +20%).
    #[serde(default = "defaults::fee_multiplier_pct")]
    pub fee_multiplier_pct: u64,

    /// Headroom percentage added on top of the gas estimate.
    #[serde(default = "defaults::gas_headroom_pct")]
    pub gas_headroom_pct: u64,

    /// Callers waiting on one (relayer, network) allocator key beyond this
    /// threshold are rejected with `relayer-saturated`.
    #[serde(default = "defaults::saturation_threshold")]
    pub saturation_threshold: u32,

    /// Deadline for a single pipeline run, milliseconds.
    #[serde(default = "defaults::request_deadline_ms")]
    pub request_deadline_ms: u64,

    /// Confirmation tracker scan interval, seconds.
    #[serde(default = "defaults::confirm_interval_secs")]
    pub confirm_interval_secs: u64,

    /// Age past which a receiptless pending submission may transition to
    /// dropped or stuck, seconds.
    #[serde(default = "defaults::grace_window_secs")]
    pub grace_window_secs: u64,

    /// Policy rule reload interval, seconds.
    #[serde(default = "defaults::policy_reload_secs")]
    pub policy_reload_secs: u64,

    /// Largest sliding window the counter cache must retain, seconds.
    #[serde(default = "defaults::counter_max_window_secs")]
    pub counter_max_window_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: defaults::bind_address(),
            networks: HashMap::new(),
            signer: SignerConfig::default(),
            hard_max_gas_limit: defaults::hard_max_gas_limit(),
            hard_max_value: defaults::hard_max_value(),
            fee_multiplier_pct: defaults::fee_multiplier_pct(),
            gas_headroom_pct: defaults::gas_headroom_pct(),
            saturation_threshold: defaults::saturation_threshold(),
            request_deadline_ms: defaults::request_deadline_ms(),
            confirm_interval_secs: defaults::confirm_interval_secs(),
            grace_window_secs: defaults::grace_window_secs(),
            policy_reload_secs: defaults::policy_reload_secs(),
            counter_max_window_secs: defaults::counter_max_window_secs(),
        }
    }
}

impl Config {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }

    pub fn confirm_interval(&self) -> Duration {
        Duration::from_secs(self.confirm_interval_secs)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::from_secs(self.grace_window_secs)
    }

    pub fn policy_reload_interval(&self) -> Duration {
        Duration::from_secs(self.policy_reload_secs)
    }

    pub fn counter_max_window(&self) -> Duration {
        Duration::from_secs(self.counter_max_window_secs)
    }
}

/// One supported chain.
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    pub rpc_url: String,
    /// Secondary RPC endpoint; traffic fails over when the primary's
    /// circuit breaker opens.
    #[serde(default)]
    pub fallback_rpc_url: Option<String>,
    /// Trusted forwarder contract the relayer submits through. Part of the
    /// EIP-712 domain.
    pub forwarder: Address,
    /// Private-orderflow submission endpoint. When set, raw transactions go
    /// here first and fall back to the public endpoint on transport failure.
    #[serde(default)]
    pub private_rpc_url: Option<String>,
}

/// Signing backend selection.
#[derive(Debug, Clone, Deserialize)]
pub struct SignerConfig {
    /// "local" or "kms".
    #[serde(default = "defaults::signer_kind")]
    pub kind: String,
    /// Hex private key for the local backend. Prefer the
    /// `RELAYER_SIGNER__PRIVATE_KEY` environment variable over files.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Base URL of the remote signing service for the kms backend.
    #[serde(default)]
    pub kms_url: Option<String>,
    /// Key identifier at the remote signing service.
    #[serde(default)]
    pub kms_key_id: Option<String>,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            kind: defaults::signer_kind(),
            private_key: None,
            kms_url: None,
            kms_key_id: None,
        }
    }
}

mod defaults {
    use alloy::primitives::U256;

    pub fn bind_address() -> String {
        "0.0.0.0:3040".into()
    }

    pub fn signer_kind() -> String {
        std::env::var("RELAYER_SIGNER_MODE").unwrap_or_else(|_| "local".into())
    }

    pub fn hard_max_gas_limit() -> u64 {
        5_000_000
    }

    /// 10 ETH in wei.
    pub fn hard_max_value() -> U256 {
        U256::from(10u64) * U256::from(10u64).pow(U256::from(18u64))
    }

    pub fn fee_multiplier_pct() -> u64 {
        120
    }

    pub fn gas_headroom_pct() -> u64 {
        10
    }

    pub fn saturation_threshold() -> u32 {
        std::env::var("RELAYER_SATURATION_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(64)
    }

    pub fn request_deadline_ms() -> u64 {
        20_000
    }

    pub fn confirm_interval_secs() -> u64 {
        5
    }

    pub fn grace_window_secs() -> u64 {
        120
    }

    pub fn policy_reload_secs() -> u64 {
        10
    }

    /// One day: the widest quota window.
    pub fn counter_max_window_secs() -> u64 {
        86_400
    }
}
