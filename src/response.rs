//! API response types.

use alloy::primitives::U256;
use serde::Serialize;

use crate::types::{u256_dec, TxRecord};

/// Success body for the relay endpoint.
#[derive(Serialize)]
pub struct RelayResponse {
    pub ok: bool,
    pub tx_hash: String,
    #[serde(with = "u256_dec")]
    pub gas_price: U256,
    pub gas_limit: String,
}

impl RelayResponse {
    pub fn broadcast(tx_hash: String, gas_price: U256, gas_limit: u64) -> Self {
        Self {
            ok: true,
            tx_hash,
            gas_price,
            gas_limit: gas_limit.to_string(),
        }
    }
}

/// Listing endpoint body.
#[derive(Serialize)]
pub struct ListingResponse {
    pub ok: bool,
    pub records: Vec<TxRecord>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub relayer_address: String,
    pub networks: Vec<String>,
    pub uptime_secs: u64,
    pub requests: u64,
    pub signer_status: &'static str,
    pub pending_records: usize,
}
