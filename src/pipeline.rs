//! The relay pipeline: verify, admit, simulate, price, allocate, sign,
//! persist, broadcast, count.
//!
//! Capabilities are injected at construction; the pipeline owns only the
//! orchestration. The allocator lease acquired at step 6 is held until the
//! signed bytes are handed to the chain client, which serialises
//! same-relayer submissions in sequence-number order. Every exit path
//! before persistence returns the leased slot; after persistence the slot
//! is considered consumed no matter what broadcast does.

use alloy::consensus::TxEip1559;
use alloy::primitives::{Address, TxKind, B256, U256};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::chain::{CallRequest, ChainClient, FeeSuggestion};
use crate::config::Config;
use crate::counters::{CounterKey, Counters, Dimension};
use crate::error::Error;
use crate::metrics::METRICS;
use crate::nonce::{NonceAllocator, NonceKey};
use crate::policy::PolicyEngine;
use crate::signer::RelayerSigner;
use crate::store::Store;
use crate::types::{RelayRequestWire, TxRecord, TxStatus, VerifiedRequest};
use crate::verifier::{execute_calldata, Verifier};

/// What a successful relay returns to the caller.
#[derive(Debug, Clone, Copy)]
pub struct RelayOutcome {
    pub tx_hash: B256,
    pub gas_price: U256,
    pub gas_limit: u64,
}

pub struct RelayPipeline {
    verifier: Verifier,
    policy: Arc<PolicyEngine>,
    allocator: Arc<NonceAllocator>,
    signer: Arc<RelayerSigner>,
    chains: HashMap<String, Arc<dyn ChainClient>>,
    store: Arc<dyn Store>,
    counters: Arc<Counters>,
    fee_multiplier_pct: u64,
    gas_headroom_pct: u64,
    deadline: Duration,
}

impl RelayPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        policy: Arc<PolicyEngine>,
        allocator: Arc<NonceAllocator>,
        signer: Arc<RelayerSigner>,
        chains: HashMap<String, Arc<dyn ChainClient>>,
        store: Arc<dyn Store>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            verifier: Verifier::new(config),
            policy,
            allocator,
            signer,
            chains,
            store,
            counters,
            fee_multiplier_pct: config.fee_multiplier_pct,
            gas_headroom_pct: config.gas_headroom_pct,
            deadline: config.request_deadline(),
        }
    }

    /// Run one request through the full sequence.
    pub async fn relay(&self, wire: RelayRequestWire) -> Result<RelayOutcome, Error> {
        let started = Instant::now();

        // 1. Verify.
        let request = self.verifier.verify(&wire)?;
        let chain = self
            .chains
            .get(&request.network)
            .ok_or_else(|| Error::Internal(format!("no chain client for {}", request.network)))?
            .as_ref();

        // 2. Admit. No allocation, no broadcast on rejection.
        let admission = self.policy.evaluate(&request, Utc::now().timestamp()).await?;

        // 3. Simulate against chain state. A revert is a soft error.
        let calldata = execute_calldata(&request);
        let call = CallRequest {
            from: self.signer.address(),
            to: request.forwarder,
            value: request.value,
            data: calldata.clone(),
        };
        chain.simulate(&call).await?;

        // 4. Effective fee: suggestion, multiplier, clamp to the rule cap.
        let suggestion = chain.fee_suggestion().await?;
        let (max_fee, priority_fee) =
            compute_fee(suggestion, admission.max_gas_price, self.fee_multiplier_pct)?;

        // 5. Gas: estimate plus headroom, clamped to the declared limit.
        let estimate = chain.estimate_gas(&call).await?;
        let gas_limit = compute_gas_limit(estimate, request.gas, self.gas_headroom_pct)?;

        // 6. Acquire the sequence number. The lease holds the per-key lock
        // from here through the broadcast hand-off.
        if started.elapsed() >= self.deadline {
            return Err(Error::Internal("pipeline deadline exceeded".into()));
        }
        let key = NonceKey::new(self.signer.address(), &request.network);
        let lease = self.allocator.acquire(&key, chain).await?;
        let nonce = lease.value();

        // 7. Sign.
        let tx = TxEip1559 {
            chain_id: request.chain_id,
            nonce,
            gas_limit,
            max_fee_per_gas: to_u128(max_fee),
            max_priority_fee_per_gas: to_u128(priority_fee),
            to: TxKind::Call(request.forwarder),
            value: request.value,
            access_list: Default::default(),
            input: calldata,
        };
        let signed = match self.signer.sign_transaction(tx).await {
            Ok(signed) => signed,
            Err(e) => {
                lease.release();
                return Err(e);
            }
        };
        if started.elapsed() >= self.deadline {
            lease.release();
            return Err(Error::Internal("pipeline deadline exceeded".into()));
        }

        // 8. Persist the pending record under the deterministic hash BEFORE
        // broadcast.
        let record = self.build_record(&request, &signed.hash, nonce, gas_limit, max_fee);
        if let Err(e) = self.store.insert_record(&record).await {
            lease.release();
            return Err(match e {
                Error::PersistFailed(msg) => Error::PersistFailed(msg),
                other => Error::PersistFailed(other.to_string()),
            });
        }

        // 9. Broadcast. From here the slot is consumed: a failure leaves the
        // record pending for the confirmation tracker to reconcile.
        match chain.broadcast(&signed.raw).await {
            Ok(hash) => {
                if hash != signed.hash {
                    warn!(
                        expected = %signed.hash,
                        got = %hash,
                        "Node returned unexpected hash for broadcast"
                    );
                }
                drop(lease);
            }
            Err(e) => {
                METRICS.broadcast_errors.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                warn!(
                    tx_hash = %signed.hash,
                    nonce,
                    error = %e,
                    "Broadcast failed after persist; record left pending"
                );
                drop(lease);
                return Err(e);
            }
        }

        // 10. Counters advance on broadcast success only.
        let now = Utc::now().timestamp();
        self.counters.record(
            CounterKey::new(Dimension::TxCount, request.from, &request.network),
            U256::from(1u64),
            now,
        );
        self.counters.record(
            CounterKey::new(Dimension::TxValue, request.from, &request.network),
            request.value,
            now,
        );
        if let Some(token) = &request.token {
            self.counters.record(
                CounterKey::new(
                    Dimension::TokenAmount(token.address),
                    request.from,
                    &request.network,
                ),
                token.amount,
                now,
            );
        }

        info!(
            tx_hash = %signed.hash,
            network = %request.network,
            from = %request.from,
            nonce,
            "Relayed transaction broadcast"
        );

        // 11. Hand back the hash.
        Ok(RelayOutcome {
            tx_hash: signed.hash,
            gas_price: max_fee,
            gas_limit,
        })
    }

    fn build_record(
        &self,
        request: &VerifiedRequest,
        tx_hash: &B256,
        nonce: u64,
        gas_limit: u64,
        gas_price: U256,
    ) -> TxRecord {
        let now = Utc::now();
        TxRecord {
            tx_hash: *tx_hash,
            from: request.from,
            to: request.to,
            network: request.network.clone(),
            token_address: request.token.as_ref().map(|t| t.address),
            token_kind: request.token.as_ref().map(|t| t.kind),
            token_amount: request.token.as_ref().map(|t| t.amount),
            token_id: request.token.as_ref().map(|t| t.token_id),
            status: TxStatus::Pending,
            value: request.value,
            gas_limit,
            gas_price,
            gas_used: None,
            block_number: None,
            nonce,
            relayer: self.signer.address(),
            submitted_at: now,
            updated_at: now,
            stuck_since: None,
        }
    }

    /// The relayer address used for allocator keys and records.
    pub fn relayer_address(&self) -> Address {
        self.signer.address()
    }
}

/// Apply the fee multiplier and the gas-cap rule's price ceiling.
///
/// A cap below the chain's own suggestion means the operator's rule can
/// never be satisfied: that is `fee-cap-too-low`, not a clamp.
fn compute_fee(
    suggestion: FeeSuggestion,
    cap: Option<U256>,
    multiplier_pct: u64,
) -> Result<(U256, U256), Error> {
    let mut max_fee = suggestion.max_fee * U256::from(multiplier_pct) / U256::from(100u64);
    if let Some(cap) = cap {
        if cap < suggestion.max_fee {
            return Err(Error::FeeCapTooLow(format!(
                "gas-cap price {cap} is below the chain's fee suggestion {}",
                suggestion.max_fee
            )));
        }
        max_fee = max_fee.min(cap);
    }
    let priority_fee = suggestion.priority_fee.min(max_fee);
    Ok((max_fee, priority_fee))
}

/// Pad the estimate with headroom and clamp to the declared limit. An
/// estimate already past the declared limit cannot succeed on chain.
fn compute_gas_limit(estimate: u64, declared: U256, headroom_pct: u64) -> Result<u64, Error> {
    if U256::from(estimate) > declared {
        return Err(Error::GasLimitTooLow(format!(
            "estimated gas {estimate} exceeds declared limit {declared}"
        )));
    }
    let declared: u64 = declared.try_into().unwrap_or(u64::MAX);
    let padded = estimate.saturating_add(estimate.saturating_mul(headroom_pct) / 100);
    Ok(padded.min(declared))
}

fn to_u128(v: U256) -> u128 {
    v.try_into().unwrap_or(u128::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gwei(n: u64) -> U256 {
        U256::from(n) * U256::from(1_000_000_000u64)
    }

    #[test]
    fn fee_multiplier_applies() {
        let suggestion = FeeSuggestion {
            max_fee: gwei(10),
            priority_fee: gwei(1),
        };
        let (max_fee, priority) = compute_fee(suggestion, None, 120).unwrap();
        assert_eq!(max_fee, gwei(12));
        assert_eq!(priority, gwei(1));
    }

    #[test]
    fn fee_clamps_to_rule_cap() {
        let suggestion = FeeSuggestion {
            max_fee: gwei(10),
            priority_fee: gwei(2),
        };
        let (max_fee, _) = compute_fee(suggestion, Some(gwei(11)), 150).unwrap();
        assert_eq!(max_fee, gwei(11));
    }

    #[test]
    fn cap_below_suggestion_is_operator_error() {
        let suggestion = FeeSuggestion {
            max_fee: gwei(10),
            priority_fee: gwei(1),
        };
        let err = compute_fee(suggestion, Some(gwei(9)), 120).unwrap_err();
        assert!(matches!(err, Error::FeeCapTooLow(_)));
    }

    #[test]
    fn priority_never_exceeds_max_fee() {
        let suggestion = FeeSuggestion {
            max_fee: gwei(10),
            priority_fee: gwei(50),
        };
        let (max_fee, priority) = compute_fee(suggestion, None, 100).unwrap();
        assert_eq!(priority, max_fee);
    }

    #[test]
    fn gas_headroom_and_clamp() {
        // Estimate fits; headroom applies.
        assert_eq!(
            compute_gas_limit(100_000, U256::from(200_000u64), 10).unwrap(),
            110_000
        );
        // Headroom clamped by the declared limit.
        assert_eq!(
            compute_gas_limit(100_000, U256::from(105_000u64), 10).unwrap(),
            105_000
        );
    }

    #[test]
    fn estimate_past_declared_rejects() {
        let err = compute_gas_limit(100_001, U256::from(100_000u64), 10).unwrap_err();
        assert!(matches!(err, Error::GasLimitTooLow(_)));
    }
}
