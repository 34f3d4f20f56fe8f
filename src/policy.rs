//! Policy engine: allowlist, quota, gas-cap and token-cap rules.
//!
//! Rules are additive; a request must pass every rule that applies to it.
//! Evaluation order is fixed (allowlist, quota, gas caps, token caps) and
//! the first rejection wins with a reason naming the rule kind and the
//! violated limit. Rule bodies are stored opaque; this module owns the
//! per-kind schema and validates on write.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

use crate::counters::{CounterKey, Counters, Dimension};
use crate::error::Error;
use crate::store::Store;
use crate::types::{u256_dec_opt, PolicyRule, RuleKind, RuleTarget, VerifiedRequest};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Allowlist rule body: the set of accounts permitted to relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistValue {
    pub addresses: Vec<Address>,
}

/// Quota rule body. Absent limits are unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaValue {
    #[serde(default)]
    pub max_tx_per_hour: Option<u64>,
    #[serde(default)]
    pub max_tx_per_day: Option<u64>,
    #[serde(with = "u256_dec_opt", default)]
    pub max_value_per_tx: Option<U256>,
    #[serde(with = "u256_dec_opt", default)]
    pub max_value_per_hour: Option<U256>,
    #[serde(with = "u256_dec_opt", default)]
    pub max_value_per_day: Option<U256>,
}

/// Gas-cap rule body. `max_gas_limit` is checked here against the declared
/// limit; `max_gas_price` is applied by the pipeline once the effective fee
/// is known.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GasCapValue {
    #[serde(default)]
    pub max_gas_limit: Option<u64>,
    #[serde(with = "u256_dec_opt", default)]
    pub max_gas_price: Option<U256>,
}

/// Token-cap rule body. `token = None` applies the caps to any token the
/// request carries; `allowed_tokens = Some` additionally gates membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenCapValue {
    #[serde(default)]
    pub token: Option<Address>,
    #[serde(default)]
    pub allowed_tokens: Option<Vec<Address>>,
    #[serde(with = "u256_dec_opt", default)]
    pub max_amount_per_tx: Option<U256>,
    #[serde(with = "u256_dec_opt", default)]
    pub max_amount_per_hour: Option<U256>,
    #[serde(with = "u256_dec_opt", default)]
    pub max_amount_per_day: Option<U256>,
}

/// Outcome of admission: the request passed, plus any fee ceiling the
/// pipeline must honour at submission time.
#[derive(Debug, Clone, Copy, Default)]
pub struct Admission {
    pub max_gas_price: Option<U256>,
}

/// Parsed rules partitioned by kind. Swapped wholesale on reload so
/// evaluation never observes a partial set.
#[derive(Default)]
struct RuleIndex {
    allowlist: Vec<(RuleTarget, AllowlistValue)>,
    quotas: Vec<(RuleTarget, QuotaValue)>,
    gas_caps: Vec<(RuleTarget, GasCapValue)>,
    token_caps: Vec<(RuleTarget, TokenCapValue)>,
}

pub struct PolicyEngine {
    store: Arc<dyn Store>,
    counters: Arc<Counters>,
    rules: RwLock<RuleIndex>,
    reload_signal: Notify,
}

impl PolicyEngine {
    pub fn new(store: Arc<dyn Store>, counters: Arc<Counters>) -> Self {
        Self {
            store,
            counters,
            rules: RwLock::new(RuleIndex::default()),
            reload_signal: Notify::new(),
        }
    }

    /// Validate a rule body against its kind's schema. Called on every rule
    /// write before the opaque value reaches the store.
    pub fn validate_value(kind: RuleKind, value: &serde_json::Value) -> Result<(), Error> {
        let result = match kind {
            RuleKind::Allowlist => {
                serde_json::from_value::<AllowlistValue>(value.clone()).map(|_| ())
            }
            RuleKind::Quota => serde_json::from_value::<QuotaValue>(value.clone()).map(|_| ()),
            RuleKind::GasCap => serde_json::from_value::<GasCapValue>(value.clone()).map(|_| ()),
            RuleKind::TokenCap => {
                serde_json::from_value::<TokenCapValue>(value.clone()).map(|_| ())
            }
        };
        result.map_err(|e| Error::InvalidRequest {
            field: "value",
            reason: format!("invalid {} rule body: {e}", kind.as_str()),
        })
    }

    /// Replace the live rule set from the store. Atomic: readers see either
    /// the old or the new set, never a mix.
    pub async fn reload(&self) -> Result<(), Error> {
        let rows = self.store.list_rules(None).await?;
        let mut index = RuleIndex::default();
        for rule in rows.into_iter().filter(|r| r.enabled) {
            if let Err(e) = Self::index_rule(&mut index, &rule) {
                warn!(rule = %rule.id, error = %e, "Skipping unparseable policy rule");
            }
        }
        let count = index.allowlist.len()
            + index.quotas.len()
            + index.gas_caps.len()
            + index.token_caps.len();
        *self.rules.write().await = index;
        debug!(rules = count, "Policy rules reloaded");
        Ok(())
    }

    fn index_rule(index: &mut RuleIndex, rule: &PolicyRule) -> Result<(), Error> {
        match rule.kind {
            RuleKind::Allowlist => {
                let value: AllowlistValue = serde_json::from_value(rule.value.clone())
                    .map_err(|e| Error::Internal(e.to_string()))?;
                index.allowlist.push((rule.target.clone(), value));
            }
            RuleKind::Quota => {
                let value: QuotaValue = serde_json::from_value(rule.value.clone())
                    .map_err(|e| Error::Internal(e.to_string()))?;
                index.quotas.push((rule.target.clone(), value));
            }
            RuleKind::GasCap => {
                let value: GasCapValue = serde_json::from_value(rule.value.clone())
                    .map_err(|e| Error::Internal(e.to_string()))?;
                index.gas_caps.push((rule.target.clone(), value));
            }
            RuleKind::TokenCap => {
                let value: TokenCapValue = serde_json::from_value(rule.value.clone())
                    .map_err(|e| Error::Internal(e.to_string()))?;
                index.token_caps.push((rule.target.clone(), value));
            }
        }
        Ok(())
    }

    /// Ask for an out-of-schedule reload.
    pub fn trigger_reload(&self) {
        self.reload_signal.notify_one();
    }

    /// Background reload loop: bounded schedule plus the explicit signal.
    pub async fn run_reload_loop(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.reload_signal.notified() => {}
            }
            if let Err(e) = self.reload().await {
                warn!(error = %e, "Policy rule reload failed");
            }
        }
    }

    /// Evaluate an admitted-candidate request at `now` (unix seconds).
    pub async fn evaluate(
        &self,
        request: &VerifiedRequest,
        now: i64,
    ) -> Result<Admission, Error> {
        let rules = self.rules.read().await;
        let network = request.network.as_str();
        let from = request.from;

        // Allowlist first. An applicable rule with an empty set denies all.
        for (target, value) in &rules.allowlist {
            if !target.applies_to(network, from) {
                continue;
            }
            if !value.addresses.contains(&from) {
                return Err(Error::NotAllowlisted(format!(
                    "{from:#x} is not allowlisted for target {target}"
                )));
            }
        }

        // Quotas: project the request's own contribution onto the windows.
        for (target, quota) in &rules.quotas {
            if !target.applies_to(network, from) {
                continue;
            }
            self.check_quota(quota, request, now)?;
        }

        // Gas caps: declared limit here; price cap handed to the pipeline.
        let mut max_gas_price: Option<U256> = None;
        for (target, cap) in &rules.gas_caps {
            if !target.applies_to(network, from) {
                continue;
            }
            if let Some(limit) = cap.max_gas_limit {
                if request.gas > U256::from(limit) {
                    return Err(Error::GasCapExceeded(format!(
                        "declared gas {} exceeds gas-cap limit {limit}",
                        request.gas
                    )));
                }
            }
            if let Some(price) = cap.max_gas_price {
                max_gas_price = Some(match max_gas_price {
                    Some(existing) => existing.min(price),
                    None => price,
                });
            }
        }

        // Token caps apply only to requests carrying token fields.
        if let Some(token) = &request.token {
            for (target, cap) in &rules.token_caps {
                if !target.applies_to(network, from) {
                    continue;
                }
                self.check_token_cap(cap, request, token.address, token.amount, now)?;
            }
        }

        Ok(Admission { max_gas_price })
    }

    fn check_quota(
        &self,
        quota: &QuotaValue,
        request: &VerifiedRequest,
        now: i64,
    ) -> Result<(), Error> {
        let count_key = CounterKey::new(Dimension::TxCount, request.from, &request.network);
        let value_key = CounterKey::new(Dimension::TxValue, request.from, &request.network);

        if let Some(limit) = quota.max_tx_per_hour {
            let projected = self.counters.count(&count_key, HOUR, now) + 1;
            if projected > limit {
                return Err(Error::QuotaExceeded(format!(
                    "hourly transaction quota exceeded: limit {limit}"
                )));
            }
        }
        if let Some(limit) = quota.max_tx_per_day {
            let projected = self.counters.count(&count_key, DAY, now) + 1;
            if projected > limit {
                return Err(Error::QuotaExceeded(format!(
                    "daily transaction quota exceeded: limit {limit}"
                )));
            }
        }
        if let Some(limit) = quota.max_value_per_tx {
            if request.value > limit {
                return Err(Error::QuotaExceeded(format!(
                    "per-transaction value quota exceeded: limit {limit} wei"
                )));
            }
        }
        if let Some(limit) = quota.max_value_per_hour {
            let projected = self
                .counters
                .sum(&value_key, HOUR, now)
                .saturating_add(request.value);
            if projected > limit {
                return Err(Error::QuotaExceeded(format!(
                    "hourly value quota exceeded: limit {limit} wei"
                )));
            }
        }
        if let Some(limit) = quota.max_value_per_day {
            let projected = self
                .counters
                .sum(&value_key, DAY, now)
                .saturating_add(request.value);
            if projected > limit {
                return Err(Error::QuotaExceeded(format!(
                    "daily value quota exceeded: limit {limit} wei"
                )));
            }
        }
        Ok(())
    }

    fn check_token_cap(
        &self,
        cap: &TokenCapValue,
        request: &VerifiedRequest,
        token: Address,
        amount: U256,
        now: i64,
    ) -> Result<(), Error> {
        if let Some(allowed) = &cap.allowed_tokens {
            if !allowed.contains(&token) {
                return Err(Error::TokenCapExceeded(format!(
                    "token {token:#x} is not an allowed token"
                )));
            }
        }
        // Amount caps scoped to one token when the rule names it.
        if cap.token.is_some_and(|t| t != token) {
            return Ok(());
        }
        let key = CounterKey::new(Dimension::TokenAmount(token), request.from, &request.network);
        if let Some(limit) = cap.max_amount_per_tx {
            if amount > limit {
                return Err(Error::TokenCapExceeded(format!(
                    "per-transaction token amount exceeds cap {limit} for {token:#x}"
                )));
            }
        }
        if let Some(limit) = cap.max_amount_per_hour {
            let projected = self.counters.sum(&key, HOUR, now).saturating_add(amount);
            if projected > limit {
                return Err(Error::TokenCapExceeded(format!(
                    "hourly token amount exceeds cap {limit} for {token:#x}"
                )));
            }
        }
        if let Some(limit) = cap.max_amount_per_day {
            let projected = self.counters.sum(&key, DAY, now).saturating_add(amount);
            if projected > limit {
                return Err(Error::TokenCapExceeded(format!(
                    "daily token amount exceeds cap {limit} for {token:#x}"
                )));
            }
        }
        Ok(())
    }
}

/// Seed helper: build a rule row after validating its body.
pub fn build_rule(
    id: &str,
    kind: RuleKind,
    target: RuleTarget,
    value: serde_json::Value,
) -> Result<PolicyRule, Error> {
    PolicyEngine::validate_value(kind, &value)?;
    Ok(PolicyRule {
        id: id.to_string(),
        kind,
        target,
        value,
        enabled: true,
    })
}
