//! Sliding-window counters backing quota checks.
//!
//! Each key holds a time-ordered multiset of (timestamp, quantity) entries.
//! Counts are exact; value sums use 256-bit integer arithmetic. Entries
//! older than the largest configured window are evicted lazily on access.

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// What a window aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    TxCount,
    TxValue,
    /// Per-token amount, keyed by token contract address.
    TokenAmount(Address),
}

impl Dimension {
    /// Cache-namespace form: `counter:<dimension>:<identity>:<network>`.
    pub fn name(&self) -> String {
        match self {
            Self::TxCount => "tx-count".into(),
            Self::TxValue => "tx-value".into(),
            Self::TokenAmount(token) => format!("token-amount/{token:#x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub dimension: Dimension,
    pub identity: Address,
    pub network: String,
}

impl CounterKey {
    pub fn new(dimension: Dimension, identity: Address, network: &str) -> Self {
        Self {
            dimension,
            identity,
            network: network.to_string(),
        }
    }
}

/// Sliding-window counter cache. Per-key operations are atomic; cross-key
/// operations are not transactional.
pub struct Counters {
    windows: DashMap<CounterKey, Mutex<VecDeque<(i64, U256)>>>,
    max_window_secs: i64,
}

impl Counters {
    pub fn new(max_window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_window_secs: max_window.as_secs() as i64,
        }
    }

    /// Record a quantity at `ts` (unix seconds). Count dimensions record 1.
    pub fn record(&self, key: CounterKey, qty: U256, ts: i64) {
        let entry = self
            .windows
            .entry(key)
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut entries = entry.lock().unwrap();
        // Entries arrive in submission order; tolerate small clock skew by
        // inserting from the back.
        let pos = entries
            .iter()
            .rposition(|(t, _)| *t <= ts)
            .map(|i| i + 1)
            .unwrap_or(0);
        entries.insert(pos, (ts, qty));
    }

    /// Sum of quantities with timestamp >= now - window. Evicts entries
    /// older than the largest configured window.
    pub fn sum(&self, key: &CounterKey, window: Duration, now: i64) -> U256 {
        let Some(entry) = self.windows.get(key) else {
            return U256::ZERO;
        };
        let mut entries = entry.lock().unwrap();
        let horizon = now - self.max_window_secs;
        while entries.front().is_some_and(|(t, _)| *t < horizon) {
            entries.pop_front();
        }
        let cutoff = now - window.as_secs() as i64;
        entries
            .iter()
            .filter(|(t, _)| *t >= cutoff)
            .fold(U256::ZERO, |acc, (_, q)| acc.saturating_add(*q))
    }

    /// Entry count within the window; exact.
    pub fn count(&self, key: &CounterKey, window: Duration, now: i64) -> u64 {
        let Some(entry) = self.windows.get(key) else {
            return 0;
        };
        let entries = entry.lock().unwrap();
        let cutoff = now - window.as_secs() as i64;
        entries.iter().filter(|(t, _)| *t >= cutoff).count() as u64
    }
}
