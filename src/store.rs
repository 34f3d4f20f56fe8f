//! Storage trait and the in-memory backend.
//!
//! The store exclusively owns transaction records and policy rules. Record
//! insertion is unique on tx-hash; status transitions are guarded so that a
//! terminal record can never change again. Advisory per-record locks keep
//! concurrent reconcilers off the same row.

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::Error;
use crate::types::{PolicyRule, RuleKind, TxRecord, TxStatus};

/// Receipt-derived fields applied when a pending record reaches a terminal
/// state.
#[derive(Debug, Clone, Copy)]
pub struct ConfirmationUpdate {
    pub status: TxStatus,
    pub gas_used: Option<u64>,
    pub block_number: Option<u64>,
    pub effective_gas_price: Option<U256>,
}

/// The storage capability.
#[async_trait]
pub trait Store: Send + Sync {
    /// Idempotent schema/state initialisation. Called once at startup.
    async fn init(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Liveness probe for the readiness endpoint.
    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    // --- Transaction records ---

    /// Insert a new record. Rejects a duplicate tx-hash.
    async fn insert_record(&self, record: &TxRecord) -> Result<(), Error>;

    async fn record(&self, tx_hash: B256) -> Result<Option<TxRecord>, Error>;

    /// Apply a `pending -> terminal` transition. Rejected when the record is
    /// missing or already terminal.
    async fn apply_confirmation(
        &self,
        tx_hash: B256,
        update: ConfirmationUpdate,
    ) -> Result<(), Error>;

    /// Flag a pending record as stuck. Idempotent: the first flag wins.
    async fn mark_stuck(&self, tx_hash: B256, since: DateTime<Utc>) -> Result<(), Error>;

    /// Records in which `address` appears as either party, newest first.
    async fn list_by_account(
        &self,
        address: Address,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TxRecord>, Error>;

    /// Pending records ordered by submission time, oldest first.
    async fn list_pending(&self) -> Result<Vec<TxRecord>, Error>;

    // --- Policy rules ---

    async fn insert_rule(&self, rule: &PolicyRule) -> Result<(), Error>;

    async fn update_rule(&self, rule: &PolicyRule) -> Result<(), Error>;

    async fn delete_rule(&self, id: &str) -> Result<(), Error>;

    async fn rule(&self, id: &str) -> Result<Option<PolicyRule>, Error>;

    async fn list_rules(&self, kind: Option<RuleKind>) -> Result<Vec<PolicyRule>, Error>;

    // --- Advisory locks ---

    /// Claim the reconciliation lock for one record. Returns false when
    /// another worker holds it.
    async fn try_lock_record(&self, tx_hash: B256) -> bool;

    async fn unlock_record(&self, tx_hash: B256);
}

/// In-memory store. Backs tests and single-node deployments; the trait is
/// the contract a persistent backend implements.
pub struct MemoryStore {
    records: Mutex<HashMap<B256, TxRecord>>,
    rules: Mutex<HashMap<String, PolicyRule>>,
    locks: Mutex<HashSet<B256>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            rules: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashSet::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_record(&self, record: &TxRecord) -> Result<(), Error> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.tx_hash) {
            return Err(Error::PersistFailed(format!(
                "duplicate record {:#x}",
                record.tx_hash
            )));
        }
        records.insert(record.tx_hash, record.clone());
        Ok(())
    }

    async fn record(&self, tx_hash: B256) -> Result<Option<TxRecord>, Error> {
        Ok(self.records.lock().unwrap().get(&tx_hash).cloned())
    }

    async fn apply_confirmation(
        &self,
        tx_hash: B256,
        update: ConfirmationUpdate,
    ) -> Result<(), Error> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&tx_hash)
            .ok_or_else(|| Error::Internal(format!("no record {tx_hash:#x}")))?;
        if record.status.is_terminal() {
            return Err(Error::Internal(format!(
                "record {tx_hash:#x} already terminal ({})",
                record.status.as_str()
            )));
        }
        record.status = update.status;
        record.gas_used = update.gas_used;
        record.block_number = update.block_number;
        if let Some(price) = update.effective_gas_price {
            record.gas_price = price;
        }
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_stuck(&self, tx_hash: B256, since: DateTime<Utc>) -> Result<(), Error> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(&tx_hash)
            .ok_or_else(|| Error::Internal(format!("no record {tx_hash:#x}")))?;
        if record.status.is_terminal() {
            return Err(Error::Internal(format!(
                "record {tx_hash:#x} already terminal ({})",
                record.status.as_str()
            )));
        }
        if record.stuck_since.is_none() {
            record.stuck_since = Some(since);
            record.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_by_account(
        &self,
        address: Address,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TxRecord>, Error> {
        let records = self.records.lock().unwrap();
        let mut matched: Vec<TxRecord> = records
            .values()
            .filter(|r| r.from == address || r.to == address)
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at));
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_pending(&self) -> Result<Vec<TxRecord>, Error> {
        let records = self.records.lock().unwrap();
        let mut pending: Vec<TxRecord> = records
            .values()
            .filter(|r| r.status == TxStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(pending)
    }

    async fn insert_rule(&self, rule: &PolicyRule) -> Result<(), Error> {
        let mut rules = self.rules.lock().unwrap();
        if rules.contains_key(&rule.id) {
            return Err(Error::PersistFailed(format!("duplicate rule {}", rule.id)));
        }
        rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn update_rule(&self, rule: &PolicyRule) -> Result<(), Error> {
        let mut rules = self.rules.lock().unwrap();
        if !rules.contains_key(&rule.id) {
            return Err(Error::Internal(format!("no rule {}", rule.id)));
        }
        rules.insert(rule.id.clone(), rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, id: &str) -> Result<(), Error> {
        self.rules.lock().unwrap().remove(id);
        Ok(())
    }

    async fn rule(&self, id: &str) -> Result<Option<PolicyRule>, Error> {
        Ok(self.rules.lock().unwrap().get(id).cloned())
    }

    async fn list_rules(&self, kind: Option<RuleKind>) -> Result<Vec<PolicyRule>, Error> {
        let rules = self.rules.lock().unwrap();
        let mut out: Vec<PolicyRule> = rules
            .values()
            .filter(|r| kind.is_none_or(|k| r.kind == k))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    async fn try_lock_record(&self, tx_hash: B256) -> bool {
        self.locks.lock().unwrap().insert(tx_hash)
    }

    async fn unlock_record(&self, tx_hash: B256) {
        self.locks.lock().unwrap().remove(&tx_hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn make_record(n: u8, status: TxStatus) -> TxRecord {
        let now = Utc::now();
        TxRecord {
            tx_hash: B256::repeat_byte(n),
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            network: "localhost".into(),
            token_address: None,
            token_kind: None,
            token_amount: None,
            token_id: None,
            status,
            value: U256::from(1u64),
            gas_limit: 100_000,
            gas_price: U256::from(1_000_000_000u64),
            gas_used: None,
            block_number: None,
            nonce: n as u64,
            relayer: Address::repeat_byte(9),
            submitted_at: now + ChronoDuration::seconds(n as i64),
            updated_at: now,
            stuck_since: None,
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_hash() {
        let store = MemoryStore::new();
        let record = make_record(1, TxStatus::Pending);
        store.insert_record(&record).await.unwrap();
        let err = store.insert_record(&record).await.unwrap_err();
        assert!(matches!(err, Error::PersistFailed(_)));
    }

    #[tokio::test]
    async fn transitions_are_guarded() {
        let store = MemoryStore::new();
        let record = make_record(1, TxStatus::Pending);
        store.insert_record(&record).await.unwrap();

        store
            .apply_confirmation(
                record.tx_hash,
                ConfirmationUpdate {
                    status: TxStatus::Confirmed,
                    gas_used: Some(21_000),
                    block_number: Some(7),
                    effective_gas_price: Some(U256::from(900_000_000u64)),
                },
            )
            .await
            .unwrap();

        // Terminal records are immutable.
        let err = store
            .apply_confirmation(
                record.tx_hash,
                ConfirmationUpdate {
                    status: TxStatus::Failed,
                    gas_used: None,
                    block_number: None,
                    effective_gas_price: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        let stored = store.record(record.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Confirmed);
        assert_eq!(stored.gas_used, Some(21_000));
        assert_eq!(stored.block_number, Some(7));
    }

    #[tokio::test]
    async fn listing_orders_and_pages() {
        let store = MemoryStore::new();
        for n in 1..=5 {
            store
                .insert_record(&make_record(n, TxStatus::Pending))
                .await
                .unwrap();
        }
        let page = store
            .list_by_account(Address::repeat_byte(1), 2, 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        // Newest first, offset skips the newest.
        assert_eq!(page[0].tx_hash, B256::repeat_byte(4));
        assert_eq!(page[1].tx_hash, B256::repeat_byte(3));
    }

    #[tokio::test]
    async fn pending_scan_is_oldest_first() {
        let store = MemoryStore::new();
        store
            .insert_record(&make_record(3, TxStatus::Pending))
            .await
            .unwrap();
        store
            .insert_record(&make_record(1, TxStatus::Pending))
            .await
            .unwrap();
        store
            .insert_record(&make_record(2, TxStatus::Confirmed))
            .await
            .unwrap();
        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].tx_hash, B256::repeat_byte(1));
        assert_eq!(pending[1].tx_hash, B256::repeat_byte(3));
    }

    #[tokio::test]
    async fn advisory_locks_are_exclusive() {
        let store = MemoryStore::new();
        let hash = B256::repeat_byte(1);
        assert!(store.try_lock_record(hash).await);
        assert!(!store.try_lock_record(hash).await);
        store.unlock_record(hash).await;
        assert!(store.try_lock_record(hash).await);
    }

    #[tokio::test]
    async fn stuck_flag_is_first_wins() {
        let store = MemoryStore::new();
        let record = make_record(1, TxStatus::Pending);
        store.insert_record(&record).await.unwrap();
        let first = Utc::now();
        store.mark_stuck(record.tx_hash, first).await.unwrap();
        store
            .mark_stuck(record.tx_hash, first + ChronoDuration::seconds(60))
            .await
            .unwrap();
        let stored = store.record(record.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.stuck_since, Some(first));
    }
}
