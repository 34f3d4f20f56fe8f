//! Confirmation tracker: reconciles pending submissions with chain state.
//!
//! Scans pending records on an interval, under per-record advisory locks so
//! only one worker reconciles a given record. Receipts move records to
//! confirmed/failed. A receiptless record past the grace window is dropped
//! when the chain's pending-count has advanced past its sequence number (a
//! sibling landed in its slot) and otherwise flagged stuck for operator
//! action.

use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::chain::ChainClient;
use crate::error::Error;
use crate::metrics::METRICS;
use crate::nonce::{NonceAllocator, NonceKey};
use crate::store::{ConfirmationUpdate, Store};
use crate::types::{TxRecord, TxStatus};

pub struct ConfirmationTracker {
    store: Arc<dyn Store>,
    chains: HashMap<String, Arc<dyn ChainClient>>,
    allocator: Arc<NonceAllocator>,
    interval: Duration,
    grace: ChronoDuration,
}

impl ConfirmationTracker {
    pub fn new(
        store: Arc<dyn Store>,
        chains: HashMap<String, Arc<dyn ChainClient>>,
        allocator: Arc<NonceAllocator>,
        interval: Duration,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            chains,
            allocator,
            interval,
            grace: ChronoDuration::from_std(grace).unwrap_or(ChronoDuration::seconds(120)),
        }
    }

    /// Scan loop. Spawn once at startup.
    pub async fn run(self: Arc<Self>) {
        info!(interval_secs = self.interval.as_secs(), "Confirmation tracker started");
        loop {
            tokio::time::sleep(self.interval).await;
            if let Err(e) = self.tick().await {
                error!(error = %e, "Confirmation scan failed");
            }
        }
    }

    /// One reconciliation pass. Returns how many records were inspected.
    pub async fn tick(&self) -> Result<usize, Error> {
        let pending = self.store.list_pending().await?;
        let mut inspected = 0;
        for record in pending {
            if !self.store.try_lock_record(record.tx_hash).await {
                continue;
            }
            inspected += 1;
            let result = self.reconcile(&record).await;
            self.store.unlock_record(record.tx_hash).await;
            if let Err(e) = result {
                // One bad record must not starve the rest of the scan.
                warn!(tx_hash = %record.tx_hash, error = %e, "Reconcile failed");
            }
        }
        Ok(inspected)
    }

    async fn reconcile(&self, record: &TxRecord) -> Result<(), Error> {
        let Some(chain) = self.chains.get(&record.network) else {
            warn!(network = %record.network, "No chain client for pending record");
            return Ok(());
        };

        match chain.receipt(record.tx_hash).await? {
            Some(receipt) if receipt.status => {
                self.store
                    .apply_confirmation(
                        record.tx_hash,
                        ConfirmationUpdate {
                            status: TxStatus::Confirmed,
                            gas_used: Some(receipt.gas_used),
                            block_number: Some(receipt.block_number),
                            effective_gas_price: Some(receipt.effective_gas_price),
                        },
                    )
                    .await?;
                METRICS.confirmed_total.fetch_add(1, Ordering::Relaxed);
                info!(
                    tx_hash = %record.tx_hash,
                    block = receipt.block_number,
                    gas_used = receipt.gas_used,
                    "Submission confirmed"
                );
            }
            Some(receipt) => {
                self.store
                    .apply_confirmation(
                        record.tx_hash,
                        ConfirmationUpdate {
                            status: TxStatus::Failed,
                            gas_used: Some(receipt.gas_used),
                            block_number: Some(receipt.block_number),
                            effective_gas_price: Some(receipt.effective_gas_price),
                        },
                    )
                    .await?;
                METRICS.failed_total.fetch_add(1, Ordering::Relaxed);
                warn!(tx_hash = %record.tx_hash, "Submission reverted on chain");
            }
            None => {
                let age = Utc::now() - record.submitted_at;
                if age < self.grace {
                    return Ok(());
                }
                self.reconcile_missing(record, chain.as_ref()).await?;
            }
        }
        Ok(())
    }

    /// No receipt past the grace window: either a sibling consumed the slot
    /// (dropped) or the chain has not moved past it (stuck).
    async fn reconcile_missing(
        &self,
        record: &TxRecord,
        chain: &dyn ChainClient,
    ) -> Result<(), Error> {
        let pending_count = chain.pending_count(record.relayer).await?;
        if pending_count > record.nonce {
            self.store
                .apply_confirmation(
                    record.tx_hash,
                    ConfirmationUpdate {
                        status: TxStatus::Dropped,
                        gas_used: None,
                        block_number: None,
                        effective_gas_price: None,
                    },
                )
                .await?;
            METRICS.dropped_total.fetch_add(1, Ordering::Relaxed);
            METRICS.nonce_resyncs.fetch_add(1, Ordering::Relaxed);
            let key = NonceKey::new(record.relayer, &record.network);
            self.allocator.resync(&key, chain).await?;
            warn!(
                tx_hash = %record.tx_hash,
                nonce = record.nonce,
                pending_count,
                "Submission dropped; allocator resynced"
            );
        } else if record.stuck_since.is_none() {
            // Logical stuck state: stays pending in the store with a
            // timestamp, and signals for operator action.
            self.store.mark_stuck(record.tx_hash, Utc::now()).await?;
            METRICS.stuck_total.fetch_add(1, Ordering::Relaxed);
            error!(
                tx_hash = %record.tx_hash,
                nonce = record.nonce,
                network = %record.network,
                "Submission stuck: no receipt and chain has not advanced; operator action required"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{CallRequest, FeeSuggestion, ReceiptInfo};
    use crate::store::MemoryStore;
    use alloy::primitives::{keccak256, Address, B256, U256};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockChain {
        receipts: Mutex<HashMap<B256, ReceiptInfo>>,
        pending: Mutex<u64>,
    }

    impl MockChain {
        fn new() -> Self {
            Self {
                receipts: Mutex::new(HashMap::new()),
                pending: Mutex::new(0),
            }
        }

        fn set_receipt(&self, hash: B256, receipt: ReceiptInfo) {
            self.receipts.lock().unwrap().insert(hash, receipt);
        }

        fn set_pending(&self, n: u64) {
            *self.pending.lock().unwrap() = n;
        }
    }

    #[async_trait]
    impl ChainClient for MockChain {
        fn network(&self) -> &str {
            "localhost"
        }

        fn chain_id(&self) -> u64 {
            31337
        }

        async fn head_block(&self) -> Result<u64, Error> {
            Ok(1)
        }

        async fn pending_count(&self, _address: Address) -> Result<u64, Error> {
            Ok(*self.pending.lock().unwrap())
        }

        async fn fee_suggestion(&self) -> Result<FeeSuggestion, Error> {
            Ok(FeeSuggestion {
                max_fee: U256::from(1_000_000_000u64),
                priority_fee: U256::from(1_000_000_000u64),
            })
        }

        async fn estimate_gas(&self, _call: &CallRequest) -> Result<u64, Error> {
            Ok(21_000)
        }

        async fn simulate(&self, _call: &CallRequest) -> Result<(), Error> {
            Ok(())
        }

        async fn broadcast(&self, raw: &[u8]) -> Result<B256, Error> {
            Ok(keccak256(raw))
        }

        async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptInfo>, Error> {
            Ok(self.receipts.lock().unwrap().get(&tx_hash).copied())
        }
    }

    fn make_record(n: u8, age_secs: i64) -> TxRecord {
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
            status: TxStatus::Pending,
            value: U256::from(1u64),
            gas_limit: 100_000,
            gas_price: U256::from(1_000_000_000u64),
            gas_used: None,
            block_number: None,
            nonce: n as u64,
            relayer: Address::repeat_byte(9),
            submitted_at: now - ChronoDuration::seconds(age_secs),
            updated_at: now,
            stuck_since: None,
        }
    }

    fn make_tracker(
        store: Arc<MemoryStore>,
        chain: Arc<MockChain>,
    ) -> ConfirmationTracker {
        let mut chains: HashMap<String, Arc<dyn ChainClient>> = HashMap::new();
        chains.insert("localhost".into(), chain);
        ConfirmationTracker::new(
            store,
            chains,
            Arc::new(NonceAllocator::new(64)),
            Duration::from_secs(5),
            Duration::from_secs(120),
        )
    }

    #[tokio::test]
    async fn success_receipt_confirms() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new());
        let record = make_record(1, 10);
        store.insert_record(&record).await.unwrap();
        chain.set_receipt(
            record.tx_hash,
            ReceiptInfo {
                status: true,
                gas_used: 42_000,
                block_number: 11,
                effective_gas_price: U256::from(900_000_000u64),
            },
        );

        let tracker = make_tracker(Arc::clone(&store), chain);
        assert_eq!(tracker.tick().await.unwrap(), 1);

        let stored = store.record(record.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Confirmed);
        assert_eq!(stored.gas_used, Some(42_000));
        assert_eq!(stored.block_number, Some(11));
        assert_eq!(stored.gas_price, U256::from(900_000_000u64));
    }

    #[tokio::test]
    async fn revert_receipt_fails() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new());
        let record = make_record(1, 10);
        store.insert_record(&record).await.unwrap();
        chain.set_receipt(
            record.tx_hash,
            ReceiptInfo {
                status: false,
                gas_used: 42_000,
                block_number: 11,
                effective_gas_price: U256::from(900_000_000u64),
            },
        );

        let tracker = make_tracker(Arc::clone(&store), chain);
        tracker.tick().await.unwrap();
        let stored = store.record(record.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Failed);
    }

    #[tokio::test]
    async fn young_receiptless_record_is_left_alone() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new());
        let record = make_record(1, 10);
        store.insert_record(&record).await.unwrap();

        let tracker = make_tracker(Arc::clone(&store), chain);
        tracker.tick().await.unwrap();
        let stored = store.record(record.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Pending);
        assert!(stored.stuck_since.is_none());
    }

    #[tokio::test]
    async fn aged_record_with_advanced_chain_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new());
        let record = make_record(1, 300); // nonce 1, well past grace
        store.insert_record(&record).await.unwrap();
        chain.set_pending(5); // chain moved past nonce 1

        let tracker = make_tracker(Arc::clone(&store), Arc::clone(&chain));
        tracker.tick().await.unwrap();
        let stored = store.record(record.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Dropped);
    }

    #[tokio::test]
    async fn aged_record_without_advance_is_stuck_not_dropped() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new());
        let record = make_record(3, 300);
        store.insert_record(&record).await.unwrap();
        chain.set_pending(3); // pending-count == nonce: slot not consumed

        let tracker = make_tracker(Arc::clone(&store), chain);
        tracker.tick().await.unwrap();
        let stored = store.record(record.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.status, TxStatus::Pending);
        let first = stored.stuck_since.unwrap();

        // A second pass keeps the original stuck timestamp.
        tracker.tick().await.unwrap();
        let stored = store.record(record.tx_hash).await.unwrap().unwrap();
        assert_eq!(stored.stuck_since, Some(first));
    }

    #[tokio::test]
    async fn locked_records_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let chain = Arc::new(MockChain::new());
        let record = make_record(1, 10);
        store.insert_record(&record).await.unwrap();
        assert!(store.try_lock_record(record.tx_hash).await);

        let tracker = make_tracker(Arc::clone(&store), chain);
        assert_eq!(tracker.tick().await.unwrap(), 0);
    }
}
