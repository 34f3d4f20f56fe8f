//! End-to-end relay flow scenarios over an in-process mock chain.

use alloy::consensus::TxEnvelope;
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{keccak256, Address, B256, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use forward_relayer::chain::{CallRequest, ChainClient, FeeSuggestion, ReceiptInfo};
use forward_relayer::config::{Config, NetworkConfig};
use forward_relayer::counters::{CounterKey, Counters, Dimension};
use forward_relayer::nonce::NonceAllocator;
use forward_relayer::pipeline::RelayPipeline;
use forward_relayer::policy::{build_rule, PolicyEngine};
use forward_relayer::signer::RelayerSigner;
use forward_relayer::store::{MemoryStore, Store};
use forward_relayer::tracker::ConfirmationTracker;
use forward_relayer::types::{PolicyRule, RelayRequestWire, RuleKind, RuleTarget, TxStatus};
use forward_relayer::verifier::{signing_digest, ForwardRequest};
use forward_relayer::Error;

const FORWARDER: Address = Address::repeat_byte(0xfd);
const CHAIN_ID: u64 = 31337;

fn one_eth() -> U256 {
    U256::from(10u64).pow(U256::from(18u64))
}

// --- Mock chain ---

struct MockChain {
    pending: Mutex<u64>,
    receipts: Mutex<HashMap<B256, ReceiptInfo>>,
    broadcasts: Mutex<Vec<Vec<u8>>>,
    fail_broadcast: AtomicBool,
}

impl MockChain {
    fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            receipts: Mutex::new(HashMap::new()),
            broadcasts: Mutex::new(Vec::new()),
            fail_broadcast: AtomicBool::new(false),
        }
    }

    fn set_pending(&self, n: u64) {
        *self.pending.lock().unwrap() = n;
    }

    fn set_receipt(&self, hash: B256, receipt: ReceiptInfo) {
        self.receipts.lock().unwrap().insert(hash, receipt);
    }

    fn broadcast_nonces(&self) -> Vec<u64> {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .map(|raw| {
                let envelope = TxEnvelope::decode_2718(&mut raw.as_slice()).unwrap();
                match envelope {
                    TxEnvelope::Eip1559(signed) => signed.tx().nonce,
                    other => panic!("unexpected envelope: {other:?}"),
                }
            })
            .collect()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    fn network(&self) -> &str {
        "localhost"
    }

    fn chain_id(&self) -> u64 {
        CHAIN_ID
    }

    async fn head_block(&self) -> Result<u64, Error> {
        Ok(100)
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
        Ok(50_000)
    }

    async fn simulate(&self, _call: &CallRequest) -> Result<(), Error> {
        Ok(())
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<B256, Error> {
        if self.fail_broadcast.load(Ordering::SeqCst) {
            return Err(Error::BroadcastFailed("injected broadcast failure".into()));
        }
        self.broadcasts.lock().unwrap().push(raw.to_vec());
        *self.pending.lock().unwrap() += 1;
        Ok(keccak256(raw))
    }

    async fn receipt(&self, tx_hash: B256) -> Result<Option<ReceiptInfo>, Error> {
        Ok(self.receipts.lock().unwrap().get(&tx_hash).copied())
    }
}

// --- Harness ---

struct Harness {
    config: Config,
    store: Arc<MemoryStore>,
    counters: Arc<Counters>,
    allocator: Arc<NonceAllocator>,
    chain: Arc<MockChain>,
    pipeline: RelayPipeline,
    relayer: Address,
}

impl Harness {
    async fn new(rules: Vec<PolicyRule>) -> Self {
        Self::with_grace(rules, 120).await
    }

    async fn with_grace(rules: Vec<PolicyRule>, grace_secs: u64) -> Self {
        let mut config = Config::default();
        config.grace_window_secs = grace_secs;
        config.networks.insert(
            "localhost".into(),
            NetworkConfig {
                chain_id: CHAIN_ID,
                rpc_url: "http://127.0.0.1:8545".into(),
                fallback_rpc_url: None,
                forwarder: FORWARDER,
                private_rpc_url: None,
            },
        );

        let store = Arc::new(MemoryStore::new());
        for rule in &rules {
            store.insert_rule(rule).await.unwrap();
        }
        let counters = Arc::new(Counters::new(config.counter_max_window()));
        let policy = Arc::new(PolicyEngine::new(
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&counters),
        ));
        policy.reload().await.unwrap();

        let allocator = Arc::new(NonceAllocator::new(config.saturation_threshold));
        let signer = Arc::new(RelayerSigner::Local {
            signer: PrivateKeySigner::random(),
        });
        let relayer = signer.address();

        let chain = Arc::new(MockChain::new());
        let mut chains: HashMap<String, Arc<dyn ChainClient>> = HashMap::new();
        chains.insert("localhost".into(), Arc::clone(&chain) as Arc<dyn ChainClient>);

        let pipeline = RelayPipeline::new(
            &config,
            policy,
            Arc::clone(&allocator),
            signer,
            chains,
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::clone(&counters),
        );

        Self {
            config,
            store,
            counters,
            allocator,
            chain,
            pipeline,
            relayer,
        }
    }

    fn tracker(&self) -> ConfirmationTracker {
        let mut chains: HashMap<String, Arc<dyn ChainClient>> = HashMap::new();
        chains.insert(
            "localhost".into(),
            Arc::clone(&self.chain) as Arc<dyn ChainClient>,
        );
        ConfirmationTracker::new(
            Arc::clone(&self.store) as Arc<dyn Store>,
            chains,
            Arc::clone(&self.allocator),
            Duration::from_secs(5),
            self.config.grace_window(),
        )
    }
}

/// Sign a request the way a user's wallet would: EIP-712 over the
/// MinimalForwarder domain.
fn signed_request(
    user: &PrivateKeySigner,
    to: Address,
    value: U256,
    gas: u64,
    user_nonce: u64,
) -> RelayRequestWire {
    let payload = ForwardRequest {
        from: user.address(),
        to,
        value,
        gas: U256::from(gas),
        nonce: U256::from(user_nonce),
        data: alloy::primitives::Bytes::new(),
    };
    let digest = signing_digest(&payload, CHAIN_ID, FORWARDER);
    let signature = user.sign_hash_sync(&digest).unwrap();
    RelayRequestWire {
        from: format!("{:#x}", user.address()),
        to: format!("{to:#x}"),
        value: value.to_string(),
        gas: gas.to_string(),
        nonce: user_nonce.to_string(),
        data: "0x".into(),
        signature: format!("0x{}", alloy::hex::encode(signature.as_bytes())),
        network: "localhost".into(),
        token_address: None,
        token_kind: None,
        amount: None,
        token_id: None,
    }
}

fn allowlist_rule(addresses: &[Address]) -> PolicyRule {
    let addrs: Vec<String> = addresses.iter().map(|a| format!("{a:#x}")).collect();
    build_rule(
        "allowlist",
        RuleKind::Allowlist,
        RuleTarget::Any,
        json!({ "addresses": addrs }),
    )
    .unwrap()
}

// --- Scenario 1: happy path single transfer ---

#[tokio::test]
async fn happy_path_single_transfer() {
    let user = PrivateKeySigner::random();
    let peer = Address::repeat_byte(0xbb);
    let harness = Harness::new(vec![allowlist_rule(&[user.address(), peer])]).await;

    let wire = signed_request(&user, peer, one_eth(), 100_000, 0);
    let outcome = harness.pipeline.relay(wire).await.unwrap();
    assert_ne!(outcome.tx_hash, B256::ZERO);
    assert!(outcome.gas_limit >= 50_000 && outcome.gas_limit <= 100_000);

    // Record persisted as pending.
    let record = harness.store.record(outcome.tx_hash).await.unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Pending);
    assert_eq!(record.from, user.address());
    assert_eq!(record.nonce, 0);
    assert_eq!(record.relayer, harness.relayer);

    // Counters advanced by 1 and 10^18 for (user, localhost).
    let now = chrono::Utc::now().timestamp();
    let count_key = CounterKey::new(Dimension::TxCount, user.address(), "localhost");
    let value_key = CounterKey::new(Dimension::TxValue, user.address(), "localhost");
    assert_eq!(
        harness.counters.count(&count_key, Duration::from_secs(3600), now),
        1
    );
    assert_eq!(
        harness.counters.sum(&value_key, Duration::from_secs(3600), now),
        one_eth()
    );

    // Confirmation arrives; the tracker lands the record.
    harness.chain.set_receipt(
        outcome.tx_hash,
        ReceiptInfo {
            status: true,
            gas_used: 48_000,
            block_number: 101,
            effective_gas_price: U256::from(1_100_000_000u64),
        },
    );
    harness.tracker().tick().await.unwrap();
    let record = harness.store.record(outcome.tx_hash).await.unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Confirmed);
    assert_eq!(record.gas_used, Some(48_000));
    assert_eq!(record.block_number, Some(101));
}

// --- Scenario 2: signature mismatch ---

#[tokio::test]
async fn signature_mismatch_touches_nothing() {
    let user = PrivateKeySigner::random();
    let harness = Harness::new(vec![]).await;

    let mut wire = signed_request(&user, Address::repeat_byte(0xbb), one_eth(), 100_000, 0);
    // Replace one byte of the signature.
    let mut sig = wire.signature.clone().into_bytes();
    sig[20] = if sig[20] == b'0' { b'1' } else { b'0' };
    wire.signature = String::from_utf8(sig).unwrap();

    let err = harness.pipeline.relay(wire).await.unwrap_err();
    assert_eq!(err.code(), "invalid-request");

    // No record persisted, nothing broadcast, allocator untouched.
    assert!(harness.store.list_pending().await.unwrap().is_empty());
    assert!(harness.chain.broadcasts.lock().unwrap().is_empty());
}

// --- Scenario 3: quota exhaustion ---

#[tokio::test]
async fn hourly_quota_exhaustion() {
    let user = PrivateKeySigner::random();
    let quota = build_rule(
        "quota",
        RuleKind::Quota,
        RuleTarget::Any,
        json!({ "max_tx_per_hour": 2 }),
    )
    .unwrap();
    let harness = Harness::new(vec![quota]).await;

    for user_nonce in 0..2u64 {
        let wire = signed_request(
            &user,
            Address::repeat_byte(0xbb),
            U256::from(1u64),
            100_000,
            user_nonce,
        );
        harness.pipeline.relay(wire).await.unwrap();
    }

    let wire = signed_request(&user, Address::repeat_byte(0xbb), U256::from(1u64), 100_000, 2);
    let err = harness.pipeline.relay(wire).await.unwrap_err();
    assert_eq!(err.code(), "quota-exceeded");
    match err {
        Error::QuotaExceeded(reason) => assert!(reason.contains("hourly transaction")),
        other => panic!("expected quota rejection, got {other}"),
    }

    // Exactly two counter entries.
    let now = chrono::Utc::now().timestamp();
    let count_key = CounterKey::new(Dimension::TxCount, user.address(), "localhost");
    assert_eq!(
        harness.counters.count(&count_key, Duration::from_secs(3600), now),
        2
    );
}

// --- Scenario 4: race on the allocator ---

#[tokio::test]
async fn concurrent_relays_use_contiguous_sequence_numbers() {
    let users: Vec<PrivateKeySigner> = (0..50).map(|_| PrivateKeySigner::random()).collect();
    let addresses: Vec<Address> = users.iter().map(|u| u.address()).collect();
    let harness = Arc::new(Harness::new(vec![allowlist_rule(&addresses)]).await);

    let wires: Vec<RelayRequestWire> = users
        .iter()
        .map(|user| signed_request(user, Address::repeat_byte(0xbb), U256::from(1u64), 100_000, 0))
        .collect();

    let mut handles = Vec::new();
    for wire in wires {
        let harness = Arc::clone(&harness);
        handles.push(tokio::spawn(async move {
            harness.pipeline.relay(wire).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut nonces = harness.chain.broadcast_nonces();
    nonces.sort_unstable();
    let expected: Vec<u64> = (0..50).collect();
    assert_eq!(nonces, expected);

    assert_eq!(harness.store.list_pending().await.unwrap().len(), 50);
}

// --- Scenario 5: broadcast fails after persist ---

#[tokio::test]
async fn broadcast_failure_after_persist_is_tracked_to_dropped() {
    let user = PrivateKeySigner::random();
    // Grace window of zero so the tracker may act immediately.
    let harness = Harness::with_grace(vec![allowlist_rule(&[user.address()])], 0).await;

    harness.chain.fail_broadcast.store(true, Ordering::SeqCst);

    let wire = signed_request(&user, Address::repeat_byte(0xbb), U256::from(1u64), 100_000, 0);
    let err = harness.pipeline.relay(wire.clone()).await.unwrap_err();
    assert!(err.status().is_server_error());

    // The record exists in pending with its slot consumed.
    let pending = harness.store.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    let first_hash = pending[0].tx_hash;
    assert_eq!(pending[0].nonce, 0);

    // Retrying the same request fails again and persists no duplicate of
    // any tx-hash.
    let err = harness.pipeline.relay(wire).await.unwrap_err();
    assert!(err.status().is_server_error());
    let pending = harness.store.list_pending().await.unwrap();
    let mut hashes: Vec<B256> = pending.iter().map(|r| r.tx_hash).collect();
    hashes.sort();
    hashes.dedup();
    assert_eq!(hashes.len(), pending.len());

    // Counters were never advanced for the failed attempts.
    let now = chrono::Utc::now().timestamp();
    let count_key = CounterKey::new(Dimension::TxCount, user.address(), "localhost");
    assert_eq!(
        harness.counters.count(&count_key, Duration::from_secs(3600), now),
        0
    );

    // The chain advances past the consumed slots (siblings landed); the
    // tracker drops the receiptless records once the grace window elapses.
    harness.chain.set_pending(10);
    harness.tracker().tick().await.unwrap();
    let record = harness.store.record(first_hash).await.unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Dropped);
}

// --- Scenario 6: token cap ---

#[tokio::test]
async fn token_cap_rejects_before_allocation() {
    let user = PrivateKeySigner::random();
    let token = Address::repeat_byte(0x77);
    let cap = build_rule(
        "token-cap",
        RuleKind::TokenCap,
        RuleTarget::Any,
        json!({ "token": format!("{token:#x}"), "max_amount_per_tx": "1000" }),
    )
    .unwrap();
    let harness = Harness::new(vec![cap]).await;

    let mut wire = signed_request(&user, Address::repeat_byte(0xbb), U256::ZERO, 100_000, 0);
    wire.token_address = Some(format!("{token:#x}"));
    wire.token_kind = Some("fungible".into());
    wire.amount = Some("1001".into());

    let err = harness.pipeline.relay(wire).await.unwrap_err();
    assert_eq!(err.code(), "token-cap-exceeded");

    // Rejected before allocation: nothing persisted, nothing broadcast.
    assert!(harness.store.list_pending().await.unwrap().is_empty());
    assert!(harness.chain.broadcasts.lock().unwrap().is_empty());
}

// --- Terminal immutability across the whole flow ---

#[tokio::test]
async fn terminal_records_never_change() {
    let user = PrivateKeySigner::random();
    let harness = Harness::with_grace(vec![allowlist_rule(&[user.address()])], 0).await;

    let wire = signed_request(&user, Address::repeat_byte(0xbb), U256::from(1u64), 100_000, 0);
    let outcome = harness.pipeline.relay(wire).await.unwrap();

    harness.chain.set_receipt(
        outcome.tx_hash,
        ReceiptInfo {
            status: true,
            gas_used: 48_000,
            block_number: 101,
            effective_gas_price: U256::from(1_000_000_000u64),
        },
    );
    harness.tracker().tick().await.unwrap();

    // Subsequent ticks see no pending work and the record stays confirmed.
    assert_eq!(harness.tracker().tick().await.unwrap(), 0);
    let record = harness.store.record(outcome.tx_hash).await.unwrap().unwrap();
    assert_eq!(record.status, TxStatus::Confirmed);
}
