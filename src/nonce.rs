//! Per-(relayer-address, network) sequence-number allocation.
//!
//! Each key owns a cursor behind its own mutex; there is no global lock.
//! The mutex doubles as the submission lock: a lease keeps it held until
//! the signed bytes reach the chain client, which is what guarantees that
//! submissions broadcast in sequence-number order. Cursors initialise
//! lazily from the chain's pending-count and only ever move forward on
//! resync.

use alloy::primitives::Address;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::chain::ChainClient;
use crate::error::Error;

/// Allocator key: one cursor per relayer account per network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonceKey {
    pub relayer: Address,
    pub network: String,
}

impl NonceKey {
    pub fn new(relayer: Address, network: &str) -> Self {
        Self {
            relayer,
            network: network.to_string(),
        }
    }
}

#[derive(Default, Debug)]
struct Cursor {
    /// Next value to hand out. `None` until first initialised from chain.
    next: Option<u64>,
}

struct KeyState {
    cursor: Arc<Mutex<Cursor>>,
    /// Callers currently queued on the cursor mutex.
    waiters: AtomicU32,
}

impl KeyState {
    fn new() -> Self {
        Self {
            cursor: Arc::new(Mutex::new(Cursor::default())),
            waiters: AtomicU32::new(0),
        }
    }
}

/// An allocated sequence number. Holding the lease holds the per-key lock;
/// drop it only after the broadcast hand-off (or call [`release`] to return
/// the slot on a pre-broadcast failure).
///
/// [`release`]: NonceLease::release
#[derive(Debug)]
pub struct NonceLease {
    value: u64,
    guard: OwnedMutexGuard<Cursor>,
}

impl NonceLease {
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Return an unused slot. Only the most recently issued value can be
    /// returned; anything else would re-issue a consumed number.
    pub fn release(mut self) {
        if self.guard.next == Some(self.value + 1) {
            self.guard.next = Some(self.value);
            debug!(nonce = self.value, "Released unused sequence number");
        }
    }
}

/// The sequence-number allocator.
pub struct NonceAllocator {
    keys: DashMap<NonceKey, Arc<KeyState>>,
    saturation_threshold: u32,
}

impl NonceAllocator {
    pub fn new(saturation_threshold: u32) -> Self {
        Self {
            keys: DashMap::new(),
            saturation_threshold,
        }
    }

    fn state(&self, key: &NonceKey) -> Arc<KeyState> {
        self.keys
            .entry(key.clone())
            .or_insert_with(|| Arc::new(KeyState::new()))
            .clone()
    }

    /// Allocate the next sequence number for `key`, serialised per key.
    ///
    /// Initialises the cursor from the chain's pending-count on first use
    /// (one retry, then `allocator-stalled`). Rejects with
    /// `relayer-saturated` when the per-key queue exceeds the threshold.
    pub async fn acquire(
        &self,
        key: &NonceKey,
        chain: &dyn ChainClient,
    ) -> Result<NonceLease, Error> {
        let state = self.state(key);

        let queued = state.waiters.fetch_add(1, Ordering::SeqCst);
        if queued >= self.saturation_threshold {
            state.waiters.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::RelayerSaturated(format!(
                "{queued} callers queued for {:#x} on {}",
                key.relayer, key.network
            )));
        }

        let mut guard = state.cursor.clone().lock_owned().await;
        state.waiters.fetch_sub(1, Ordering::SeqCst);

        if guard.next.is_none() {
            let pending = fetch_pending_count(chain, key).await?;
            info!(
                relayer = %key.relayer,
                network = %key.network,
                cursor = pending,
                "Sequence cursor initialized from chain"
            );
            guard.next = Some(pending);
        }

        let value = guard.next.unwrap();
        guard.next = Some(value + 1);
        Ok(NonceLease { value, guard })
    }

    /// Force the cursor to at least the chain's pending-count. Never
    /// decreases. Returns the cursor after the sync.
    pub async fn resync(&self, key: &NonceKey, chain: &dyn ChainClient) -> Result<u64, Error> {
        let state = self.state(key);
        let mut guard = state.cursor.lock().await;
        let pending = fetch_pending_count(chain, key).await?;
        let current = guard.next.unwrap_or(0);
        let next = current.max(pending);
        if next != current {
            info!(
                relayer = %key.relayer,
                network = %key.network,
                from = current,
                to = next,
                "Sequence cursor resynced"
            );
        }
        guard.next = Some(next);
        Ok(next)
    }

    /// Queue depth for one key; exposed for health reporting.
    pub fn queued(&self, key: &NonceKey) -> u32 {
        self.keys
            .get(key)
            .map(|s| s.waiters.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// Pending-count read with a single retry (the allocator's only tolerated
/// transient), then fail fast.
async fn fetch_pending_count(chain: &dyn ChainClient, key: &NonceKey) -> Result<u64, Error> {
    match chain.pending_count(key.relayer).await {
        Ok(n) => Ok(n),
        Err(_) => chain.pending_count(key.relayer).await.map_err(|e| {
            Error::AllocatorStalled(format!(
                "pending-count unavailable for {:#x} on {}: {e}",
                key.relayer, key.network
            ))
        }),
    }
}
