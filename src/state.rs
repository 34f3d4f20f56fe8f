//! Application state shared across handlers.
//!
//! Every capability (signer, chain clients, store, counters, policy engine,
//! allocator) is constructed here once and injected explicitly; there is no
//! service registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::chain::{ChainClient, RpcChainClient};
use crate::config::Config;
use crate::counters::Counters;
use crate::error::Error;
use crate::nonce::NonceAllocator;
use crate::pipeline::RelayPipeline;
use crate::policy::PolicyEngine;
use crate::signer::RelayerSigner;
use crate::store::{MemoryStore, Store};
use crate::tracker::ConfirmationTracker;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub counters: Arc<Counters>,
    pub policy: Arc<PolicyEngine>,
    pub allocator: Arc<NonceAllocator>,
    pub signer: Arc<RelayerSigner>,
    pub chains: HashMap<String, Arc<dyn ChainClient>>,
    pub pipeline: RelayPipeline,
    pub start_time: Instant,
    pub request_count: AtomicU64,
    pub ready: AtomicBool,
}

impl AppState {
    /// Build every capability from configuration and wire the pipeline.
    pub async fn new(config: Config) -> Result<Self, Error> {
        if config.networks.is_empty() {
            return Err(Error::Config("no networks configured".into()));
        }

        let mut chains: HashMap<String, Arc<dyn ChainClient>> = HashMap::new();
        for (name, net) in &config.networks {
            let client = RpcChainClient::new(
                name,
                net.chain_id,
                &net.rpc_url,
                net.fallback_rpc_url.as_deref(),
                net.private_rpc_url.as_deref(),
            )?;
            chains.insert(name.clone(), Arc::new(client));
        }

        let signer = Arc::new(RelayerSigner::from_config(&config.signer).await?);
        info!(relayer = %signer.address(), "Signer ready");

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.init().await?;

        let counters = Arc::new(Counters::new(config.counter_max_window()));
        let policy = Arc::new(PolicyEngine::new(Arc::clone(&store), Arc::clone(&counters)));
        policy.reload().await?;

        let allocator = Arc::new(NonceAllocator::new(config.saturation_threshold));

        let pipeline = RelayPipeline::new(
            &config,
            Arc::clone(&policy),
            Arc::clone(&allocator),
            Arc::clone(&signer),
            chains.clone(),
            Arc::clone(&store),
            Arc::clone(&counters),
        );

        info!(
            networks = chains.len(),
            relayer = %signer.address(),
            "Relayer state constructed"
        );

        Ok(Self {
            config,
            store,
            counters,
            policy,
            allocator,
            signer,
            chains,
            pipeline,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
            ready: AtomicBool::new(false),
        })
    }

    /// Build the confirmation tracker over this state's capabilities.
    pub fn tracker(&self) -> ConfirmationTracker {
        ConfirmationTracker::new(
            Arc::clone(&self.store),
            self.chains.clone(),
            Arc::clone(&self.allocator),
            self.config.confirm_interval(),
            self.config.grace_window(),
        )
    }
}
