//! # Forward Relayer
//!
//! A gas-fee sponsoring relayer for EIP-712 meta-transactions. Accepts
//! signed `ForwardRequest` payloads, verifies them against the
//! `MinimalForwarder` domain, evaluates policy, allocates a relayer
//! sequence number, signs and broadcasts the wrapping transaction, and
//! tracks it to confirmation.
//!
//! ## Quick Start
//! ```bash
//! cargo run --bin relayer
//! ```
//!
//! ## Endpoints
//! - `POST /relay` - Relay a signed meta-transaction request
//! - `GET /tx/{tx_hash}` - Submission record by hash
//! - `GET /accounts/{address}/txs` - Records involving an address
//! - `GET|POST /rules`, `PUT|DELETE /rules/{id}` - Policy rule CRUD
//! - `GET /live`, `GET /ready`, `GET /health`, `GET /metrics`

pub mod chain;
pub mod config;
pub mod counters;
mod error;
mod handlers;
pub mod kms;
mod metrics;
mod middleware;
pub mod nonce;
pub mod pipeline;
pub mod policy;
mod response;
mod router;
pub mod signer;
mod state;
pub mod store;
pub mod tracker;
pub mod types;
pub mod verifier;

pub use config::Config;
pub use error::Error;
pub use router::create as create_router;
pub use state::AppState;
