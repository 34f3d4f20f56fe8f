//! Relayer error types.
//!
//! Every rejection carries a machine-readable code and a human reason.
//! Internal failure detail (RPC URLs, signer backends, store messages) is
//! never echoed to callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Structural or cryptographic defect in the inbound request.
    InvalidRequest { field: &'static str, reason: String },
    UnsupportedNetwork(String),
    NotAllowlisted(String),
    QuotaExceeded(String),
    GasCapExceeded(String),
    TokenCapExceeded(String),
    WouldRevert(String),
    FeeCapTooLow(String),
    GasLimitTooLow(String),
    RelayerSaturated(String),
    AllocatorStalled(String),
    ChainTransient(String),
    PersistFailed(String),
    /// Broadcast failed after the pending record was persisted; the
    /// confirmation tracker owns the record from here.
    BroadcastFailed(String),
    SignerUnavailable(String),
    Config(String),
    Internal(String),
}

impl Error {
    /// Wire code for the `{ok:false, code, reason}` body.
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidRequest { .. } => "invalid-request",
            Error::UnsupportedNetwork(_) => "unsupported-network",
            Error::NotAllowlisted(_) => "not-allowlisted",
            Error::QuotaExceeded(_) => "quota-exceeded",
            Error::GasCapExceeded(_) => "gas-cap-exceeded",
            Error::TokenCapExceeded(_) => "token-cap-exceeded",
            Error::WouldRevert(_) => "would-revert",
            Error::FeeCapTooLow(_) => "fee-cap-too-low",
            Error::GasLimitTooLow(_) => "gas-limit-too-low",
            Error::RelayerSaturated(_) => "relayer-saturated",
            Error::AllocatorStalled(_)
            | Error::ChainTransient(_)
            | Error::PersistFailed(_)
            | Error::BroadcastFailed(_)
            | Error::SignerUnavailable(_)
            | Error::Config(_)
            | Error::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidRequest { .. }
            | Error::UnsupportedNetwork(_)
            | Error::GasCapExceeded(_)
            | Error::TokenCapExceeded(_)
            | Error::WouldRevert(_)
            | Error::FeeCapTooLow(_)
            | Error::GasLimitTooLow(_) => StatusCode::BAD_REQUEST,
            Error::NotAllowlisted(_) => StatusCode::FORBIDDEN,
            Error::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Error::RelayerSaturated(_)
            | Error::AllocatorStalled(_)
            | Error::SignerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ChainTransient(_) | Error::BroadcastFailed(_) => StatusCode::BAD_GATEWAY,
            Error::PersistFailed(_) | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Reason string safe to hand to the caller. 4xx variants expose their
    /// reason; 5xx variants collapse to a generic message.
    pub fn public_reason(&self) -> String {
        match self {
            Error::InvalidRequest { field, reason } => format!("field `{field}`: {reason}"),
            Error::UnsupportedNetwork(n) => format!("unknown network: {n}"),
            Error::NotAllowlisted(r)
            | Error::QuotaExceeded(r)
            | Error::GasCapExceeded(r)
            | Error::TokenCapExceeded(r)
            | Error::WouldRevert(r)
            | Error::FeeCapTooLow(r)
            | Error::GasLimitTooLow(r) => r.clone(),
            Error::RelayerSaturated(_) => "relayer saturated, try again".into(),
            Error::AllocatorStalled(_) => "sequence allocation unavailable, retry".into(),
            Error::ChainTransient(_) => "chain RPC temporarily unavailable, retry".into(),
            Error::PersistFailed(_) => "internal storage error".into(),
            Error::BroadcastFailed(_) => "broadcast failed; submission is being tracked".into(),
            Error::SignerUnavailable(_) => "signing backend unavailable, retry".into(),
            Error::Config(_) | Error::Internal(_) => "internal error".into(),
        }
    }

    /// Whether a caller may usefully retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RelayerSaturated(_)
                | Error::AllocatorStalled(_)
                | Error::ChainTransient(_)
                | Error::SignerUnavailable(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidRequest { field, reason } => {
                write!(f, "invalid request: field `{field}`: {reason}")
            }
            Error::UnsupportedNetwork(n) => write!(f, "unsupported network: {n}"),
            Error::NotAllowlisted(msg) => write!(f, "not allowlisted: {msg}"),
            Error::QuotaExceeded(msg) => write!(f, "quota exceeded: {msg}"),
            Error::GasCapExceeded(msg) => write!(f, "gas cap exceeded: {msg}"),
            Error::TokenCapExceeded(msg) => write!(f, "token cap exceeded: {msg}"),
            Error::WouldRevert(msg) => write!(f, "simulation reverted: {msg}"),
            Error::FeeCapTooLow(msg) => write!(f, "fee cap too low: {msg}"),
            Error::GasLimitTooLow(msg) => write!(f, "gas limit too low: {msg}"),
            Error::RelayerSaturated(msg) => write!(f, "relayer saturated: {msg}"),
            Error::AllocatorStalled(msg) => write!(f, "allocator stalled: {msg}"),
            Error::ChainTransient(msg) => write!(f, "chain error: {msg}"),
            Error::PersistFailed(msg) => write!(f, "persist failed: {msg}"),
            Error::BroadcastFailed(msg) => write!(f, "broadcast failed: {msg}"),
            Error::SignerUnavailable(msg) => write!(f, "signer unavailable: {msg}"),
            Error::Config(msg) => write!(f, "config error: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "ok": false,
            "code": self.code(),
            "reason": self.public_reason(),
        });
        (self.status(), Json(body)).into_response()
    }
}
