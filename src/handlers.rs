//! HTTP request handlers.

use crate::error::Error;
use crate::metrics::METRICS;
use crate::middleware::RequestId;
use crate::policy::PolicyEngine;
use crate::response::{HealthResponse, ListingResponse, RelayResponse};
use crate::state::AppState;
use crate::types::{canonical_address, PolicyRule, RelayRequestWire, RuleKind, RuleTarget};
use alloy::primitives::{Address, B256};
use axum::extract::{FromRequest, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Max page size for the listing endpoint.
const MAX_LIST_LIMIT: usize = 1000;
const DEFAULT_LIST_LIMIT: usize = 100;

/// Liveness probe. Returns immediately.
pub async fn live() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe. Succeeds once store, counters and every chain client
/// have reported healthy at least once; sticky afterwards.
pub async fn ready(State(state): State<Arc<AppState>>) -> StatusCode {
    if state.ready.load(Ordering::Relaxed) {
        return StatusCode::OK;
    }
    if state.store.ping().await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    for chain in state.chains.values() {
        if chain.head_block().await.is_err() {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
    }
    state.ready.store(true, Ordering::Relaxed);
    StatusCode::OK
}

/// Health check with signer and tracker visibility.
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let signer_status = match state.signer.health_check().await {
        Ok(()) => "ok",
        Err(_) => "degraded",
    };
    let pending_records = state
        .store
        .list_pending()
        .await
        .map(|p| p.len())
        .unwrap_or(0);
    let status = if signer_status == "ok" { "ok" } else { "degraded" };
    let mut networks: Vec<String> = state.chains.keys().cloned().collect();
    networks.sort();

    Json(HealthResponse {
        status,
        relayer_address: canonical_address(state.signer.address()),
        networks,
        uptime_secs: state.start_time.elapsed().as_secs(),
        requests: state.request_count.load(Ordering::Relaxed),
        signer_status,
        pending_records,
    })
}

/// Prometheus metrics in text exposition format.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pending_records = state
        .store
        .list_pending()
        .await
        .map(|p| p.len())
        .unwrap_or(0);
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        METRICS.render(pending_records),
    )
}

/// Relay a signed meta-transaction request. `POST /relay`
pub async fn relay(
    State(state): State<Arc<AppState>>,
    request_parts: axum::extract::Request,
) -> Response {
    let start = Instant::now();
    METRICS.relay_total.fetch_add(1, Ordering::Relaxed);
    state.request_count.fetch_add(1, Ordering::Relaxed);

    let req_id = request_parts
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_default();

    let wire: RelayRequestWire =
        match Json::<RelayRequestWire>::from_request(request_parts, &state).await {
            Ok(Json(w)) => w,
            Err(e) => {
                METRICS.relay_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(req_id = %req_id, error = %e, "Malformed relay body");
                return Error::InvalidRequest {
                    field: "body",
                    reason: e.to_string(),
                }
                .into_response();
            }
        };

    info!(req_id = %req_id, network = %wire.network, from = %wire.from, "Relay request");

    match state.pipeline.relay(wire).await {
        Ok(outcome) => {
            METRICS.relay_success.fetch_add(1, Ordering::Relaxed);
            METRICS.record_relay_duration(start);
            info!(req_id = %req_id, tx_hash = %outcome.tx_hash, "Relay accepted");
            (
                StatusCode::OK,
                Json(RelayResponse::broadcast(
                    format!("{:#x}", outcome.tx_hash),
                    outcome.gas_price,
                    outcome.gas_limit,
                )),
            )
                .into_response()
        }
        Err(e) => {
            if e.status().is_client_error() {
                METRICS.relay_rejected.fetch_add(1, Ordering::Relaxed);
                info!(req_id = %req_id, code = e.code(), "Relay rejected");
            } else {
                METRICS.relay_error.fetch_add(1, Ordering::Relaxed);
                warn!(req_id = %req_id, error = %e, "Relay failed");
            }
            METRICS.record_relay_duration(start);
            e.into_response()
        }
    }
}

/// Fetch one submission record. `GET /tx/{tx_hash}`
pub async fn tx_status(
    State(state): State<Arc<AppState>>,
    Path(tx_hash_str): Path<String>,
) -> Response {
    let tx_hash: B256 = match tx_hash_str.parse() {
        Ok(h) => h,
        Err(_) => {
            return Error::InvalidRequest {
                field: "tx_hash",
                reason: "expected 32-byte 0x-hex hash".into(),
            }
            .into_response();
        }
    };

    match state.store.record(tx_hash).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "ok": false,
                "code": "not-found",
                "reason": "no record for that hash",
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// List records involving an address. `GET /accounts/{address}/txs`
pub async fn list_txs(
    State(state): State<Arc<AppState>>,
    Path(address_str): Path<String>,
    Query(params): Query<ListParams>,
) -> Response {
    let address: Address = match address_str.parse() {
        Ok(a) => a,
        Err(_) => {
            return Error::InvalidRequest {
                field: "address",
                reason: "expected 20-byte 0x-hex address".into(),
            }
            .into_response();
        }
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);
    let offset = params.offset.unwrap_or(0);

    match state.store.list_by_account(address, limit, offset).await {
        Ok(records) => (
            StatusCode::OK,
            Json(ListingResponse {
                ok: true,
                records,
                limit,
                offset,
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

// --- Policy rule CRUD ---

#[derive(Deserialize)]
pub struct RuleParams {
    #[serde(default)]
    pub kind: Option<String>,
}

/// `GET /rules`
pub async fn list_rules(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RuleParams>,
) -> Response {
    let kind = match params.kind.as_deref() {
        Some(s) => match RuleKind::parse(s) {
            Some(k) => Some(k),
            None => {
                return Error::InvalidRequest {
                    field: "kind",
                    reason: "expected allowlist, quota, gas-cap or token-cap".into(),
                }
                .into_response();
            }
        },
        None => None,
    };
    match state.store.list_rules(kind).await {
        Ok(rules) => (StatusCode::OK, Json(rules)).into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
pub struct RuleWrite {
    #[serde(default)]
    pub id: Option<String>,
    pub kind: RuleKind,
    pub target: RuleTarget,
    pub value: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// `POST /rules`. Validates the body against the kind's schema before it
/// reaches the store.
pub async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RuleWrite>,
) -> Response {
    if let Err(e) = PolicyEngine::validate_value(body.kind, &body.value) {
        return e.into_response();
    }
    let id = body.id.unwrap_or_else(|| {
        use rand::Rng;
        format!("rule-{:012x}", rand::thread_rng().gen::<u64>() & 0xffff_ffff_ffff)
    });
    let rule = PolicyRule {
        id: id.clone(),
        kind: body.kind,
        target: body.target,
        value: body.value,
        enabled: body.enabled,
    };
    match state.store.insert_rule(&rule).await {
        Ok(()) => {
            state.policy.trigger_reload();
            info!(rule = %id, kind = rule.kind.as_str(), "Policy rule created");
            (StatusCode::CREATED, Json(rule)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `PUT /rules/{id}`
pub async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RuleWrite>,
) -> Response {
    if let Err(e) = PolicyEngine::validate_value(body.kind, &body.value) {
        return e.into_response();
    }
    let rule = PolicyRule {
        id: id.clone(),
        kind: body.kind,
        target: body.target,
        value: body.value,
        enabled: body.enabled,
    };
    match state.store.update_rule(&rule).await {
        Ok(()) => {
            state.policy.trigger_reload();
            info!(rule = %id, "Policy rule updated");
            (StatusCode::OK, Json(rule)).into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `DELETE /rules/{id}`
pub async fn delete_rule(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.store.delete_rule(&id).await {
        Ok(()) => {
            state.policy.trigger_reload();
            info!(rule = %id, "Policy rule deleted");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// `POST /rules/reload`. Explicit reload signal.
pub async fn reload_rules(State(state): State<Arc<AppState>>) -> Response {
    match state.policy.reload().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "ok": true })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
