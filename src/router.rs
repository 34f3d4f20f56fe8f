//! HTTP router and middleware stack.

use crate::handlers;
use crate::middleware::{api_key_auth, inject_request_id};
use crate::state::AppState;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post, put};
use axum::Router;
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const MAX_BODY_SIZE: usize = 1024 * 1024; // 1 MB
const MAX_CONCURRENT_RELAY: usize = 256;
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub fn create(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PUT,
            axum::http::Method::DELETE,
        ])
        .allow_headers(Any);

    let relay_route = Router::new()
        .route("/relay", post(handlers::relay))
        .layer(middleware::from_fn(api_key_auth))
        .layer(ConcurrencyLimitLayer::new(MAX_CONCURRENT_RELAY));

    // Policy writes sit behind the same key as the relay route.
    let rule_routes = Router::new()
        .route("/rules", get(handlers::list_rules).post(handlers::create_rule))
        .route(
            "/rules/{id}",
            put(handlers::update_rule).delete(handlers::delete_rule),
        )
        .route("/rules/reload", post(handlers::reload_rules))
        .layer(middleware::from_fn(api_key_auth));

    let public_routes = Router::new()
        .route("/live", get(handlers::live))
        .route("/ready", get(handlers::ready))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/tx/{tx_hash}", get(handlers::tx_status))
        .route("/accounts/{address}/txs", get(handlers::list_txs));

    public_routes
        .merge(relay_route)
        .merge(rule_routes)
        .layer(middleware::from_fn(inject_request_id))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
