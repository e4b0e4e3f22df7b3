// SPDX-License-Identifier: MIT OR Apache-2.0
#![warn(missing_docs)]

//! HTTP surface for ReceiptGate: REST handlers and a JSON-RPC/MCP
//! dispatcher over a shared [`Ledger`].

pub mod mcp;
pub mod middleware;
pub mod rest;

use axum::Router;
use axum::routing::{get, post};
use rg_config::Config;
use rg_ledger::Ledger;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;

use middleware::RateLimiter;

/// Shared application state handed to every handler.
pub struct AppState {
    /// The receipt ledger backing every endpoint.
    pub ledger: Arc<Ledger>,
    /// Resolved runtime configuration.
    pub config: Arc<Config>,
}

/// Requests allowed per rate-limiter window.
const RATE_LIMIT_MAX_REQUESTS: u32 = 600;
const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Build the full router: REST endpoints, the `/mcp` JSON-RPC endpoint, and
/// the middleware stack (request id, access log, rate limit, CORS, auth).
#[must_use]
pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = middleware::cors_layer(
        &state.config.cors.allowed_origins,
        &state.config.cors.allowed_methods,
        &state.config.cors.allowed_headers,
    );
    let limiter = RateLimiter::new(RATE_LIMIT_MAX_REQUESTS, RATE_LIMIT_WINDOW);

    let protected = Router::new()
        .route("/receipts", post(rest::put_receipt))
        .route("/receipts/search", post(rest::search_receipts))
        .route("/receipts/stats", get(rest::get_stats))
        .route("/receipts/{id}", get(rest::get_receipt))
        .route("/receipts/{id}/chain", get(rest::get_chain))
        .route("/inbox/{recipient}", get(rest::get_inbox))
        .route("/mcp", post(mcp::handle_mcp))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), middleware::require_api_key));

    Router::new()
        .route("/health", get(rest::health))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(axum::middleware::from_fn(middleware::request_id_middleware))
                .layer(axum::middleware::from_fn(middleware::request_logger))
                .layer(axum::middleware::from_fn_with_state(limiter, middleware::rate_limit))
                .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::body_limit))
                .layer(cors),
        )
        .with_state(state)
}
