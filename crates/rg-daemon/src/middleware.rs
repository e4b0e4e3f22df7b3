// SPDX-License-Identifier: MIT OR Apache-2.0
//! Middleware stack for the ReceiptGate HTTP API: request id, structured
//! access logging, a sliding-window rate limiter, CORS, and API-key
//! authentication.

use axum::{
    extract::{Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use rg_core::RgError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::AppState;

/// A unique request identifier, available as an Axum extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub Uuid);

/// Generates a [`RequestId`] for each request and sets the `X-Request-Id`
/// response header.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = RequestId(Uuid::new_v4());
    req.extensions_mut().insert(id);
    let mut resp = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

/// Logs method, path, status code, and duration for each request via
/// [`tracing`] structured fields.
pub async fn request_logger(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let start = Instant::now();

    let resp = next.run(req).await;

    let duration = start.elapsed();
    info!(
        http.method = %method,
        http.path = %path,
        http.status = resp.status().as_u16(),
        http.duration_ms = duration.as_millis() as u64,
        "request completed"
    );
    resp
}

/// Verifies `Authorization: Bearer <key>` or `X-API-Key: <key>` against the
/// configured key, constant-time. Bypassed entirely when
/// `allow_insecure_dev` is set.
pub async fn require_api_key(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    if state.config.allow_insecure_dev {
        return next.run(req).await;
    }

    let Some(configured) = state.config.api_key.as_deref() else {
        return RgError::ServerMisconfigured.into_response();
    };

    let presented = extract_presented_key(&req);
    match presented {
        Some(key) if constant_time_eq::constant_time_eq(key.as_bytes(), configured.as_bytes()) => next.run(req).await,
        _ => RgError::Unauthorized.into_response(),
    }
}

fn extract_presented_key(req: &Request) -> Option<String> {
    let bearer = req
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        return Some(token.to_string());
    }
    req.headers().get("x-api-key").and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Multiple of `receipt_body_max_bytes` allowed for the *whole* request
/// envelope (the limit itself only bounds the `body` sub-object), before the
/// request is rejected without ever reaching the JSON parser.
const ENVELOPE_OVERHEAD_FACTOR: usize = 4;
/// Floor under the computed envelope ceiling, so a deployment that sets a
/// tiny `receipt_body_max_bytes` doesn't also reject ordinary envelope
/// overhead (ids, refs, headers-as-JSON).
const MIN_ENVELOPE_LIMIT_BYTES: usize = 65_536;

/// Rejects a request whose `Content-Length` exceeds a ceiling derived from
/// `receipt_body_max_bytes` before its body is ever read or parsed. This is
/// distinct from `rg-validate`'s size check, which bounds only the `body`
/// sub-object after the full envelope has already been decoded.
pub async fn body_limit(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let limit = (state.config.receipt_body_max_bytes * ENVELOPE_OVERHEAD_FACTOR).max(MIN_ENVELOPE_LIMIT_BYTES);

    let content_length = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    if let Some(actual) = content_length {
        if actual > limit {
            return RgError::BodyTooLarge { actual, limit }.into_response();
        }
    }

    next.run(req).await
}

/// In-memory sliding-window rate limiter, shared across every connection
/// handled by one process.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    /// Allow `max_requests` within `window`.
    #[must_use]
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            window,
        }
    }

    async fn check(&self) -> Result<(), StatusCode> {
        let now = Instant::now();
        let mut timestamps = self.inner.lock().await;
        while let Some(&front) = timestamps.front() {
            if now.duration_since(front) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
        if timestamps.len() as u32 >= self.max_requests {
            return Err(StatusCode::TOO_MANY_REQUESTS);
        }
        timestamps.push_back(now);
        Ok(())
    }
}

/// Axum middleware entry point; pair with [`axum::middleware::from_fn_with_state`].
pub async fn rate_limit(State(limiter): State<RateLimiter>, req: Request, next: Next) -> Response {
    match limiter.check().await {
        Ok(()) => next.run(req).await,
        Err(status) => (status, "too many requests").into_response(),
    }
}

/// Build a [`CorsLayer`] from the configured allow-lists.
/// Entries that don't parse as valid header values/methods are skipped
/// rather than failing startup — an operator typo in one origin shouldn't
/// take down the whole policy.
#[must_use]
pub fn cors_layer(origins: &[String], methods: &[String], headers: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| HeaderValue::from_str(o).ok()).collect();
    let methods: Vec<axum::http::Method> = methods.iter().filter_map(|m| m.parse().ok()).collect();
    let headers: Vec<axum::http::HeaderName> = headers.iter().filter_map(|h| h.parse().ok()).collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list(methods))
        .allow_headers(AllowHeaders::list(headers))
}
