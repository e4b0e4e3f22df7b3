// SPDX-License-Identifier: MIT OR Apache-2.0
//! Black-box HTTP tests over the in-memory store, covering the concrete
//! scenarios enumerated for the obligation ledger's REST surface.

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use rg_config::Config;
use rg_daemon::{AppState, build_app};
use rg_ledger::{Ledger, LedgerOptions};
use rg_store::memory::MemoryStore;
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn test_app() -> Router {
    let config = Config {
        allow_insecure_dev: true,
        ..Config::default()
    };
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default()));
    let state = Arc::new(AppState {
        ledger,
        config: Arc::new(config),
    });
    build_app(state)
}

async fn body_json(resp: axum::http::Response<Body>) -> Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post(app: &Router, uri: &str, payload: Value) -> axum::http::Response<Body> {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(payload.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
}

async fn get(app: &Router, uri: &str) -> axum::http::Response<Body> {
    app.clone().oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap()
}

fn accepted(receipt_id: &str, obligation_id: &str, recipient: &str) -> Value {
    json!({
        "receipt_id": receipt_id,
        "obligation_id": obligation_id,
        "phase": "accepted",
        "recipient": recipient,
        "created_by": recipient,
        "task_ref": {"task_id": "t-1"},
    })
}

#[tokio::test]
async fn accept_then_resubmit_is_idempotent_replay() {
    let app = test_app();

    let resp = post(&app, "/receipts", accepted("r-1", "o-1", "agent:a")).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body = body_json(resp).await;
    assert_eq!(body["idempotent_replay"], false);

    let resp = post(&app, "/receipts", accepted("r-1", "o-1", "agent:a")).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["idempotent_replay"], true);
}

#[tokio::test]
async fn resubmitting_with_a_different_payload_is_a_collision() {
    let app = test_app();
    assert_eq!(post(&app, "/receipts", accepted("r-1", "o-1", "agent:a")).await.status(), StatusCode::CREATED);

    let mut changed = accepted("r-1", "o-1", "agent:a");
    changed["summary"] = json!("different");
    let resp = post(&app, "/receipts", changed).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "RECEIPT_ID_COLLISION");
}

#[tokio::test]
async fn inbox_opens_then_closes_on_completion() {
    let app = test_app();
    post(&app, "/receipts", accepted("r-1", "o-1", "agent:a")).await;

    let resp = get(&app, "/inbox/agent:a").await;
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body_json(resp).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["items"][0]["obligation_id"], "o-1");

    let complete = json!({
        "receipt_id": "r-1c",
        "obligation_id": "o-1",
        "phase": "complete",
        "caused_by_receipt_id": "r-1",
        "recipient": "agent:a",
        "created_by": "agent:a",
        "result": {"status": "ok"},
    });
    let resp = post(&app, "/receipts", complete).await;
    assert_eq!(resp.status(), StatusCode::CREATED);

    let resp = get(&app, "/inbox/agent:a").await;
    let body = body_json(resp).await;
    assert_eq!(body["items"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn completing_an_obligation_with_no_accept_is_rejected() {
    let app = test_app();
    let complete = json!({
        "receipt_id": "r-x",
        "obligation_id": "o-unknown",
        "phase": "complete",
        "recipient": "agent:a",
        "created_by": "agent:a",
        "result": {"status": "ok"},
    });
    let resp = post(&app, "/receipts", complete).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "COMPLETE_WITHOUT_ACCEPT");
}

#[tokio::test]
async fn a_second_terminal_receipt_for_the_same_obligation_is_rejected() {
    let app = test_app();
    post(&app, "/receipts", accepted("r-1", "o-1", "agent:a")).await;
    let first_complete = json!({
        "receipt_id": "r-1c",
        "obligation_id": "o-1",
        "phase": "complete",
        "caused_by_receipt_id": "r-1",
        "recipient": "agent:a",
        "created_by": "agent:a",
        "result": {"status": "ok"},
    });
    assert_eq!(post(&app, "/receipts", first_complete).await.status(), StatusCode::CREATED);

    let second_complete = json!({
        "receipt_id": "r-1c2",
        "obligation_id": "o-1",
        "phase": "complete",
        "caused_by_receipt_id": "r-1c",
        "recipient": "agent:a",
        "created_by": "agent:a",
        "result": {"status": "ok"},
    });
    let resp = post(&app, "/receipts", second_complete).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "OBLIGATION_ALREADY_TERMINATED");
}

#[tokio::test]
async fn escalation_opens_the_child_obligation_in_the_inbox_not_the_parent() {
    let app = test_app();
    post(&app, "/receipts", accepted("r-2", "o-2", "agent:a")).await;

    let escalate = json!({
        "receipt_id": "r-2e",
        "obligation_id": "o-2",
        "phase": "escalate",
        "caused_by_receipt_id": "r-2",
        "recipient": "agent:a",
        "created_by": "agent:a",
        "escalation": {
            "parent_receipt_id": "r-2",
            "parent_obligation_id": "o-2",
            "child_obligation_id": "o-2c",
            "from": "agent:a",
            "to": "agent:a",
            "reason": "x",
        },
    });
    assert_eq!(post(&app, "/receipts", escalate).await.status(), StatusCode::CREATED);

    let body = body_json(get(&app, "/inbox/agent:a").await).await;
    let obligations: Vec<&str> = body["items"].as_array().unwrap().iter().map(|i| i["obligation_id"].as_str().unwrap()).collect();
    assert_eq!(obligations, vec!["o-2c"]);
}

#[tokio::test]
async fn chain_returns_the_full_causal_history_in_order() {
    let app = test_app();
    post(&app, "/receipts", accepted("r-1", "o-1", "agent:a")).await;
    let complete = json!({
        "receipt_id": "r-1c",
        "obligation_id": "o-1",
        "phase": "complete",
        "caused_by_receipt_id": "r-1",
        "recipient": "agent:a",
        "created_by": "agent:a",
        "result": {"status": "ok"},
    });
    post(&app, "/receipts", complete).await;

    let body = body_json(get(&app, "/receipts/r-1c/chain").await).await;
    let ids: Vec<&str> = body["chain"].as_array().unwrap().iter().map(|r| r["receipt_id"].as_str().unwrap()).collect();
    assert_eq!(ids, vec!["r-1", "r-1c"]);
}

#[tokio::test]
async fn chain_for_an_unknown_receipt_is_a_404() {
    let app = test_app();
    let resp = get(&app, "/receipts/does-not-exist/chain").await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn oversized_content_length_is_rejected_before_parsing() {
    let app = test_app();
    let payload = accepted("r-1", "o-1", "agent:a").to_string();
    let resp = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/receipts")
                .header("content-type", "application/json")
                .header("content-length", "999999999")
                .body(Body::from(payload))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(resp).await;
    assert_eq!(body["error"]["code"], "BODY_TOO_LARGE");
}

#[tokio::test]
async fn health_requires_no_authentication() {
    let config = Config::default();
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default()));
    let state = Arc::new(AppState {
        ledger,
        config: Arc::new(config),
    });
    let app = build_app(state);

    let resp = get(&app, "/health").await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn writing_without_a_configured_api_key_is_rejected() {
    let config = Config::default();
    let ledger = Arc::new(Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default()));
    let state = Arc::new(AppState {
        ledger,
        config: Arc::new(config),
    });
    let app = build_app(state);

    let resp = post(&app, "/receipts", accepted("r-1", "o-1", "agent:a")).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
}
