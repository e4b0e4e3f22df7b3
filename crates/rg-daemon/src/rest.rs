// SPDX-License-Identifier: MIT OR Apache-2.0

//! REST handlers. Response shapes follow an envelope-per-endpoint design:
//! some responses carry an `ok` field plus a payload wrapper, others (a
//! single receipt) are the bare record.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use rg_core::{Phase, Receipt, RgError};
use rg_store::SearchFilter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::AppState;

/// Response body for `POST /receipts`.
#[derive(Debug, Serialize)]
pub struct ReceiptPutResponse {
    ok: bool,
    receipt_id: String,
    canonical_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<DateTime<Utc>>,
    idempotent_replay: bool,
}

pub async fn put_receipt(
    State(state): State<Arc<AppState>>,
    Json(receipt): Json<Receipt>,
) -> Result<impl IntoResponse, RgError> {
    let outcome = state.ledger.put_receipt(&state.config.default_tenant_id, receipt).await?;
    let status = if outcome.is_replay() { StatusCode::OK } else { StatusCode::CREATED };
    let receipt = outcome.receipt();
    let body = ReceiptPutResponse {
        ok: true,
        receipt_id: receipt.receipt_id.clone(),
        canonical_hash: receipt.canonical_hash.clone().unwrap_or_default(),
        created_at: receipt.created_at,
        idempotent_replay: outcome.is_replay(),
    };
    Ok((status, Json(body)))
}

pub async fn get_receipt(
    State(state): State<Arc<AppState>>,
    Path(receipt_id): Path<String>,
) -> Result<Json<Receipt>, RgError> {
    state
        .ledger
        .get(&state.config.default_tenant_id, &receipt_id)
        .await?
        .map(Json)
        .ok_or_else(|| RgError::NotFound {
            what: format!("receipt '{receipt_id}'"),
        })
}

/// Body for `POST /receipts/search`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SearchRequest {
    pub receipt_id: Option<String>,
    pub obligation_id: Option<String>,
    pub phase: Option<Phase>,
    pub recipient: Option<String>,
    pub created_by: Option<String>,
    pub principal: Option<String>,
    pub caused_by_receipt_id: Option<String>,
    pub task_id: Option<String>,
    pub plan_id: Option<String>,
    pub created_at_from: Option<DateTime<Utc>>,
    pub created_at_to: Option<DateTime<Utc>>,
    pub query: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<SearchRequest> for SearchFilter {
    fn from(r: SearchRequest) -> Self {
        SearchFilter {
            receipt_id: r.receipt_id,
            obligation_id: r.obligation_id,
            phase: r.phase,
            recipient: r.recipient,
            created_by: r.created_by,
            principal: r.principal,
            caused_by_receipt_id: r.caused_by_receipt_id,
            task_id: r.task_id,
            plan_id: r.plan_id,
            created_at_from: r.created_at_from,
            created_at_to: r.created_at_to,
            query: r.query,
            limit: r.limit.unwrap_or(0),
            offset: r.offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    ok: bool,
    count: u64,
    limit: i64,
    offset: i64,
    receipts: Vec<Receipt>,
}

pub async fn search_receipts(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, RgError> {
    let offset = request.offset.unwrap_or(0);
    let mut filter: SearchFilter = request.into();
    if filter.limit <= 0 {
        filter.limit = state.config.search_default_limit;
    }
    filter.limit = filter.limit.clamp(1, state.config.search_max_limit);
    let limit = filter.limit;
    let (receipts, count) = state.ledger.search(&state.config.default_tenant_id, filter).await?;
    Ok(Json(SearchResponse {
        ok: true,
        count,
        limit,
        offset,
        receipts,
    }))
}

#[derive(Debug, Serialize)]
pub struct ChainResponse {
    ok: bool,
    receipt_id: String,
    chain: Vec<Receipt>,
    truncated: bool,
}

pub async fn get_chain(
    State(state): State<Arc<AppState>>,
    Path(receipt_id): Path<String>,
) -> Result<Json<ChainResponse>, RgError> {
    let result = state
        .ledger
        .chain(&state.config.default_tenant_id, &receipt_id, state.ledger.options().receipt_chain_max_depth)
        .await?;
    if result.chain.is_empty() {
        return Err(RgError::NotFound {
            what: format!("receipt '{receipt_id}'"),
        });
    }
    Ok(Json(ChainResponse {
        ok: true,
        receipt_id: result.receipt_id,
        chain: result.chain,
        truncated: result.truncated,
    }))
}

#[derive(Debug, Deserialize, Default)]
pub struct InboxQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct InboxItemDto {
    obligation_id: String,
    opened_by_receipt_id: String,
    opened_by_phase: Phase,
    receipt: Receipt,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_obligation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InboxResponse {
    ok: bool,
    recipient: String,
    items: Vec<InboxItemDto>,
}

pub async fn get_inbox(
    State(state): State<Arc<AppState>>,
    Path(recipient): Path<String>,
    Query(q): Query<InboxQuery>,
) -> Result<Json<InboxResponse>, RgError> {
    let requested = q.limit.unwrap_or(usize::try_from(state.config.search_default_limit).unwrap_or(50));
    let max = usize::try_from(state.config.search_max_limit).unwrap_or(500);
    let limit = requested.clamp(1, max);

    let items = state.ledger.inbox(&state.config.default_tenant_id, &recipient, limit).await?;
    Ok(Json(InboxResponse {
        ok: true,
        recipient,
        items: items
            .into_iter()
            .map(|i| InboxItemDto {
                obligation_id: i.obligation_id,
                opened_by_receipt_id: i.opened_by_receipt_id,
                opened_by_phase: i.opened_by_phase,
                receipt: i.receipt,
                parent_obligation_id: i.parent_obligation_id,
            })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
struct RecipientCount {
    recipient: String,
    count: u64,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    ok: bool,
    total_receipts: u64,
    by_phase: std::collections::BTreeMap<String, u64>,
    top_recipients: Vec<RecipientCount>,
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Result<Json<StatsResponse>, RgError> {
    let stats = state.ledger.stats(&state.config.default_tenant_id).await?;
    Ok(Json(StatsResponse {
        ok: true,
        total_receipts: stats.total_receipts,
        by_phase: stats.by_phase,
        top_recipients: stats
            .top_recipients
            .into_iter()
            .map(|(recipient, count)| RecipientCount { recipient, count })
            .collect(),
    }))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    ok: bool,
    service: String,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: state.config.service_name.clone(),
    })
}
