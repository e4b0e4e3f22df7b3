// SPDX-License-Identifier: MIT OR Apache-2.0

//! JSON-RPC/MCP surface: the same ledger operations as [`crate::rest`],
//! addressed through `tools/list` and `tools/call` for agent clients that speak
//! MCP's legacy flat-argument convention instead of the canonical receipt envelope.

use axum::{Json, extract::State};
use chrono::{DateTime, Utc};
use rg_core::{Phase, Receipt, RgError};
use rg_store::SearchFilter;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use crate::AppState;

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Deserialize)]
pub struct MCPRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

fn result(id: Value, result: Value) -> Json<Value> {
    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn error(id: Value, code: impl Serialize, message: impl Into<String>, details: Option<Value>) -> Json<Value> {
    let mut err = json!({ "code": code, "message": message.into() });
    if let Some(details) = details {
        err["details"] = details;
    }
    Json(json!({ "jsonrpc": "2.0", "id": id, "error": err }))
}

fn validation_error(id: Value, message: &str) -> Json<Value> {
    error(id, "validation_failed", message, None)
}

/// The eight tools this surface exposes, as returned by `tools/list`.
fn tool_catalog() -> Value {
    json!([
        {
            "name": "receiptgate.health",
            "description": "Health check / service info",
            "inputSchema": {"type": "object", "properties": {}},
        },
        {
            "name": "receiptgate.submit_receipt",
            "description": "Store a new receipt",
            "inputSchema": {
                "type": "object",
                "properties": {"receipt": {"type": "object", "description": "Receipt payload"}},
                "required": ["receipt"],
            },
        },
        {
            "name": "receiptgate.list_inbox",
            "description": "Retrieve active obligations for an agent",
            "inputSchema": {
                "type": "object",
                "properties": {"recipient_ai": {"type": "string"}, "limit": {"type": "integer"}},
                "required": ["recipient_ai"],
            },
        },
        {
            "name": "receiptgate.bootstrap",
            "description": "Initialize session and return inbox/config",
            "inputSchema": {
                "type": "object",
                "properties": {"agent_name": {"type": "string"}, "session_id": {"type": "string"}},
                "required": ["agent_name", "session_id"],
            },
        },
        {
            "name": "receiptgate.list_task_receipts",
            "description": "Retrieve all receipts for a task",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "task_id": {"type": "string"},
                    "sort": {"type": "string", "enum": ["asc", "desc"]},
                    "include_payload": {"type": "boolean"},
                    "limit": {"type": "integer"},
                },
                "required": ["task_id"],
            },
        },
        {
            "name": "receiptgate.search_receipts",
            "description": "Search receipt headers by task and filters",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "root_task_id": {"type": "string"},
                    "phase": {"type": "string"},
                    "recipient_ai": {"type": "string"},
                    "since": {"type": "string", "description": "ISO timestamp"},
                    "limit": {"type": "integer"},
                },
                "required": ["root_task_id"],
            },
        },
        {
            "name": "receiptgate.get_receipt_chain",
            "description": "Retrieve escalation/causation chain",
            "inputSchema": {
                "type": "object",
                "properties": {"receipt_id": {"type": "string"}},
                "required": ["receipt_id"],
            },
        },
        {
            "name": "receiptgate.get_receipt",
            "description": "Retrieve full receipt payload by ID",
            "inputSchema": {
                "type": "object",
                "properties": {"receipt_id": {"type": "string"}},
                "required": ["receipt_id"],
            },
        },
    ])
}

/// `POST /mcp`: dispatch a JSON-RPC request to one of the eight tools.
pub async fn handle_mcp(State(state): State<Arc<AppState>>, Json(req): Json<MCPRequest>) -> Json<Value> {
    if req.method == "tools/list" {
        return result(req.id, json!({ "tools": tool_catalog() }));
    }
    if req.method != "tools/call" {
        return error(req.id, -32601, format!("Method not found: {}", req.method), None);
    }

    let Some(tool_name) = req.params.get("name").and_then(Value::as_str).map(str::to_owned) else {
        return error(req.id, -32602, "Missing tool name", None);
    };
    let arguments = req.params.get("arguments").cloned().unwrap_or(json!({}));

    dispatch(&state, &tool_name, arguments, req.id).await
}

async fn dispatch(state: &Arc<AppState>, tool_name: &str, arguments: Value, id: Value) -> Json<Value> {
    let tenant_id = &state.config.default_tenant_id;

    match tool_name {
        "receiptgate.health" => result(
            id,
            json!({
                "status": "healthy",
                "service": state.config.service_name,
                "version": env!("CARGO_PKG_VERSION"),
                "instance_id": state.config.service_name,
            }),
        ),

        "receiptgate.submit_receipt" => {
            let Some(raw) = arguments.get("receipt").cloned() else {
                return validation_error(id, "receipt is required");
            };
            let receipt: Receipt = match serde_json::from_value(raw) {
                Ok(r) => r,
                Err(e) => return validation_error(id, &format!("malformed receipt: {e}")),
            };
            match state.ledger.put_receipt(tenant_id, receipt).await {
                Ok(outcome) => {
                    let receipt = outcome.receipt();
                    result(
                        id,
                        json!({
                            "ok": true,
                            "receipt_id": receipt.receipt_id,
                            "canonical_hash": receipt.canonical_hash,
                            "idempotent_replay": outcome.is_replay(),
                        }),
                    )
                }
                Err(e) => domain_error(id, e),
            }
        }

        "receiptgate.list_inbox" => {
            let Some(recipient) = arguments.get("recipient_ai").and_then(Value::as_str) else {
                return validation_error(id, "recipient_ai is required");
            };
            let limit = arguments
                .get("limit")
                .and_then(Value::as_u64)
                .map_or(state.ledger.options().search_default_limit as usize, |v| v as usize);
            match state.ledger.inbox(tenant_id, recipient, limit).await {
                Ok(items) => result(id, json!({ "items": items.into_iter().map(inbox_item_json).collect::<Vec<_>>() })),
                Err(e) => domain_error(id, e),
            }
        }

        "receiptgate.bootstrap" => {
            let (Some(agent_name), Some(session_id)) = (
                arguments.get("agent_name").and_then(Value::as_str),
                arguments.get("session_id").and_then(Value::as_str),
            ) else {
                return validation_error(id, "agent_name and session_id are required");
            };
            let default_limit = state.ledger.options().search_default_limit as usize;
            match state.ledger.inbox(tenant_id, agent_name, default_limit).await {
                Ok(items) => result(
                    id,
                    json!({
                        "tenant_id": tenant_id,
                        "agent_name": agent_name,
                        "session_id": session_id,
                        "config": {
                            "receipt_schema_version": "1.0",
                            "capabilities": ["receipts", "audit"],
                        },
                        "inbox": items.into_iter().map(inbox_item_json).collect::<Vec<_>>(),
                        "recent_context": { "last_10_receipts": [], "recent_patterns": [] },
                    }),
                ),
                Err(e) => domain_error(id, e),
            }
        }

        "receiptgate.list_task_receipts" => {
            let Some(task_id) = arguments.get("task_id").and_then(Value::as_str) else {
                return validation_error(id, "task_id is required");
            };
            let descending = arguments.get("sort").and_then(Value::as_str) == Some("desc");
            let include_payload = arguments.get("include_payload").and_then(Value::as_bool).unwrap_or(false);
            let limit = arguments.get("limit").and_then(Value::as_u64).map(|v| v as usize);

            let filter = SearchFilter {
                task_id: Some(task_id.to_owned()),
                ..SearchFilter::default()
            };
            match state.ledger.search(tenant_id, filter).await {
                Ok((mut receipts, _)) => {
                    receipts.sort_by(|a, b| {
                        if descending {
                            b.created_at.cmp(&a.created_at)
                        } else {
                            a.created_at.cmp(&b.created_at)
                        }
                    });
                    if let Some(limit) = limit {
                        receipts.truncate(limit);
                    }
                    result(id, json!({ "receipts": receipts.into_iter().map(|r| task_receipt_json(r, include_payload)).collect::<Vec<_>>() }))
                }
                Err(e) => domain_error(id, e),
            }
        }

        "receiptgate.search_receipts" => {
            let Some(root_task_id) = arguments.get("root_task_id").and_then(Value::as_str) else {
                return validation_error(id, "root_task_id is required");
            };
            let phase = match arguments.get("phase").and_then(Value::as_str) {
                Some(p) => match p.parse::<Phase>() {
                    Ok(phase) => Some(phase),
                    Err(e) => return validation_error(id, &e),
                },
                None => None,
            };
            let since: Option<DateTime<Utc>> = match arguments.get("since").and_then(Value::as_str) {
                Some(s) => match DateTime::parse_from_rfc3339(s) {
                    Ok(dt) => Some(dt.with_timezone(&Utc)),
                    Err(e) => return validation_error(id, &format!("malformed since: {e}")),
                },
                None => None,
            };
            let recipient = arguments.get("recipient_ai").and_then(Value::as_str).map(str::to_owned);
            let limit = arguments
                .get("limit")
                .and_then(Value::as_i64)
                .unwrap_or(state.ledger.options().search_default_limit);

            let filter = SearchFilter {
                task_id: Some(root_task_id.to_owned()),
                phase,
                recipient,
                created_at_from: since,
                limit,
                ..SearchFilter::default()
            };
            match state.ledger.search(tenant_id, filter).await {
                Ok((receipts, count)) => result(id, json!({ "count": count, "receipts": receipts })),
                Err(e) => domain_error(id, e),
            }
        }

        "receiptgate.get_receipt_chain" => {
            let Some(receipt_id) = arguments.get("receipt_id").and_then(Value::as_str) else {
                return validation_error(id, "receipt_id is required");
            };
            let max_depth = state.ledger.options().receipt_chain_max_depth;
            match state.ledger.chain(tenant_id, receipt_id, max_depth).await {
                Ok(chain) => result(id, json!({ "receipt_id": chain.receipt_id, "chain": chain.chain, "truncated": chain.truncated })),
                Err(e) => domain_error(id, e),
            }
        }

        "receiptgate.get_receipt" => {
            let Some(receipt_id) = arguments.get("receipt_id").and_then(Value::as_str) else {
                return validation_error(id, "receipt_id is required");
            };
            match state.ledger.get(tenant_id, receipt_id).await {
                Ok(Some(receipt)) => result(id, json!(receipt)),
                Ok(None) => error(id, "not_found", "Receipt not found", None),
                Err(e) => domain_error(id, e),
            }
        }

        other => error(id, "unknown_tool", format!("Unknown tool: {other}"), None),
    }
}

fn domain_error(id: Value, err: RgError) -> Json<Value> {
    error(id, err.jsonrpc_code(), err.to_string(), err.details())
}

fn inbox_item_json(item: rg_ledger::InboxItem) -> Value {
    json!({
        "obligation_id": item.obligation_id,
        "opened_by_receipt_id": item.opened_by_receipt_id,
        "opened_by_phase": item.opened_by_phase,
        "receipt": item.receipt,
        "parent_obligation_id": item.parent_obligation_id,
    })
}

fn task_receipt_json(receipt: Receipt, include_payload: bool) -> Value {
    if include_payload {
        json!(receipt)
    } else {
        json!({
            "receipt_id": receipt.receipt_id,
            "obligation_id": receipt.obligation_id,
            "phase": receipt.phase(),
            "recipient": receipt.recipient,
            "created_by": receipt.created_by,
            "created_at": receipt.created_at,
        })
    }
}
