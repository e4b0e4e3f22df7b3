// SPDX-License-Identifier: MIT OR Apache-2.0

//! Row mapping shared by the SQLite and Postgres backends. Both store a
//! receipt's free-form sub-objects (`task_ref`, `plan_ref`, `artifact_refs`,
//! `body`) as JSON text rather than a native JSON column type, so the two
//! backends can share one row shape and one set of queries for anything
//! that doesn't need to reach inside that JSON.

use crate::StoreError;
use chrono::{DateTime, Utc};
use rg_core::{ArtifactRef, Receipt, ReceiptBody, TaskRef};
use serde_json::Value;

/// Column list shared by every `SELECT` against the `receipts` table.
/// `sqlx`'s derived `FromRow` maps by column name, so the two backends'
/// `SELECT`s only need to agree on this list, not on column order.
pub(crate) const SELECT_COLUMNS: &str = "tenant_id, receipt_id, obligation_id, \
    caused_by_receipt_id, created_by, recipient, principal, task_id, task_ref, \
    plan_id, plan_ref, artifact_refs, body, phase, canonical_hash, created_at, stored_at";

/// A row as it comes back from either backend.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct ReceiptRow {
    pub tenant_id: String,
    pub receipt_id: String,
    pub obligation_id: String,
    pub caused_by_receipt_id: Option<String>,
    pub created_by: String,
    pub recipient: String,
    pub principal: Option<String>,
    #[allow(dead_code)]
    pub task_id: Option<String>,
    pub task_ref: Option<String>,
    #[allow(dead_code)]
    pub plan_id: Option<String>,
    pub plan_ref: Option<String>,
    pub artifact_refs: Option<String>,
    pub body: String,
    #[allow(dead_code)]
    pub phase: String,
    pub canonical_hash: String,
    pub created_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

impl ReceiptRow {
    pub(crate) fn into_receipt(self) -> Result<Receipt, StoreError> {
        let task_ref: Option<TaskRef> = self
            .task_ref
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("task_ref decode: {e}")))?;
        let plan_ref: Option<Value> = self
            .plan_ref
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("plan_ref decode: {e}")))?;
        let artifact_refs: Vec<ArtifactRef> = self
            .artifact_refs
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("artifact_refs decode: {e}")))?
            .unwrap_or_default();
        let body: ReceiptBody = serde_json::from_str(&self.body)
            .map_err(|e| StoreError::Backend(format!("body decode: {e}")))?;

        Ok(Receipt {
            receipt_id: self.receipt_id,
            obligation_id: self.obligation_id,
            caused_by_receipt_id: self.caused_by_receipt_id,
            created_by: self.created_by,
            recipient: self.recipient,
            principal: self.principal,
            task_ref,
            plan_ref,
            artifact_refs,
            created_at: Some(self.created_at),
            canonical_hash: Some(self.canonical_hash),
            tenant_id: Some(self.tenant_id),
            stored_at: Some(self.stored_at),
            body,
        })
    }
}

/// A row ready to bind into an `INSERT`.
pub(crate) struct NewRow {
    pub tenant_id: String,
    pub receipt_id: String,
    pub obligation_id: String,
    pub caused_by_receipt_id: Option<String>,
    pub created_by: String,
    pub recipient: String,
    pub principal: Option<String>,
    pub task_id: Option<String>,
    pub task_ref: Option<String>,
    pub plan_id: Option<String>,
    pub plan_ref: Option<String>,
    pub artifact_refs: String,
    pub body: String,
    pub phase: String,
    pub canonical_hash: String,
    pub created_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
}

/// Project a [`Receipt`] plus its already-computed canonical hash and
/// server-assigned `stored_at` into a [`NewRow`].
/// `created_at` falls back to `stored_at` when the client didn't supply one.
pub(crate) fn to_new_row(
    tenant_id: &str,
    receipt: &Receipt,
    canonical_hash: &str,
    stored_at: DateTime<Utc>,
) -> Result<NewRow, StoreError> {
    let json_err = |e: serde_json::Error| StoreError::Backend(format!("json encode: {e}"));
    let created_at = receipt.created_at.unwrap_or(stored_at);
    let task_id = receipt.task_ref.as_ref().and_then(|t| t.task_id.clone());
    let plan_id = receipt
        .plan_ref
        .as_ref()
        .and_then(|p| p.get("plan_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(NewRow {
        tenant_id: tenant_id.to_string(),
        receipt_id: receipt.receipt_id.clone(),
        obligation_id: receipt.obligation_id.clone(),
        caused_by_receipt_id: receipt.caused_by_receipt_id.clone(),
        created_by: receipt.created_by.clone(),
        recipient: receipt.recipient.clone(),
        principal: receipt.principal.clone(),
        task_id,
        task_ref: receipt
            .task_ref
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_err)?,
        plan_id,
        plan_ref: receipt
            .plan_ref
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(json_err)?,
        artifact_refs: serde_json::to_string(&receipt.artifact_refs).map_err(json_err)?,
        body: serde_json::to_string(&receipt.body).map_err(json_err)?,
        phase: receipt.phase().as_str().to_string(),
        canonical_hash: canonical_hash.to_string(),
        created_at,
        stored_at,
    })
}

pub(crate) fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Split a schema file's statements on `;`, since neither SQLite nor
/// Postgres drivers accept more than one statement per prepared query.
pub(crate) fn schema_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}
