// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite [`LedgerStore`] backend. A single process is assumed to own the database file, so the
//! concurrency discipline is the same in-process keyed-mutex table
//! [`crate::memory::MemoryStore`] uses; a unique constraint on
//! `(tenant_id, receipt_id)` is the backstop against any race it misses.

use crate::shared::{ReceiptRow, SELECT_COLUMNS, backend_err, schema_statements, to_new_row};
use crate::{
    LedgerStore, ObligationSnapshot, PhaseCheck, PutOutcome, SearchFilter, StatsSummary,
    StoreError, is_opening_event_for, lock_keys,
};
use async_trait::async_trait;
use chrono::Utc;
use rg_core::{Phase, Receipt};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS receipts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    receipt_id TEXT NOT NULL,
    obligation_id TEXT NOT NULL,
    caused_by_receipt_id TEXT,
    created_by TEXT NOT NULL,
    recipient TEXT NOT NULL,
    principal TEXT,
    task_id TEXT,
    task_ref TEXT,
    plan_id TEXT,
    plan_ref TEXT,
    artifact_refs TEXT,
    body TEXT NOT NULL,
    phase TEXT NOT NULL,
    canonical_hash TEXT NOT NULL,
    created_at TEXT NOT NULL,
    stored_at TEXT NOT NULL,
    UNIQUE(tenant_id, receipt_id)
);
CREATE INDEX IF NOT EXISTS idx_receipts_obligation ON receipts(tenant_id, obligation_id);
CREATE INDEX IF NOT EXISTS idx_receipts_recipient_phase ON receipts(tenant_id, recipient, phase);
CREATE INDEX IF NOT EXISTS idx_receipts_phase ON receipts(tenant_id, phase);
"#;

/// SQLite-backed ledger store.
pub struct SqliteStore {
    pool: SqlitePool,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SqliteStore {
    /// Connect to `database_url` (e.g. `sqlite://receiptgate.db`) and apply
    /// the schema if it isn't already present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the connection or schema
    /// application fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await.map_err(backend_err)?;
        let store = Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        };
        store.init_schema().await?;
        Ok(store)
    }

    /// Wrap an already-connected pool (e.g. for tests against a shared
    /// in-memory SQLite database).
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for stmt in schema_statements(SCHEMA_SQL) {
            sqlx::query(stmt).execute(&self.pool).await.map_err(backend_err)?;
        }
        Ok(())
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn acquire(&self, keys: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self.lock_for(key).await;
            guards.push(mutex.lock_owned().await);
        }
        guards
    }

    async fn all_escalations(&self, tenant_id: &str) -> Result<Vec<Receipt>, StoreError> {
        let rows: Vec<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = ? AND phase = 'escalate'"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.into_iter().map(ReceiptRow::into_receipt).collect()
    }

    /// Fill in `accepted_parent`/`child_conflict` on `snapshot` for an
    /// incoming `escalate` receipt; a
    /// no-op for every other phase.
    async fn add_escalate_extras(
        &self,
        snapshot: &mut ObligationSnapshot,
        tenant_id: &str,
        receipt: &Receipt,
    ) -> Result<(), StoreError> {
        let Some(escalation) = receipt.body.escalation() else {
            return Ok(());
        };

        let accepted_parent: Option<ReceiptRow> = if let Some(parent_receipt_id) = &escalation.parent_receipt_id {
            sqlx::query_as(&format!(
                "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = ? AND receipt_id = ? AND phase = 'accepted'"
            ))
            .bind(tenant_id)
            .bind(parent_receipt_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
        } else {
            sqlx::query_as(&format!(
                "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = ? AND obligation_id = ? AND phase = 'accepted' LIMIT 1"
            ))
            .bind(tenant_id)
            .bind(&receipt.obligation_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?
        };
        snapshot.accepted_parent = accepted_parent.map(ReceiptRow::into_receipt).transpose()?;

        let child_by_obligation: Option<String> = sqlx::query_scalar(
            "SELECT receipt_id FROM receipts WHERE tenant_id = ? AND obligation_id = ? LIMIT 1",
        )
        .bind(tenant_id)
        .bind(&escalation.child_obligation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        snapshot.child_conflict = match child_by_obligation {
            Some(id) => Some(id),
            None => self
                .find_escalation_by_child(tenant_id, &escalation.child_obligation_id)
                .await?
                .map(|r| r.receipt_id),
        };

        Ok(())
    }
}

fn push_filter_clauses<'a>(qb: &mut sqlx::QueryBuilder<'a, sqlx::Sqlite>, f: &'a SearchFilter) {
    if let Some(v) = &f.receipt_id {
        qb.push(" AND receipt_id = ").push_bind(v);
    }
    if let Some(v) = &f.obligation_id {
        qb.push(" AND obligation_id = ").push_bind(v);
    }
    if let Some(p) = f.phase {
        qb.push(" AND phase = ").push_bind(p.as_str());
    }
    if let Some(v) = &f.recipient {
        qb.push(" AND recipient = ").push_bind(v);
    }
    if let Some(v) = &f.created_by {
        qb.push(" AND created_by = ").push_bind(v);
    }
    if let Some(v) = &f.principal {
        qb.push(" AND principal = ").push_bind(v);
    }
    if let Some(v) = &f.caused_by_receipt_id {
        qb.push(" AND caused_by_receipt_id = ").push_bind(v);
    }
    if let Some(v) = &f.task_id {
        qb.push(" AND task_id = ").push_bind(v);
    }
    if let Some(v) = &f.plan_id {
        qb.push(" AND plan_id = ").push_bind(v);
    }
    if let Some(v) = f.created_at_from {
        qb.push(" AND created_at >= ").push_bind(v);
    }
    if let Some(v) = f.created_at_to {
        qb.push(" AND created_at <= ").push_bind(v);
    }
    if let Some(q) = &f.query {
        qb.push(" AND LOWER(body) LIKE ")
            .push_bind(format!("%{}%", q.to_lowercase()));
    }
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn get(&self, tenant_id: &str, receipt_id: &str) -> Result<Option<Receipt>, StoreError> {
        let row: Option<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = ? AND receipt_id = ?"
        ))
        .bind(tenant_id)
        .bind(receipt_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(ReceiptRow::into_receipt).transpose()
    }

    async fn list_by_obligation(
        &self,
        tenant_id: &str,
        obligation_id: &str,
    ) -> Result<Vec<Receipt>, StoreError> {
        let rows: Vec<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = ? AND obligation_id = ? ORDER BY id ASC"
        ))
        .bind(tenant_id)
        .bind(obligation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.into_iter().map(ReceiptRow::into_receipt).collect()
    }

    async fn list_by_recipient_phase(
        &self,
        tenant_id: &str,
        recipient: &str,
        phase: Phase,
    ) -> Result<Vec<Receipt>, StoreError> {
        let rows: Vec<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = ? AND recipient = ? AND phase = ? ORDER BY stored_at DESC"
        ))
        .bind(tenant_id)
        .bind(recipient)
        .bind(phase.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.into_iter().map(ReceiptRow::into_receipt).collect()
    }

    async fn find_escalation_by_child(
        &self,
        tenant_id: &str,
        child_obligation_id: &str,
    ) -> Result<Option<Receipt>, StoreError> {
        let escalations = self.all_escalations(tenant_id).await?;
        Ok(escalations.into_iter().find(|r| {
            r.body
                .escalation()
                .is_some_and(|e| e.child_obligation_id == child_obligation_id)
        }))
    }

    async fn list_escalations_by_recipient(
        &self,
        tenant_id: &str,
        recipient: &str,
    ) -> Result<Vec<Receipt>, StoreError> {
        let escalations = self.all_escalations(tenant_id).await?;
        Ok(escalations
            .into_iter()
            .filter(|r| r.body.escalation().is_some_and(|e| e.to == recipient))
            .collect())
    }

    async fn search(
        &self,
        tenant_id: &str,
        filter: &SearchFilter,
    ) -> Result<(Vec<Receipt>, u64), StoreError> {
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = "
        ));
        qb.push_bind(tenant_id);
        push_filter_clauses(&mut qb, filter);
        qb.push(" ORDER BY stored_at DESC LIMIT ")
            .push_bind(filter.limit.max(0))
            .push(" OFFSET ")
            .push_bind(filter.offset.max(0));
        let rows: Vec<ReceiptRow> = qb.build_query_as().fetch_all(&self.pool).await.map_err(backend_err)?;
        let receipts: Vec<Receipt> = rows.into_iter().map(ReceiptRow::into_receipt).collect::<Result<_, _>>()?;

        let mut count_qb =
            sqlx::QueryBuilder::<sqlx::Sqlite>::new("SELECT COUNT(*) FROM receipts WHERE tenant_id = ");
        count_qb.push_bind(tenant_id);
        push_filter_clauses(&mut count_qb, filter);
        let total: i64 = count_qb
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;

        Ok((receipts, total.max(0) as u64))
    }

    async fn stats(&self, tenant_id: &str) -> Result<StatsSummary, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM receipts WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;

        let phase_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT phase, COUNT(*) FROM receipts WHERE tenant_id = ? GROUP BY phase",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        let by_phase: BTreeMap<String, u64> = phase_rows
            .into_iter()
            .map(|(phase, count)| (phase, count.max(0) as u64))
            .collect();

        let top_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT recipient, COUNT(*) AS c FROM receipts WHERE tenant_id = ? GROUP BY recipient ORDER BY c DESC LIMIT 10",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        let top_recipients = top_rows
            .into_iter()
            .map(|(recipient, count)| (recipient, count.max(0) as u64))
            .collect();

        Ok(StatsSummary {
            total_receipts: total.max(0) as u64,
            by_phase,
            top_recipients,
        })
    }

    async fn snapshot_for_obligation(
        &self,
        tenant_id: &str,
        obligation_id: &str,
    ) -> Result<ObligationSnapshot, StoreError> {
        let accepted: Option<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = ? AND obligation_id = ? AND phase = 'accepted' LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(obligation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        let opening = if let Some(row) = accepted {
            Some(row.into_receipt()?)
        } else {
            self.all_escalations(tenant_id)
                .await?
                .into_iter()
                .find(|r| is_opening_event_for(r, obligation_id))
        };

        let terminal_row: Option<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = ? AND obligation_id = ? \
             AND phase IN ('complete', 'escalate', 'cancel') LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(obligation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        let terminal = terminal_row.map(ReceiptRow::into_receipt).transpose()?;

        Ok(ObligationSnapshot {
            opening,
            terminal,
            accepted_parent: None,
            child_conflict: None,
        })
    }

    async fn put_receipt(
        &self,
        tenant_id: &str,
        mut receipt: Receipt,
        canonical_hash: String,
        check: &PhaseCheck<'_>,
    ) -> Result<PutOutcome, StoreError> {
        let keys = lock_keys(tenant_id, &receipt);
        let _guards = self.acquire(&keys).await;

        if let Some(existing) = self.get(tenant_id, &receipt.receipt_id).await? {
            return Ok(if existing.canonical_hash.as_deref() == Some(canonical_hash.as_str()) {
                PutOutcome::Replay(existing)
            } else {
                PutOutcome::Collision {
                    receipt_id: receipt.receipt_id.clone(),
                }
            });
        }

        let mut snapshot = self.snapshot_for_obligation(tenant_id, &receipt.obligation_id).await?;
        self.add_escalate_extras(&mut snapshot, tenant_id, &receipt).await?;
        if let Err(err) = check(&receipt, &snapshot) {
            return Ok(PutOutcome::Rejected(err));
        }

        let stored_at = Utc::now();
        let row = to_new_row(tenant_id, &receipt, &canonical_hash, stored_at)?;

        let insert_result = sqlx::query(
            "INSERT INTO receipts (tenant_id, receipt_id, obligation_id, caused_by_receipt_id, \
             created_by, recipient, principal, task_id, task_ref, plan_id, plan_ref, \
             artifact_refs, body, phase, canonical_hash, created_at, stored_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.tenant_id)
        .bind(&row.receipt_id)
        .bind(&row.obligation_id)
        .bind(&row.caused_by_receipt_id)
        .bind(&row.created_by)
        .bind(&row.recipient)
        .bind(&row.principal)
        .bind(&row.task_id)
        .bind(&row.task_ref)
        .bind(&row.plan_id)
        .bind(&row.plan_ref)
        .bind(&row.artifact_refs)
        .bind(&row.body)
        .bind(&row.phase)
        .bind(&row.canonical_hash)
        .bind(row.created_at)
        .bind(row.stored_at)
        .execute(&self.pool)
        .await;

        match insert_result {
            Ok(_) => {
                receipt.tenant_id = Some(tenant_id.to_string());
                receipt.stored_at = Some(stored_at);
                receipt.created_at = Some(row.created_at);
                receipt.canonical_hash = Some(canonical_hash);
                Ok(PutOutcome::Inserted(receipt))
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let existing = self.get(tenant_id, &receipt.receipt_id).await?;
                Ok(match existing {
                    Some(existing) if existing.canonical_hash.as_deref() == Some(canonical_hash.as_str()) => {
                        PutOutcome::Replay(existing)
                    }
                    _ => PutOutcome::Collision {
                        receipt_id: receipt.receipt_id.clone(),
                    },
                })
            }
            Err(e) => Err(backend_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_core::ReceiptBody;
    use std::collections::BTreeMap as Map;

    async fn test_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn accepted(receipt_id: &str, obligation_id: &str) -> Receipt {
        Receipt {
            receipt_id: receipt_id.into(),
            obligation_id: obligation_id.into(),
            caused_by_receipt_id: None,
            created_by: "agent:a".into(),
            recipient: "agent:b".into(),
            principal: None,
            task_ref: None,
            plan_ref: None,
            artifact_refs: vec![],
            created_at: None,
            canonical_hash: None,
            tenant_id: None,
            stored_at: None,
            body: ReceiptBody::Accepted {
                summary: None,
                inputs: None,
                constraints: None,
                extra: Map::new(),
            },
        }
    }

    fn always_ok(_: &Receipt, _: &ObligationSnapshot) -> Result<(), rg_core::RgError> {
        Ok(())
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = test_store().await;
        let outcome = store
            .put_receipt("t1", accepted("r-1", "o-1"), "sha256:aaa".into(), &always_ok)
            .await
            .unwrap();
        assert!(matches!(outcome, PutOutcome::Inserted(_)));

        let fetched = store.get("t1", "r-1").await.unwrap().unwrap();
        assert_eq!(fetched.canonical_hash.as_deref(), Some("sha256:aaa"));
    }

    #[tokio::test]
    async fn unique_constraint_backstops_the_lock_table() {
        let store = test_store().await;
        store
            .put_receipt("t1", accepted("r-1", "o-1"), "sha256:aaa".into(), &always_ok)
            .await
            .unwrap();
        let outcome = store
            .put_receipt("t1", accepted("r-1", "o-1"), "sha256:aaa".into(), &always_ok)
            .await
            .unwrap();
        assert!(matches!(outcome, PutOutcome::Replay(_)));
    }

    #[tokio::test]
    async fn search_counts_total_independent_of_limit() {
        let store = test_store().await;
        for i in 0..3 {
            store
                .put_receipt(
                    "t1",
                    accepted(&format!("r-{i}"), &format!("o-{i}")),
                    format!("sha256:{i}"),
                    &always_ok,
                )
                .await
                .unwrap();
        }
        let (page, total) = store
            .search(
                "t1",
                &SearchFilter {
                    limit: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(total, 3);
    }
}
