// SPDX-License-Identifier: MIT OR Apache-2.0

//! Postgres [`LedgerStore`] backend.
//! Every write takes a session-scoped advisory lock
//! (`pg_advisory_xact_lock`) keyed on the obligation (and, for `escalate`,
//! also the child obligation), held for the lifetime of one transaction —
//! multiple server processes can then share one database safely, unlike the
//! in-process keyed mutex the SQLite and in-memory backends use.

use crate::shared::{ReceiptRow, SELECT_COLUMNS, backend_err, schema_statements, to_new_row};
use crate::{
    LedgerStore, ObligationSnapshot, PhaseCheck, PutOutcome, SearchFilter, StatsSummary,
    StoreError, is_opening_event_for, lock_keys,
};
use async_trait::async_trait;
use chrono::Utc;
use rg_core::{Phase, Receipt};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::BTreeMap;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS receipts (
    id BIGSERIAL PRIMARY KEY,
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
    created_at TIMESTAMPTZ NOT NULL,
    stored_at TIMESTAMPTZ NOT NULL,
    UNIQUE(tenant_id, receipt_id)
);
CREATE INDEX IF NOT EXISTS idx_receipts_obligation ON receipts(tenant_id, obligation_id);
CREATE INDEX IF NOT EXISTS idx_receipts_recipient_phase ON receipts(tenant_id, recipient, phase);
CREATE INDEX IF NOT EXISTS idx_receipts_phase ON receipts(tenant_id, phase);
"#;

/// Postgres-backed ledger store.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to `database_url` and apply the schema if it isn't already
    /// present.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Backend`] if the connection or schema
    /// application fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(backend_err)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Wrap an already-connected pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for stmt in schema_statements(SCHEMA_SQL) {
            sqlx::query(stmt).execute(&self.pool).await.map_err(backend_err)?;
        }
        Ok(())
    }

    async fn all_escalations(&self, tenant_id: &str) -> Result<Vec<Receipt>, StoreError> {
        let rows: Vec<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND phase = 'escalate'"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.into_iter().map(ReceiptRow::into_receipt).collect()
    }
}

fn push_filter_clauses<'a>(qb: &mut sqlx::QueryBuilder<'a, Postgres>, f: &'a SearchFilter) {
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
        qb.push(" AND body ILIKE ").push_bind(format!("%{q}%"));
    }
}

async fn snapshot_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: &str,
    obligation_id: &str,
) -> Result<ObligationSnapshot, StoreError> {
    let accepted: Option<ReceiptRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND obligation_id = $2 \
         AND phase = 'accepted' LIMIT 1"
    ))
    .bind(tenant_id)
    .bind(obligation_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(backend_err)?;

    let opening = if let Some(row) = accepted {
        Some(row.into_receipt()?)
    } else {
        let escalate_rows: Vec<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND phase = 'escalate'"
        ))
        .bind(tenant_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(backend_err)?;
        let mut found = None;
        for row in escalate_rows {
            let r = row.into_receipt()?;
            if is_opening_event_for(&r, obligation_id) {
                found = Some(r);
                break;
            }
        }
        found
    };

    let terminal_row: Option<ReceiptRow> = sqlx::query_as(&format!(
        "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND obligation_id = $2 \
         AND phase IN ('complete', 'escalate', 'cancel') LIMIT 1"
    ))
    .bind(tenant_id)
    .bind(obligation_id)
    .fetch_optional(&mut **tx)
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

/// Fill in `accepted_parent`/`child_conflict` on `snapshot` for an incoming
/// `escalate` receipt; a no-op for every
/// other phase.
async fn add_escalate_extras(
    tx: &mut Transaction<'_, Postgres>,
    snapshot: &mut ObligationSnapshot,
    tenant_id: &str,
    receipt: &Receipt,
) -> Result<(), StoreError> {
    let Some(escalation) = receipt.body.escalation() else {
        return Ok(());
    };

    let accepted_parent: Option<ReceiptRow> = if let Some(parent_receipt_id) = &escalation.parent_receipt_id {
        sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND receipt_id = $2 AND phase = 'accepted'"
        ))
        .bind(tenant_id)
        .bind(parent_receipt_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend_err)?
    } else {
        sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND obligation_id = $2 AND phase = 'accepted' LIMIT 1"
        ))
        .bind(tenant_id)
        .bind(&receipt.obligation_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(backend_err)?
    };
    snapshot.accepted_parent = accepted_parent.map(ReceiptRow::into_receipt).transpose()?;

    let child_by_obligation: Option<String> = sqlx::query_scalar(
        "SELECT receipt_id FROM receipts WHERE tenant_id = $1 AND obligation_id = $2 LIMIT 1",
    )
    .bind(tenant_id)
    .bind(&escalation.child_obligation_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(backend_err)?;

    snapshot.child_conflict = match child_by_obligation {
        Some(id) => Some(id),
        None => {
            let escalate_rows: Vec<ReceiptRow> = sqlx::query_as(&format!(
                "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND phase = 'escalate'"
            ))
            .bind(tenant_id)
            .fetch_all(&mut **tx)
            .await
            .map_err(backend_err)?;
            let mut found = None;
            for row in escalate_rows {
                let r = row.into_receipt()?;
                if r.body.escalation().is_some_and(|e| e.child_obligation_id == escalation.child_obligation_id) {
                    found = Some(r.receipt_id);
                    break;
                }
            }
            found
        }
    };

    Ok(())
}

#[async_trait]
impl LedgerStore for PostgresStore {
    async fn get(&self, tenant_id: &str, receipt_id: &str) -> Result<Option<Receipt>, StoreError> {
        let row: Option<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND receipt_id = $2"
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
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND obligation_id = $2 ORDER BY id ASC"
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
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND recipient = $2 AND phase = $3 ORDER BY stored_at DESC"
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
        let mut qb = sqlx::QueryBuilder::<Postgres>::new(format!(
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
            sqlx::QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM receipts WHERE tenant_id = ");
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
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM receipts WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend_err)?;

        let phase_rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT phase, COUNT(*) FROM receipts WHERE tenant_id = $1 GROUP BY phase",
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
            "SELECT recipient, COUNT(*) AS c FROM receipts WHERE tenant_id = $1 GROUP BY recipient ORDER BY c DESC LIMIT 10",
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
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        let snapshot = snapshot_in_tx(&mut tx, tenant_id, obligation_id).await?;
        tx.commit().await.map_err(backend_err)?;
        Ok(snapshot)
    }

    async fn put_receipt(
        &self,
        tenant_id: &str,
        mut receipt: Receipt,
        canonical_hash: String,
        check: &PhaseCheck<'_>,
    ) -> Result<PutOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;

        for key in lock_keys(tenant_id, &receipt) {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)")
                .bind(&key)
                .execute(&mut *tx)
                .await
                .map_err(backend_err)?;
        }

        let existing: Option<ReceiptRow> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM receipts WHERE tenant_id = $1 AND receipt_id = $2"
        ))
        .bind(tenant_id)
        .bind(&receipt.receipt_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(backend_err)?;

        if let Some(row) = existing {
            let existing_receipt = row.into_receipt()?;
            let outcome = if existing_receipt.canonical_hash.as_deref() == Some(canonical_hash.as_str()) {
                PutOutcome::Replay(existing_receipt)
            } else {
                PutOutcome::Collision {
                    receipt_id: receipt.receipt_id.clone(),
                }
            };
            tx.commit().await.map_err(backend_err)?;
            return Ok(outcome);
        }

        let mut snapshot = snapshot_in_tx(&mut tx, tenant_id, &receipt.obligation_id).await?;
        add_escalate_extras(&mut tx, &mut snapshot, tenant_id, &receipt).await?;
        if let Err(err) = check(&receipt, &snapshot) {
            tx.rollback().await.map_err(backend_err)?;
            return Ok(PutOutcome::Rejected(err));
        }

        let stored_at = Utc::now();
        let row = to_new_row(tenant_id, &receipt, &canonical_hash, stored_at)?;

        let insert_result = sqlx::query(
            "INSERT INTO receipts (tenant_id, receipt_id, obligation_id, caused_by_receipt_id, \
             created_by, recipient, principal, task_id, task_ref, plan_id, plan_ref, \
             artifact_refs, body, phase, canonical_hash, created_at, stored_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
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
        .execute(&mut *tx)
        .await;

        match insert_result {
            Ok(_) => {
                tx.commit().await.map_err(backend_err)?;
                receipt.tenant_id = Some(tenant_id.to_string());
                receipt.stored_at = Some(stored_at);
                receipt.created_at = Some(row.created_at);
                receipt.canonical_hash = Some(canonical_hash);
                Ok(PutOutcome::Inserted(receipt))
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                tx.rollback().await.map_err(backend_err)?;
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
            Err(e) => {
                let _ = tx.rollback().await;
                Err(backend_err(e))
            }
        }
    }
}

// These tests need a reachable Postgres instance (`POSTGRES_TEST_URL`) and
// are ignored by default; run with `cargo test -- --ignored` against a
// throwaway database. The SQLite backend's tests exercise the same trait
// surface on every run.
#[cfg(test)]
mod tests {
    use super::*;
    use rg_core::ReceiptBody;
    use std::collections::BTreeMap as Map;

    async fn test_store() -> PostgresStore {
        let url = std::env::var("POSTGRES_TEST_URL")
            .expect("POSTGRES_TEST_URL must point at a scratch database to run these tests");
        let store = PostgresStore::connect(&url).await.unwrap();
        sqlx::query("TRUNCATE TABLE receipts").execute(&store.pool).await.unwrap();
        store
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
    #[ignore]
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
    #[ignore]
    async fn advisory_lock_backstops_concurrent_writers() {
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
    #[ignore]
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
