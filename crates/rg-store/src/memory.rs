// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory [`LedgerStore`] backend. Durable only for the lifetime of the
//! process; used by every backend-agnostic test and by deployments that
//! don't need persistence across restarts.

use crate::{
    LedgerStore, ObligationSnapshot, PhaseCheck, PutOutcome, SearchFilter, StatsSummary,
    StoreError, is_opening_event_for, lock_keys,
};
use async_trait::async_trait;
use chrono::Utc;
use rg_core::{Phase, Receipt};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// In-memory ledger store. Cheap to construct; safe to share behind an
/// `Arc` across the whole process.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<Vec<Receipt>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire every key in `keys`, in order. Callers always pass a
    /// pre-sorted, deduplicated key list (see [`lock_keys`]), so two
    /// concurrent writers never acquire the same pair of keys in opposite
    /// order.
    async fn acquire(&self, keys: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self.lock_for(key).await;
            guards.push(mutex.lock_owned().await);
        }
        guards
    }
}

fn snapshot_locked(rows: &[Receipt], tenant_id: &str, obligation_id: &str) -> ObligationSnapshot {
    let mut snapshot = ObligationSnapshot::default();
    for r in rows.iter().filter(|r| r.tenant_id.as_deref() == Some(tenant_id)) {
        if snapshot.opening.is_none() && is_opening_event_for(r, obligation_id) {
            snapshot.opening = Some(r.clone());
        }
        if snapshot.terminal.is_none() && r.obligation_id == obligation_id && r.phase().is_terminal() {
            snapshot.terminal = Some(r.clone());
        }
    }
    snapshot
}

/// Fill in the escalate-specific fields of `snapshot` for an incoming
/// `escalate` receipt (no-op for every other phase).
fn add_escalate_extras(snapshot: &mut ObligationSnapshot, rows: &[Receipt], tenant_id: &str, receipt: &Receipt) {
    let Some(escalation) = receipt.body.escalation() else {
        return;
    };
    let tenant_rows = || rows.iter().filter(|r| r.tenant_id.as_deref() == Some(tenant_id));

    snapshot.accepted_parent = match escalation.parent_receipt_id.as_deref() {
        Some(parent_receipt_id) => {
            tenant_rows().find(|r| r.receipt_id == parent_receipt_id && r.phase() == Phase::Accepted).cloned()
        }
        None => tenant_rows()
            .find(|r| r.obligation_id == receipt.obligation_id && r.phase() == Phase::Accepted)
            .cloned(),
    };

    let child_id = escalation.child_obligation_id.as_str();
    snapshot.child_conflict = tenant_rows()
        .find(|r| r.obligation_id == child_id)
        .or_else(|| {
            tenant_rows().find(|r| r.phase() == Phase::Escalate && r.body.escalation().is_some_and(|e| e.child_obligation_id == child_id))
        })
        .map(|r| r.receipt_id.clone());
}

fn matches_filter(r: &Receipt, tenant_id: &str, f: &SearchFilter) -> bool {
    if r.tenant_id.as_deref() != Some(tenant_id) {
        return false;
    }
    if let Some(v) = &f.receipt_id {
        if &r.receipt_id != v {
            return false;
        }
    }
    if let Some(v) = &f.obligation_id {
        if &r.obligation_id != v {
            return false;
        }
    }
    if let Some(phase) = f.phase {
        if r.phase() != phase {
            return false;
        }
    }
    if let Some(v) = &f.recipient {
        if &r.recipient != v {
            return false;
        }
    }
    if let Some(v) = &f.created_by {
        if &r.created_by != v {
            return false;
        }
    }
    if let Some(v) = &f.principal {
        if r.principal.as_deref() != Some(v.as_str()) {
            return false;
        }
    }
    if let Some(v) = &f.caused_by_receipt_id {
        if r.caused_by_receipt_id.as_deref() != Some(v.as_str()) {
            return false;
        }
    }
    if let Some(v) = &f.task_id {
        if r.task_ref.as_ref().and_then(|t| t.task_id.as_deref()) != Some(v.as_str()) {
            return false;
        }
    }
    if let Some(v) = &f.plan_id {
        let plan_id = r
            .plan_ref
            .as_ref()
            .and_then(|p| p.get("plan_id"))
            .and_then(|p| p.as_str());
        if plan_id != Some(v.as_str()) {
            return false;
        }
    }
    if let Some(from) = f.created_at_from {
        if r.created_at.is_none_or(|c| c < from) {
            return false;
        }
    }
    if let Some(to) = f.created_at_to {
        if r.created_at.is_none_or(|c| c > to) {
            return false;
        }
    }
    if let Some(q) = &f.query {
        let haystack = serde_json::to_string(&r.body).unwrap_or_default().to_lowercase();
        if !haystack.contains(&q.to_lowercase()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get(&self, tenant_id: &str, receipt_id: &str) -> Result<Option<Receipt>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|r| r.tenant_id.as_deref() == Some(tenant_id) && r.receipt_id == receipt_id)
            .cloned())
    }

    async fn list_by_obligation(
        &self,
        tenant_id: &str,
        obligation_id: &str,
    ) -> Result<Vec<Receipt>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| r.tenant_id.as_deref() == Some(tenant_id) && r.obligation_id == obligation_id)
            .cloned()
            .collect())
    }

    async fn list_by_recipient_phase(
        &self,
        tenant_id: &str,
        recipient: &str,
        phase: Phase,
    ) -> Result<Vec<Receipt>, StoreError> {
        let rows = self.rows.read().await;
        let mut out: Vec<Receipt> = rows
            .iter()
            .filter(|r| {
                r.tenant_id.as_deref() == Some(tenant_id)
                    && r.recipient == recipient
                    && r.phase() == phase
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
        Ok(out)
    }

    async fn find_escalation_by_child(
        &self,
        tenant_id: &str,
        child_obligation_id: &str,
    ) -> Result<Option<Receipt>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .find(|r| {
                r.tenant_id.as_deref() == Some(tenant_id)
                    && r.body
                        .escalation()
                        .is_some_and(|e| e.child_obligation_id == child_obligation_id)
            })
            .cloned())
    }

    async fn list_escalations_by_recipient(
        &self,
        tenant_id: &str,
        recipient: &str,
    ) -> Result<Vec<Receipt>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .iter()
            .filter(|r| {
                r.tenant_id.as_deref() == Some(tenant_id)
                    && r.phase() == Phase::Escalate
                    && r.body.escalation().is_some_and(|e| e.to == recipient)
            })
            .cloned()
            .collect())
    }

    async fn search(
        &self,
        tenant_id: &str,
        filter: &SearchFilter,
    ) -> Result<(Vec<Receipt>, u64), StoreError> {
        let rows = self.rows.read().await;
        let mut matched: Vec<&Receipt> = rows.iter().filter(|r| matches_filter(r, tenant_id, filter)).collect();
        matched.sort_by(|a, b| b.stored_at.cmp(&a.stored_at));
        let total = matched.len() as u64;
        let offset = usize::try_from(filter.offset.max(0)).unwrap_or(usize::MAX);
        let limit = usize::try_from(filter.limit.max(0)).unwrap_or(0);
        let page = matched.into_iter().skip(offset).take(limit).cloned().collect();
        Ok((page, total))
    }

    async fn stats(&self, tenant_id: &str) -> Result<StatsSummary, StoreError> {
        let rows = self.rows.read().await;
        let tenant_rows: Vec<&Receipt> = rows
            .iter()
            .filter(|r| r.tenant_id.as_deref() == Some(tenant_id))
            .collect();
        let total_receipts = tenant_rows.len() as u64;

        let mut by_phase = BTreeMap::new();
        let mut recipient_counts: HashMap<String, u64> = HashMap::new();
        for r in &tenant_rows {
            *by_phase.entry(r.phase().as_str().to_string()).or_insert(0) += 1;
            *recipient_counts.entry(r.recipient.clone()).or_insert(0) += 1;
        }

        let mut top_recipients: Vec<(String, u64)> = recipient_counts.into_iter().collect();
        top_recipients.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_recipients.truncate(10);

        Ok(StatsSummary {
            total_receipts,
            by_phase,
            top_recipients,
        })
    }

    async fn snapshot_for_obligation(
        &self,
        tenant_id: &str,
        obligation_id: &str,
    ) -> Result<ObligationSnapshot, StoreError> {
        let rows = self.rows.read().await;
        Ok(snapshot_locked(&rows, tenant_id, obligation_id))
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

        let mut rows = self.rows.write().await;
        if let Some(existing) = rows
            .iter()
            .find(|r| r.tenant_id.as_deref() == Some(tenant_id) && r.receipt_id == receipt.receipt_id)
        {
            return Ok(if existing.canonical_hash.as_deref() == Some(canonical_hash.as_str()) {
                PutOutcome::Replay(existing.clone())
            } else {
                PutOutcome::Collision {
                    receipt_id: receipt.receipt_id.clone(),
                }
            });
        }

        let mut snapshot = snapshot_locked(&rows, tenant_id, &receipt.obligation_id);
        add_escalate_extras(&mut snapshot, &rows, tenant_id, &receipt);
        if let Err(err) = check(&receipt, &snapshot) {
            return Ok(PutOutcome::Rejected(err));
        }

        receipt.tenant_id = Some(tenant_id.to_string());
        let stored_at = Utc::now();
        receipt.stored_at = Some(stored_at);
        if receipt.created_at.is_none() {
            receipt.created_at = Some(stored_at);
        }
        receipt.canonical_hash = Some(canonical_hash);

        rows.push(receipt.clone());
        Ok(PutOutcome::Inserted(receipt))
    }
}
