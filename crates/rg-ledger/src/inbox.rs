// SPDX-License-Identifier: MIT OR Apache-2.0

//! Inbox projection: which obligations are currently open and
//! assigned to a recipient.

use rg_core::{Phase, Receipt, RgError};
use std::collections::HashSet;

use crate::Ledger;

/// One open obligation assigned to a recipient.
#[derive(Debug, Clone)]
pub struct InboxItem {
    /// The obligation this item represents.
    pub obligation_id: String,
    /// The receipt that opened it.
    pub opened_by_receipt_id: String,
    /// Whether it was opened by an `accepted` or an `escalate` receipt.
    pub opened_by_phase: Phase,
    /// The opening receipt itself.
    pub receipt: Receipt,
    /// Set only when `opened_by_phase` is `escalate`: the obligation the
    /// escalation closed out to open this one.
    pub parent_obligation_id: Option<String>,
}

impl Ledger {
    /// Obligations currently open and assigned to `recipient`, most recently
    /// opened first. `limit` of `0` means unlimited.
    ///
    /// # Errors
    ///
    /// Returns `RgError::Internal` if the store fails.
    pub async fn inbox(&self, tenant_id: &str, recipient: &str, limit: usize) -> Result<Vec<InboxItem>, RgError> {
        let mut items = Vec::new();
        let mut seen_obligations = HashSet::new();

        let accepted = self.store.list_by_recipient_phase(tenant_id, recipient, Phase::Accepted).await?;
        for r in accepted {
            if !seen_obligations.insert(r.obligation_id.clone()) {
                continue;
            }
            let snapshot = self.store.snapshot_for_obligation(tenant_id, &r.obligation_id).await?;
            if snapshot.terminal.is_some() {
                continue;
            }
            items.push(InboxItem {
                obligation_id: r.obligation_id.clone(),
                opened_by_receipt_id: r.receipt_id.clone(),
                opened_by_phase: Phase::Accepted,
                receipt: r,
                parent_obligation_id: None,
            });
        }

        let escalations = self.store.list_escalations_by_recipient(tenant_id, recipient).await?;
        for r in escalations {
            let Some(escalation) = r.body.escalation() else {
                continue;
            };
            let child_obligation_id = escalation.child_obligation_id.clone();
            let parent_obligation_id = escalation.parent_obligation_id.clone();
            if child_obligation_id.is_empty() || !seen_obligations.insert(child_obligation_id.clone()) {
                continue;
            }
            let snapshot = self.store.snapshot_for_obligation(tenant_id, &child_obligation_id).await?;
            if snapshot.terminal.is_some() {
                continue;
            }
            items.push(InboxItem {
                obligation_id: child_obligation_id,
                opened_by_receipt_id: r.receipt_id.clone(),
                opened_by_phase: Phase::Escalate,
                receipt: r,
                parent_obligation_id: Some(parent_obligation_id),
            });
        }

        items.sort_by(|a, b| b.receipt.created_at.cmp(&a.receipt.created_at));
        if limit > 0 {
            items.truncate(limit);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Ledger, LedgerOptions};
    use rg_core::{EscalationDetail, ReceiptBody};
    use rg_store::memory::MemoryStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn base(receipt_id: &str, obligation_id: &str, recipient: &str, body: ReceiptBody) -> rg_core::Receipt {
        rg_core::Receipt {
            receipt_id: receipt_id.into(),
            obligation_id: obligation_id.into(),
            caused_by_receipt_id: None,
            created_by: "agent:a".into(),
            recipient: recipient.into(),
            principal: None,
            task_ref: None,
            plan_ref: None,
            artifact_refs: vec![],
            created_at: None,
            canonical_hash: None,
            tenant_id: None,
            stored_at: None,
            body,
        }
    }

    fn accepted_body() -> ReceiptBody {
        ReceiptBody::Accepted {
            summary: None,
            inputs: None,
            constraints: None,
            extra: BTreeMap::new(),
        }
    }

    async fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default())
    }

    #[tokio::test]
    async fn open_obligation_appears_in_inbox() {
        let ledger = ledger().await;
        ledger
            .put_receipt("t1", base("r-1", "o-1", "agent:b", accepted_body()))
            .await
            .unwrap();

        let items = ledger.inbox("t1", "agent:b", 50).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].obligation_id, "o-1");
        assert_eq!(items[0].opened_by_phase, rg_core::Phase::Accepted);
    }

    #[tokio::test]
    async fn completed_obligation_is_excluded() {
        let ledger = ledger().await;
        ledger
            .put_receipt("t1", base("r-1", "o-1", "agent:b", accepted_body()))
            .await
            .unwrap();
        let mut complete = base("r-2", "o-1", "agent:b", ReceiptBody::Complete {
            summary: None,
            result: Some(serde_json::json!({"status": "ok"})),
            extra: BTreeMap::new(),
        });
        complete.caused_by_receipt_id = Some("r-1".into());
        ledger.put_receipt("t1", complete).await.unwrap();

        let items = ledger.inbox("t1", "agent:b", 50).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn escalated_obligation_opens_child_not_parent() {
        let ledger = ledger().await;
        ledger
            .put_receipt("t1", base("r-1", "o-1", "agent:a", accepted_body()))
            .await
            .unwrap();

        let escalation = EscalationDetail {
            parent_receipt_id: Some("r-1".into()),
            parent_obligation_id: "o-1".into(),
            child_obligation_id: "o-1c".into(),
            from: Some("agent:a".into()),
            to: "agent:a".into(),
            reason: Some("too complex".into()),
            extra: BTreeMap::new(),
        };
        let escalate = base(
            "r-1e",
            "o-1",
            "agent:a",
            ReceiptBody::Escalate {
                summary: None,
                escalation,
                extra: BTreeMap::new(),
            },
        );
        ledger.put_receipt("t1", escalate).await.unwrap();

        let items = ledger.inbox("t1", "agent:a", 50).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].obligation_id, "o-1c");
        assert_eq!(items[0].parent_obligation_id.as_deref(), Some("o-1"));
    }

    #[tokio::test]
    async fn limit_zero_means_unlimited() {
        let ledger = ledger().await;
        for i in 0..3 {
            ledger
                .put_receipt("t1", base(&format!("r-{i}"), &format!("o-{i}"), "agent:b", accepted_body()))
                .await
                .unwrap();
        }
        let items = ledger.inbox("t1", "agent:b", 0).await.unwrap();
        assert_eq!(items.len(), 3);
    }
}
