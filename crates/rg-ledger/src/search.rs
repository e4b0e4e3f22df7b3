// SPDX-License-Identifier: MIT OR Apache-2.0

//! Thin wrappers over [`rg_store::LedgerStore`] for operations that need no
//! ledger-level logic beyond limit clamping.

use rg_core::{Receipt, RgError};
use rg_store::{SearchFilter, StatsSummary};

use crate::Ledger;

impl Ledger {
    /// Fetch a single receipt, or `None` if it does not exist for this
    /// tenant.
    ///
    /// # Errors
    ///
    /// Returns `RgError::Internal` if the store fails.
    pub async fn get(&self, tenant_id: &str, receipt_id: &str) -> Result<Option<Receipt>, RgError> {
        Ok(self.store.get(tenant_id, receipt_id).await?)
    }

    /// All receipts for an obligation, in storage order.
    ///
    /// # Errors
    ///
    /// Returns `RgError::Internal` if the store fails.
    pub async fn receipts_for_obligation(&self, tenant_id: &str, obligation_id: &str) -> Result<Vec<Receipt>, RgError> {
        Ok(self.store.list_by_obligation(tenant_id, obligation_id).await?)
    }

    /// Filtered, paginated search. `filter.limit` is
    /// clamped to `[1, search_max_limit]`; a non-positive limit is replaced
    /// with `search_default_limit` first. Substituting the *absent* query
    /// parameter with `search_default_limit` is the request-parsing
    /// boundary's job (`rg-daemon`), not this method's — by the time a
    /// filter reaches here its limit is always a concrete number, just
    /// possibly out of range.
    ///
    /// # Errors
    ///
    /// Returns `RgError::Internal` if the store fails.
    pub async fn search(&self, tenant_id: &str, mut filter: SearchFilter) -> Result<(Vec<Receipt>, u64), RgError> {
        if filter.limit <= 0 {
            filter.limit = self.options.search_default_limit;
        }
        filter.limit = filter.limit.clamp(1, self.options.search_max_limit);
        Ok(self.store.search(tenant_id, &filter).await?)
    }

    /// Ledger-wide counters.
    ///
    /// # Errors
    ///
    /// Returns `RgError::Internal` if the store fails.
    pub async fn stats(&self, tenant_id: &str) -> Result<StatsSummary, RgError> {
        Ok(self.store.stats(tenant_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Ledger, LedgerOptions};
    use rg_core::ReceiptBody;
    use rg_store::{memory::MemoryStore, SearchFilter};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn accepted(receipt_id: &str, obligation_id: &str, recipient: &str) -> rg_core::Receipt {
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
            body: ReceiptBody::Accepted {
                summary: None,
                inputs: None,
                constraints: None,
                extra: BTreeMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn search_clamps_nonpositive_limit_to_default() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default());
        ledger.put_receipt("t1", accepted("r-1", "o-1", "agent:b")).await.unwrap();

        let filter = SearchFilter {
            limit: 0,
            ..Default::default()
        };
        let (rows, total) = ledger.search("t1", filter).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn search_clamps_limit_above_max() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default());
        let filter = SearchFilter {
            limit: 100_000,
            ..Default::default()
        };
        ledger.search("t1", filter).await.unwrap();
    }

    #[tokio::test]
    async fn stats_reports_total() {
        let ledger = Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default());
        ledger.put_receipt("t1", accepted("r-1", "o-1", "agent:b")).await.unwrap();
        let stats = ledger.stats("t1").await.unwrap();
        assert_eq!(stats.total_receipts, 1);
    }
}
