// SPDX-License-Identifier: MIT OR Apache-2.0

//! Causal chain traversal: follow `caused_by_receipt_id`
//! back from a receipt to its root.

use rg_core::{Receipt, RgError};
use std::collections::HashSet;

use crate::Ledger;

/// Result of [`Ledger::chain`].
#[derive(Debug, Clone)]
pub struct ChainResult {
    /// The receipt the traversal started from.
    pub receipt_id: String,
    /// The chain from root to `receipt_id`, inclusive of both ends.
    /// Empty if `receipt_id` itself does not exist.
    pub chain: Vec<Receipt>,
    /// `true` if the walk stopped early because it reached `max_depth`
    /// without finding a receipt with no `caused_by_receipt_id`.
    pub truncated: bool,
}

impl Ledger {
    /// Walk `caused_by_receipt_id` back from `receipt_id` to its root,
    /// returning the chain in root-to-leaf order.
    ///
    /// A cycle (a receipt_id revisited during the walk) stops the walk at
    /// the repeated receipt rather than looping forever; `max_depth` bounds
    /// the walk the same way. Neither condition is an error: the caller
    /// gets back whatever prefix of the chain was reachable, with
    /// `truncated` set.
    ///
    /// A `receipt_id` that does not exist yields an empty chain, not an
    /// error — the caller decides whether that's a 404.
    ///
    /// # Errors
    ///
    /// Returns `RgError::Internal` if the store fails.
    pub async fn chain(&self, tenant_id: &str, receipt_id: &str, max_depth: usize) -> Result<ChainResult, RgError> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut truncated = false;

        let mut current = self.store.get(tenant_id, receipt_id).await?;
        while let Some(receipt) = current {
            if !visited.insert(receipt.receipt_id.clone()) {
                truncated = true;
                break;
            }
            let caused_by = receipt.caused_by_receipt_id.clone();
            chain.push(receipt);
            if chain.len() >= max_depth {
                truncated = truncated || caused_by.is_some();
                break;
            }
            current = match caused_by {
                Some(id) => self.store.get(tenant_id, &id).await?,
                None => None,
            };
        }

        chain.reverse();
        Ok(ChainResult {
            receipt_id: receipt_id.to_string(),
            chain,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{Ledger, LedgerOptions};
    use rg_core::ReceiptBody;
    use rg_store::memory::MemoryStore;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn accepted(receipt_id: &str, obligation_id: &str, caused_by: Option<&str>) -> rg_core::Receipt {
        rg_core::Receipt {
            receipt_id: receipt_id.into(),
            obligation_id: obligation_id.into(),
            caused_by_receipt_id: caused_by.map(str::to_string),
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
                extra: BTreeMap::new(),
            },
        }
    }

    async fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default())
    }

    #[tokio::test]
    async fn missing_receipt_yields_empty_chain() {
        let ledger = ledger().await;
        let result = ledger.chain("t1", "nope", 2048).await.unwrap();
        assert!(result.chain.is_empty());
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn chain_is_ordered_root_to_leaf() {
        let ledger = ledger().await;
        ledger.put_receipt("t1", accepted("r-1", "o-1", None)).await.unwrap();
        ledger.put_receipt("t1", accepted("r-2", "o-2", Some("r-1"))).await.unwrap();
        ledger.put_receipt("t1", accepted("r-3", "o-3", Some("r-2"))).await.unwrap();

        let result = ledger.chain("t1", "r-3", 2048).await.unwrap();
        let ids: Vec<&str> = result.chain.iter().map(|r| r.receipt_id.as_str()).collect();
        assert_eq!(ids, ["r-1", "r-2", "r-3"]);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn max_depth_truncates() {
        let ledger = ledger().await;
        ledger.put_receipt("t1", accepted("r-1", "o-1", None)).await.unwrap();
        ledger.put_receipt("t1", accepted("r-2", "o-2", Some("r-1"))).await.unwrap();
        ledger.put_receipt("t1", accepted("r-3", "o-3", Some("r-2"))).await.unwrap();

        let result = ledger.chain("t1", "r-3", 2).await.unwrap();
        assert_eq!(result.chain.len(), 2);
        assert!(result.truncated);
        let ids: Vec<&str> = result.chain.iter().map(|r| r.receipt_id.as_str()).collect();
        assert_eq!(ids, ["r-2", "r-3"]);
    }
}
