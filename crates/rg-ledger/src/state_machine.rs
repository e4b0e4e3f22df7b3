// SPDX-License-Identifier: MIT OR Apache-2.0

//! The idempotent `put_receipt` operation and the phase-invariant
//! rule table it enforces at Step 4.

use rg_core::{Phase, Receipt, RgError};
use rg_store::{LedgerStore, ObligationSnapshot, PutOutcome};
use std::sync::Arc;

use crate::LedgerOptions;

/// Outcome of a successful [`Ledger::put_receipt`] call — the two cases
/// that are not errors.
#[derive(Debug, Clone)]
pub enum PutReceiptOutcome {
    /// No row previously existed for this `receipt_id`; it was inserted.
    Inserted(Receipt),
    /// An identical payload (same `receipt_id`, same canonical hash) was
    /// already stored; this call changed nothing.
    Replay(Receipt),
}

impl PutReceiptOutcome {
    /// The stored receipt, whichever case this is.
    #[must_use]
    pub fn receipt(&self) -> &Receipt {
        match self {
            Self::Inserted(r) | Self::Replay(r) => r,
        }
    }

    /// Whether this call was an idempotent replay of a prior write.
    #[must_use]
    pub fn is_replay(&self) -> bool {
        matches!(self, Self::Replay(_))
    }
}

/// The obligation state machine and derived views over one [`LedgerStore`].
pub struct Ledger {
    pub(crate) store: Arc<dyn LedgerStore>,
    pub(crate) options: LedgerOptions,
}

impl Ledger {
    /// Build a ledger over `store` with the given options.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, options: LedgerOptions) -> Self {
        Self { store, options }
    }

    /// The configured options this ledger enforces.
    #[must_use]
    pub fn options(&self) -> &LedgerOptions {
        &self.options
    }

    /// Run the full idempotent write path for `receipt`.
    ///
    /// # Errors
    ///
    /// Returns [`RgError::Validation`] (and its specialized siblings
    /// `BodyTooLarge`/`ArtifactRefInvalid`/`CauseNotFound`) if Step 3 fails,
    /// `RgError::ReceiptIdCollision` if Step 2 detects a genuine collision,
    /// the appropriate conflict variant if Step 4's phase-invariant check
    /// fails, or `RgError::Internal` if the store fails unexpectedly.
    pub async fn put_receipt(&self, tenant_id: &str, receipt: Receipt) -> Result<PutReceiptOutcome, RgError> {
        // Step 1 — hash. Pure; safe to compute before any lookup.
        let include_created_at = receipt.created_at_is_client_supplied();
        let (_, canonical_hash) =
            rg_canon::canonicalize(&receipt, include_created_at).map_err(|e| RgError::Internal(e.to_string()))?;

        // Step 2 (fast path) — an unlocked pre-check so a replay never pays
        // for validation or phase-invariant lookups. `LedgerStore::put_receipt`
        // re-runs this same check under lock below, so this path is an
        // optimization, not the only enforcement of it.
        if let Some(existing) = self.store.get(tenant_id, &receipt.receipt_id).await?.as_ref() {
            return if existing.canonical_hash.as_deref() == Some(canonical_hash.as_str()) {
                Ok(PutReceiptOutcome::Replay(existing.clone()))
            } else {
                Err(RgError::ReceiptIdCollision {
                    receipt_id: receipt.receipt_id.clone(),
                })
            };
        }

        // Step 3 — deferred validation.
        rg_validate::validate_receipt(&receipt, self.options.validate_limits)?;
        self.check_cause_exists(tenant_id, &receipt).await?;

        // Steps 4 & 5 — phase invariants and insert, atomic under the
        // store's concurrency discipline.
        let outcome = self
            .store
            .put_receipt(tenant_id, receipt, canonical_hash, &phase_check)
            .await?;

        match outcome {
            PutOutcome::Inserted(r) => {
                tracing::info!(receipt_id = %r.receipt_id, obligation_id = %r.obligation_id, phase = %r.phase().as_str(), "receipt stored");
                Ok(PutReceiptOutcome::Inserted(r))
            }
            PutOutcome::Replay(r) => Ok(PutReceiptOutcome::Replay(r)),
            PutOutcome::Collision { receipt_id } => Err(RgError::ReceiptIdCollision { receipt_id }),
            PutOutcome::Rejected(err) => Err(err),
        }
    }

    async fn check_cause_exists(&self, tenant_id: &str, receipt: &Receipt) -> Result<(), RgError> {
        if !self.options.enforce_cause_exists {
            return Ok(());
        }
        let Some(caused_by) = &receipt.caused_by_receipt_id else {
            return Ok(());
        };
        if self.store.get(tenant_id, caused_by).await?.is_none() {
            return Err(RgError::CauseNotFound {
                receipt_id: caused_by.clone(),
            });
        }
        Ok(())
    }
}

/// Spec §4.4 Step 4's rule table. Pure and synchronous: every fact it needs
/// already lives in `snapshot`, assembled by the store while holding the
/// obligation's write lock.
fn phase_check(receipt: &Receipt, snapshot: &ObligationSnapshot) -> Result<(), RgError> {
    let already_terminated = || RgError::ObligationAlreadyTerminated {
        obligation_id: receipt.obligation_id.clone(),
    };

    match receipt.phase() {
        Phase::Accepted => {
            if snapshot.terminal.is_some() {
                return Err(already_terminated());
            }
            Ok(())
        }
        Phase::Complete => {
            if snapshot.opening.is_none() {
                return Err(RgError::CompleteWithoutAccept {
                    obligation_id: receipt.obligation_id.clone(),
                });
            }
            if snapshot.terminal.is_some() {
                return Err(already_terminated());
            }
            Ok(())
        }
        Phase::Cancel => {
            if snapshot.opening.is_none() {
                return Err(RgError::CancelWithoutAccept {
                    obligation_id: receipt.obligation_id.clone(),
                });
            }
            if snapshot.terminal.is_some() {
                return Err(already_terminated());
            }
            Ok(())
        }
        Phase::Escalate => check_escalate(receipt, snapshot),
    }
}

fn check_escalate(receipt: &Receipt, snapshot: &ObligationSnapshot) -> Result<(), RgError> {
    // rg-validate already rejected a missing `body.escalation`, a
    // created_by/recipient mismatch, and obligation_id != parent_obligation_id
    // before this ever runs, so `escalation` is always present here.
    let Some(escalation) = receipt.body.escalation() else {
        return Err(RgError::Internal("escalate receipt missing escalation body".into()));
    };

    let Some(parent) = &snapshot.accepted_parent else {
        return Err(RgError::EscalateParentInvalid {
            parent_receipt_id: escalation.parent_receipt_id.clone().unwrap_or_default(),
            reason: "parent receipt must exist and have phase accepted".into(),
        });
    };
    if parent.obligation_id != escalation.parent_obligation_id {
        return Err(RgError::EscalateParentInvalid {
            parent_receipt_id: escalation.parent_receipt_id.clone().unwrap_or_default(),
            reason: "parent receipt's obligation_id does not match escalation.parent_obligation_id".into(),
        });
    }
    if snapshot.terminal.is_some() {
        return Err(RgError::ObligationAlreadyTerminated {
            obligation_id: receipt.obligation_id.clone(),
        });
    }
    if let Some(existing_receipt_id) = &snapshot.child_conflict {
        tracing::debug!(child_obligation_id = %escalation.child_obligation_id, existing_receipt_id = %existing_receipt_id, "escalation child obligation already in use");
        return Err(RgError::ChildObligationAlreadyExists {
            child_obligation_id: escalation.child_obligation_id.clone(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LedgerOptions;
    use rg_core::{CancelDetail, EscalationDetail, ReceiptBody};
    use rg_store::memory::MemoryStore;
    use std::collections::BTreeMap;

    fn receipt(receipt_id: &str, obligation_id: &str, recipient: &str, body: ReceiptBody) -> Receipt {
        Receipt {
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

    fn complete_body() -> ReceiptBody {
        ReceiptBody::Complete {
            summary: None,
            result: Some(serde_json::json!({"status": "ok"})),
            extra: BTreeMap::new(),
        }
    }

    fn cancel_body() -> ReceiptBody {
        ReceiptBody::Cancel {
            summary: None,
            cancel: CancelDetail {
                reason: Some("no longer needed".into()),
                extra: BTreeMap::new(),
            },
            extra: BTreeMap::new(),
        }
    }

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()), LedgerOptions::default())
    }

    #[tokio::test]
    async fn accept_then_complete_succeeds() {
        let ledger = ledger();
        ledger.put_receipt("t1", receipt("r-1", "o-1", "agent:b", accepted_body())).await.unwrap();
        let mut complete = receipt("r-2", "o-1", "agent:b", complete_body());
        complete.caused_by_receipt_id = Some("r-1".into());
        let outcome = ledger.put_receipt("t1", complete).await.unwrap();
        assert!(!outcome.is_replay());
    }

    #[tokio::test]
    async fn identical_resubmission_is_a_replay() {
        let ledger = ledger();
        let r = receipt("r-1", "o-1", "agent:b", accepted_body());
        ledger.put_receipt("t1", r.clone()).await.unwrap();
        let outcome = ledger.put_receipt("t1", r).await.unwrap();
        assert!(outcome.is_replay());
    }

    #[tokio::test]
    async fn changed_resubmission_is_a_collision() {
        let ledger = ledger();
        ledger.put_receipt("t1", receipt("r-1", "o-1", "agent:b", accepted_body())).await.unwrap();
        let mut changed = receipt("r-1", "o-1", "agent:c", accepted_body());
        changed.receipt_id = "r-1".into();
        let err = ledger.put_receipt("t1", changed).await.unwrap_err();
        assert!(matches!(err, RgError::ReceiptIdCollision { .. }));
    }

    #[tokio::test]
    async fn complete_without_accept_is_rejected() {
        let ledger = ledger();
        let err = ledger
            .put_receipt("t1", receipt("r-1", "o-1", "agent:b", complete_body()))
            .await
            .unwrap_err();
        assert!(matches!(err, RgError::CompleteWithoutAccept { .. }));
    }

    #[tokio::test]
    async fn cancel_without_accept_is_rejected() {
        let ledger = ledger();
        let err = ledger
            .put_receipt("t1", receipt("r-1", "o-1", "agent:b", cancel_body()))
            .await
            .unwrap_err();
        assert!(matches!(err, RgError::CancelWithoutAccept { .. }));
    }

    #[tokio::test]
    async fn second_terminal_receipt_is_rejected() {
        let ledger = ledger();
        ledger.put_receipt("t1", receipt("r-1", "o-1", "agent:b", accepted_body())).await.unwrap();
        let mut complete = receipt("r-2", "o-1", "agent:b", complete_body());
        complete.caused_by_receipt_id = Some("r-1".into());
        ledger.put_receipt("t1", complete).await.unwrap();

        let mut cancel = receipt("r-3", "o-1", "agent:b", cancel_body());
        cancel.caused_by_receipt_id = Some("r-2".into());
        let err = ledger.put_receipt("t1", cancel).await.unwrap_err();
        assert!(matches!(err, RgError::ObligationAlreadyTerminated { .. }));
    }

    #[tokio::test]
    async fn escalate_opens_child_obligation() {
        let ledger = ledger();
        ledger.put_receipt("t1", receipt("r-1", "o-1", "agent:a", accepted_body())).await.unwrap();

        let escalation = EscalationDetail {
            parent_receipt_id: Some("r-1".into()),
            parent_obligation_id: "o-1".into(),
            child_obligation_id: "o-1c".into(),
            from: Some("agent:a".into()),
            to: "agent:a".into(),
            reason: Some("needs a specialist".into()),
            extra: BTreeMap::new(),
        };
        let mut escalate = receipt(
            "r-1e",
            "o-1",
            "agent:a",
            ReceiptBody::Escalate {
                summary: None,
                escalation,
                extra: BTreeMap::new(),
            },
        );
        escalate.caused_by_receipt_id = Some("r-1".into());
        let outcome = ledger.put_receipt("t1", escalate).await.unwrap();
        assert!(!outcome.is_replay());

        let items = ledger.store.snapshot_for_obligation("t1", "o-1c").await.unwrap();
        assert!(items.opening.is_some());
        assert_eq!(items.opening.unwrap().receipt_id, "r-1e");
    }

    #[tokio::test]
    async fn escalate_without_accepted_parent_is_rejected() {
        let ledger = ledger();
        let escalation = EscalationDetail {
            parent_receipt_id: None,
            parent_obligation_id: "o-1".into(),
            child_obligation_id: "o-1c".into(),
            from: Some("agent:a".into()),
            to: "agent:a".into(),
            reason: None,
            extra: BTreeMap::new(),
        };
        let escalate = receipt(
            "r-1e",
            "o-1",
            "agent:a",
            ReceiptBody::Escalate {
                summary: None,
                escalation,
                extra: BTreeMap::new(),
            },
        );
        let err = ledger.put_receipt("t1", escalate).await.unwrap_err();
        assert!(matches!(err, RgError::EscalateParentInvalid { .. }));
    }

    #[tokio::test]
    async fn escalate_onto_claimed_child_obligation_is_rejected() {
        let ledger = ledger();
        ledger.put_receipt("t1", receipt("r-1", "o-1", "agent:a", accepted_body())).await.unwrap();
        ledger.put_receipt("t1", receipt("r-2", "o-2", "agent:a", accepted_body())).await.unwrap();

        let escalation = EscalationDetail {
            parent_receipt_id: Some("r-1".into()),
            parent_obligation_id: "o-1".into(),
            child_obligation_id: "o-2".into(),
            from: Some("agent:a".into()),
            to: "agent:a".into(),
            reason: None,
            extra: BTreeMap::new(),
        };
        let escalate = receipt(
            "r-1e",
            "o-1",
            "agent:a",
            ReceiptBody::Escalate {
                summary: None,
                escalation,
                extra: BTreeMap::new(),
            },
        );
        let err = ledger.put_receipt("t1", escalate).await.unwrap_err();
        assert!(matches!(err, RgError::ChildObligationAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn enforce_cause_exists_rejects_dangling_reference() {
        let ledger = Ledger::new(
            Arc::new(MemoryStore::new()),
            LedgerOptions {
                enforce_cause_exists: true,
                ..LedgerOptions::default()
            },
        );
        let mut r = receipt("r-1", "o-1", "agent:b", accepted_body());
        r.caused_by_receipt_id = Some("does-not-exist".into());
        let err = ledger.put_receipt("t1", r).await.unwrap_err();
        assert!(matches!(err, RgError::CauseNotFound { .. }));
    }
}
