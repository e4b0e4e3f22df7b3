// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! rg-validate
//!
//! Stateless structural and semantic validation of a [`Receipt`] envelope.
//! Every check here is independent of ledger state — no store
//! lookups — so it runs before the state machine ever opens a transaction.
//! Violations accumulate rather than short-circuit, so a caller sees every
//! problem in one `422 VALIDATION_ERROR` response instead of fixing issues
//! one at a time.

use rg_core::{FieldError, Phase, Receipt, ReceiptBody, RgError};

/// Limits the validator enforces that a deployment may configure. Everything else in this module is a fixed structural rule.
#[derive(Debug, Clone, Copy)]
pub struct ValidateLimits {
    /// Maximum JSON-serialized size, in bytes, of a receipt's `body`
    /// sub-object. Default `262_144`.
    pub receipt_body_max_bytes: usize,
}

impl Default for ValidateLimits {
    fn default() -> Self {
        Self {
            receipt_body_max_bytes: 262_144,
        }
    }
}

const MAX_IDENTIFIER_LEN: usize = 200;

/// Validate a [`Receipt`] envelope against every structural and semantic
/// rule that does not require a ledger lookup (cause-existence is the one
/// ledger-state check and lives in `rg-ledger`'s Step 3 instead).
///
/// # Errors
///
/// Returns [`RgError::Validation`] carrying every [`FieldError`] found. An
/// empty accumulator is never returned as an error — `Ok(())` means the
/// envelope is structurally and semantically sound.
pub fn validate_receipt(receipt: &Receipt, limits: ValidateLimits) -> Result<(), RgError> {
    let mut errors = Vec::new();

    validate_identifiers(receipt, &mut errors);
    validate_self_loop(receipt, &mut errors);
    validate_body_size(receipt, limits, &mut errors);
    validate_artifact_refs(receipt, &mut errors);
    validate_phase_requirements(receipt, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(RgError::Validation(errors))
    }
}

fn validate_identifiers(receipt: &Receipt, errors: &mut Vec<FieldError>) {
    if receipt.receipt_id.is_empty() {
        errors.push(FieldError::new("receipt_id", "must not be empty"));
    } else if receipt.receipt_id.len() > rg_core::RECEIPT_ID_MAX_LEN {
        errors.push(FieldError::new(
            "receipt_id",
            format!("must be at most {} characters", rg_core::RECEIPT_ID_MAX_LEN),
        ));
    } else if !receipt
        .receipt_id
        .chars()
        .all(rg_core::is_valid_identifier_char)
    {
        errors.push(FieldError::new(
            "receipt_id",
            "must match [A-Za-z0-9._:-]+",
        ));
    }

    if receipt.obligation_id.is_empty() {
        errors.push(FieldError::new("obligation_id", "must not be empty"));
    } else if receipt.obligation_id.len() > MAX_IDENTIFIER_LEN {
        errors.push(FieldError::new(
            "obligation_id",
            format!("must be at most {MAX_IDENTIFIER_LEN} characters"),
        ));
    }

    if receipt.created_by.is_empty() {
        errors.push(FieldError::new("created_by", "must not be empty"));
    }
    if receipt.recipient.is_empty() {
        errors.push(FieldError::new("recipient", "must not be empty"));
    }
    if let Some(principal) = &receipt.principal {
        if principal.is_empty() {
            errors.push(FieldError::new("principal", "must not be empty when present"));
        }
    }
}

fn validate_self_loop(receipt: &Receipt, errors: &mut Vec<FieldError>) {
    if let Some(caused_by) = &receipt.caused_by_receipt_id {
        if caused_by == &receipt.receipt_id {
            errors.push(FieldError::new(
                "caused_by_receipt_id",
                "must not reference its own receipt_id",
            ));
        }
    }
}

fn validate_body_size(receipt: &Receipt, limits: ValidateLimits, errors: &mut Vec<FieldError>) {
    let size = serde_json::to_vec(&receipt.body).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > limits.receipt_body_max_bytes {
        errors.push(FieldError::new(
            "body",
            format!(
                "serialized body of {size} bytes exceeds limit of {} bytes",
                limits.receipt_body_max_bytes
            ),
        ));
    }
}

fn validate_artifact_refs(receipt: &Receipt, errors: &mut Vec<FieldError>) {
    for (i, artifact) in receipt.artifact_refs.iter().enumerate() {
        if artifact.requires_digest() && artifact.digest.as_deref().unwrap_or("").is_empty() {
            errors.push(FieldError::new(
                format!("artifact_refs[{i}].digest"),
                format!("required when kind is '{}'", artifact.kind),
            ));
        }
    }
}

fn validate_phase_requirements(receipt: &Receipt, errors: &mut Vec<FieldError>) {
    match &receipt.body {
        ReceiptBody::Accepted { .. } => {}
        ReceiptBody::Complete { result, .. } => {
            let has_artifacts = !receipt.artifact_refs.is_empty();
            let has_result = result.is_some();
            if !has_artifacts && !has_result {
                errors.push(FieldError::new(
                    "body.result",
                    "complete receipts require artifact_refs or body.result",
                ));
            }
        }
        ReceiptBody::Escalate { escalation, .. } => {
            if receipt.created_by != receipt.recipient {
                errors.push(FieldError::new(
                    "created_by",
                    "escalate receipts must be minted by the escalating recipient (created_by == recipient)",
                ));
            }
            if receipt.recipient != escalation.to {
                errors.push(FieldError::new(
                    "body.escalation.to",
                    "must equal recipient",
                ));
            }
            if receipt.obligation_id != escalation.parent_obligation_id {
                errors.push(FieldError::new(
                    "body.escalation.parent_obligation_id",
                    "must equal obligation_id",
                ));
            }
            if escalation.child_obligation_id.is_empty() {
                errors.push(FieldError::new(
                    "body.escalation.child_obligation_id",
                    "must not be empty",
                ));
            } else if escalation.child_obligation_id == receipt.obligation_id {
                errors.push(FieldError::new(
                    "body.escalation.child_obligation_id",
                    "must differ from the parent obligation_id",
                ));
            }
        }
        ReceiptBody::Cancel { .. } => {}
    }
}

/// Whether `phase` is the one this receipt's body carries. Convenience for
/// callers that only hold a [`Phase`] (e.g. search filters).
#[must_use]
pub fn matches_phase(receipt: &Receipt, phase: Phase) -> bool {
    receipt.phase() == phase
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_core::{ArtifactRef, CancelDetail, EscalationDetail, ReceiptBody};
    use std::collections::BTreeMap;

    fn accepted() -> Receipt {
        Receipt {
            receipt_id: "r-1".into(),
            obligation_id: "o-1".into(),
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
                extra: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn valid_accepted_receipt_passes() {
        assert!(validate_receipt(&accepted(), ValidateLimits::default()).is_ok());
    }

    #[test]
    fn empty_receipt_id_is_rejected() {
        let mut r = accepted();
        r.receipt_id = String::new();
        let err = validate_receipt(&r, ValidateLimits::default()).unwrap_err();
        match err {
            RgError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.field == "receipt_id"));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn self_loop_is_rejected() {
        let mut r = accepted();
        r.caused_by_receipt_id = Some("r-1".into());
        let err = validate_receipt(&r, ValidateLimits::default()).unwrap_err();
        match err {
            RgError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.field == "caused_by_receipt_id"));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn na_sentinel_is_already_none_by_the_time_validation_runs() {
        let json = serde_json::json!({
            "receipt_id": "r-1",
            "obligation_id": "o-1",
            "caused_by_receipt_id": "NA",
            "created_by": "agent:a",
            "recipient": "agent:b",
            "phase": "accepted",
        });
        let receipt: Receipt = serde_json::from_value(json).unwrap();
        assert_eq!(receipt.caused_by_receipt_id, None);
        assert!(validate_receipt(&receipt, ValidateLimits::default()).is_ok());
    }

    #[test]
    fn complete_requires_artifacts_or_result() {
        let mut r = accepted();
        r.body = ReceiptBody::Complete {
            summary: None,
            result: None,
            extra: BTreeMap::new(),
        };
        let err = validate_receipt(&r, ValidateLimits::default()).unwrap_err();
        match err {
            RgError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.field == "body.result"));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn complete_with_artifact_ref_passes_without_result() {
        let mut r = accepted();
        r.artifact_refs.push(ArtifactRef {
            kind: "text".into(),
            digest: None,
            uri: Some("s3://bucket/key".into()),
            extra: BTreeMap::new(),
        });
        r.body = ReceiptBody::Complete {
            summary: None,
            result: None,
            extra: BTreeMap::new(),
        };
        assert!(validate_receipt(&r, ValidateLimits::default()).is_ok());
    }

    #[test]
    fn binary_artifact_without_digest_is_rejected() {
        let mut r = accepted();
        r.artifact_refs.push(ArtifactRef {
            kind: "binary".into(),
            digest: None,
            uri: None,
            extra: BTreeMap::new(),
        });
        let err = validate_receipt(&r, ValidateLimits::default()).unwrap_err();
        match err {
            RgError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.field.contains("digest")));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn escalate_routing_invariant_is_enforced() {
        let mut r = accepted();
        r.obligation_id = "o-1".into();
        r.created_by = "agent:a".into();
        r.recipient = "agent:a".into();
        r.body = ReceiptBody::Escalate {
            summary: None,
            escalation: EscalationDetail {
                parent_receipt_id: Some("r-0".into()),
                parent_obligation_id: "o-1".into(),
                child_obligation_id: "o-1c".into(),
                from: Some("agent:a".into()),
                to: "agent:a".into(),
                reason: None,
                extra: BTreeMap::new(),
            },
            extra: BTreeMap::new(),
        };
        assert!(validate_receipt(&r, ValidateLimits::default()).is_ok());

        // Break the routing invariant: recipient no longer matches escalation.to.
        if let ReceiptBody::Escalate { escalation, .. } = &mut r.body {
            escalation.to = "agent:other".into();
        }
        let err = validate_receipt(&r, ValidateLimits::default()).unwrap_err();
        match err {
            RgError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.field == "body.escalation.to"));
            }
            _ => panic!("expected validation error"),
        }
    }

    #[test]
    fn cancel_detail_is_required_by_the_type_and_passes_validation() {
        let mut r = accepted();
        r.body = ReceiptBody::Cancel {
            summary: None,
            cancel: CancelDetail {
                reason: Some("no longer needed".into()),
                extra: BTreeMap::new(),
            },
            extra: BTreeMap::new(),
        };
        assert!(validate_receipt(&r, ValidateLimits::default()).is_ok());
    }

    #[test]
    fn body_too_large_is_rejected() {
        let mut r = accepted();
        r.body = ReceiptBody::Accepted {
            summary: Some("x".repeat(100)),
            inputs: None,
            constraints: None,
            extra: BTreeMap::new(),
        };
        let limits = ValidateLimits {
            receipt_body_max_bytes: 10,
        };
        let err = validate_receipt(&r, limits).unwrap_err();
        match err {
            RgError::Validation(errors) => {
                assert!(errors.iter().any(|e| e.field == "body"));
            }
            _ => panic!("expected validation error"),
        }
    }
}
