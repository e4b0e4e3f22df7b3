// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

//! Stable error taxonomy shared by every transport ReceiptGate exposes.
//!
//! Every variant carries a machine-readable `code()` and an `http_status()`
//! so the REST surface and the JSON-RPC surface can both map the same
//! [`RgError`] onto their respective wire formats without maintaining two
//! catalogs.

use serde::Serialize;
use std::fmt;

/// A single structured field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Dotted path to the offending field (e.g. `"body.escalation.to"`).
    pub field: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl FieldError {
    /// Construct a new field error.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// The one error taxonomy for ReceiptGate, shared by REST and JSON-RPC.
///
/// Each variant maps to exactly one `code()` / `http_status()` pair. Construction never loses information a caller needs: validation
/// failures carry every accumulated [`FieldError`], conflicts carry the
/// identifiers involved.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RgError {
    /// Structural or semantic validation failure (§4.2, or Step 3 of §4.4).
    #[error("validation failed: {0:?}")]
    Validation(Vec<FieldError>),

    /// Receipt body exceeds the configured byte limit.
    #[error("receipt body of {actual} bytes exceeds limit of {limit} bytes")]
    BodyTooLarge {
        /// Serialized size of the offending body, in bytes.
        actual: usize,
        /// Configured maximum, in bytes.
        limit: usize,
    },

    /// An artifact reference of kind `binary`/`dataset` is missing a digest.
    #[error("artifact ref of kind '{kind}' is missing a digest")]
    ArtifactRefInvalid {
        /// The artifact kind that failed the rule.
        kind: String,
    },

    /// `caused_by_receipt_id` does not resolve and enforcement is enabled.
    #[error("caused_by_receipt_id '{receipt_id}' was not found")]
    CauseNotFound {
        /// The dangling back-pointer.
        receipt_id: String,
    },

    /// Same `receipt_id`, different canonical hash than the stored row.
    #[error("receipt_id '{receipt_id}' already exists with a different payload")]
    ReceiptIdCollision {
        /// The colliding receipt id.
        receipt_id: String,
    },

    /// The obligation already has a terminal receipt.
    #[error("obligation '{obligation_id}' is already terminated")]
    ObligationAlreadyTerminated {
        /// The obligation that is already closed.
        obligation_id: String,
    },

    /// A `complete` receipt arrived for an obligation with no opening event.
    #[error("obligation '{obligation_id}' has no accepted receipt to complete")]
    CompleteWithoutAccept {
        /// The obligation missing its opening event.
        obligation_id: String,
    },

    /// A `cancel` receipt arrived for an obligation with no opening event.
    #[error("obligation '{obligation_id}' has no accepted receipt to cancel")]
    CancelWithoutAccept {
        /// The obligation missing its opening event.
        obligation_id: String,
    },

    /// An `escalate` receipt's parent is missing or phase-inconsistent.
    #[error("escalation parent '{parent_receipt_id}' is invalid: {reason}")]
    EscalateParentInvalid {
        /// The referenced parent receipt id.
        parent_receipt_id: String,
        /// Why the parent failed validation.
        reason: String,
    },

    /// The `child_obligation_id` of an escalation collides with an existing one.
    #[error("child obligation '{child_obligation_id}' already exists")]
    ChildObligationAlreadyExists {
        /// The colliding child obligation id.
        child_obligation_id: String,
    },

    /// The requested receipt or chain root does not exist.
    #[error("not found: {what}")]
    NotFound {
        /// Description of what was not found.
        what: String,
    },

    /// Missing or invalid API key.
    #[error("unauthorized")]
    Unauthorized,

    /// No API key configured and dev bypass disabled.
    #[error("server misconfigured: no api key and insecure dev mode disabled")]
    ServerMisconfigured,

    /// An unexpected storage failure. The request fails; the process does not.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RgError {
    /// Machine-readable, stable error code.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::BodyTooLarge { .. } => "BODY_TOO_LARGE",
            Self::ArtifactRefInvalid { .. } => "ARTIFACT_REF_INVALID",
            Self::CauseNotFound { .. } => "CAUSE_NOT_FOUND",
            Self::ReceiptIdCollision { .. } => "RECEIPT_ID_COLLISION",
            Self::ObligationAlreadyTerminated { .. } => "OBLIGATION_ALREADY_TERMINATED",
            Self::CompleteWithoutAccept { .. } => "COMPLETE_WITHOUT_ACCEPT",
            Self::CancelWithoutAccept { .. } => "CANCEL_WITHOUT_ACCEPT",
            Self::EscalateParentInvalid { .. } => "ESCALATE_PARENT_INVALID",
            Self::ChildObligationAlreadyExists { .. } => "CHILD_OBLIGATION_ALREADY_EXISTS",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::ServerMisconfigured => "SERVER_MISCONFIGURED",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// JSON-RPC string error code used by the `/mcp` surface.
    #[must_use]
    pub fn jsonrpc_code(&self) -> &'static str {
        match self {
            Self::Validation(_)
            | Self::BodyTooLarge { .. }
            | Self::ArtifactRefInvalid { .. }
            | Self::CauseNotFound { .. } => "validation_failed",
            Self::ReceiptIdCollision { .. }
            | Self::ObligationAlreadyTerminated { .. }
            | Self::CompleteWithoutAccept { .. }
            | Self::CancelWithoutAccept { .. }
            | Self::EscalateParentInvalid { .. }
            | Self::ChildObligationAlreadyExists { .. } => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::Unauthorized | Self::ServerMisconfigured => "internal_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Structured `details` payload attached to the error body, if any.
    #[must_use]
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Validation(errors) => Some(serde_json::json!({ "errors": errors })),
            Self::BodyTooLarge { actual, limit } => {
                Some(serde_json::json!({ "actual": actual, "limit": limit }))
            }
            Self::ArtifactRefInvalid { kind } => Some(serde_json::json!({ "kind": kind })),
            Self::CauseNotFound { receipt_id } => {
                Some(serde_json::json!({ "caused_by_receipt_id": receipt_id }))
            }
            Self::ReceiptIdCollision { receipt_id } => {
                Some(serde_json::json!({ "receipt_id": receipt_id }))
            }
            Self::ObligationAlreadyTerminated { obligation_id }
            | Self::CompleteWithoutAccept { obligation_id }
            | Self::CancelWithoutAccept { obligation_id } => {
                Some(serde_json::json!({ "obligation_id": obligation_id }))
            }
            Self::EscalateParentInvalid {
                parent_receipt_id,
                reason,
            } => Some(serde_json::json!({
                "parent_receipt_id": parent_receipt_id,
                "reason": reason,
            })),
            Self::ChildObligationAlreadyExists { child_obligation_id } => {
                Some(serde_json::json!({ "child_obligation_id": child_obligation_id }))
            }
            Self::NotFound { .. }
            | Self::Unauthorized
            | Self::ServerMisconfigured
            | Self::Internal(_) => None,
        }
    }
}

#[cfg(feature = "axum")]
mod axum_support {
    use super::RgError;
    use axum::Json;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Response};
    use serde_json::json;

    impl RgError {
        /// HTTP status code for the REST surface.
        #[must_use]
        pub fn http_status(&self) -> StatusCode {
            match self {
                Self::Validation(_)
                | Self::ArtifactRefInvalid { .. }
                | Self::CauseNotFound { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                Self::ReceiptIdCollision { .. }
                | Self::ObligationAlreadyTerminated { .. }
                | Self::CompleteWithoutAccept { .. }
                | Self::CancelWithoutAccept { .. }
                | Self::EscalateParentInvalid { .. }
                | Self::ChildObligationAlreadyExists { .. } => StatusCode::CONFLICT,
                Self::NotFound { .. } => StatusCode::NOT_FOUND,
                Self::Unauthorized => StatusCode::UNAUTHORIZED,
                Self::ServerMisconfigured => StatusCode::SERVICE_UNAVAILABLE,
                Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            }
        }
    }

    impl IntoResponse for RgError {
        fn into_response(self) -> Response {
            let status = self.http_status();
            let body = json!({
                "ok": false,
                "error": {
                    "code": self.code(),
                    "message": self.to_string(),
                    "details": self.details(),
                }
            });
            (status, Json(body)).into_response()
        }
    }
}
