// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! rg-core
//!
//! The stable contract for ReceiptGate: the canonical [`Receipt`] envelope
//! and the [`RgError`] taxonomy shared by every transport. If you only take
//! one dependency from this workspace, take this one.

/// Stable error taxonomy shared by REST and JSON-RPC.
pub mod error;
/// The canonical receipt envelope and its phase-specific payloads.
pub mod receipt;

pub use error::{FieldError, RgError};
pub use receipt::{
    ArtifactRef, CancelDetail, EscalationDetail, Phase, Receipt, ReceiptBody, TaskRef,
};

/// Identifier pattern every `receipt_id` and `obligation_id` must match
///: ASCII letters, digits, `.`, `_`, `:`, `-`.
#[must_use]
pub fn is_valid_identifier_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')
}

/// Maximum length of `receipt_id`.
pub const RECEIPT_ID_MAX_LEN: usize = 200;

/// Default tenant id used in single-tenant deployments.
pub const DEFAULT_TENANT_ID: &str = "default";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_chars_match_allowed_pattern() {
        assert!(is_valid_identifier_char('a'));
        assert!(is_valid_identifier_char('Z'));
        assert!(is_valid_identifier_char('9'));
        assert!(is_valid_identifier_char('.'));
        assert!(is_valid_identifier_char('_'));
        assert!(is_valid_identifier_char(':'));
        assert!(is_valid_identifier_char('-'));
        assert!(!is_valid_identifier_char(' '));
        assert!(!is_valid_identifier_char('/'));
        assert!(!is_valid_identifier_char('@'));
    }
}
