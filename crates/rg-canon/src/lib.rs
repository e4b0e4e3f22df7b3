// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! rg-canon
//!
//! Deterministic JSON canonicalization and SHA-256 content hashing for
//! [`Receipt`]s. The canonical hash is the idempotency key of
//! the whole ledger: two identical client payloads must hash identically
//! no matter when they are stored, and two different payloads that share a
//! `receipt_id` must hash differently so [`rg_ledger`](../rg_ledger/index.html)
//! can tell replay from collision.

use rg_core::Receipt;
use serde::Serialize;
use serde_json::Value;
use serde_json::ser::Formatter;
use sha2::{Digest, Sha256};
use std::io;

/// Errors from canonicalization. In practice these only occur if a
/// [`Receipt`] cannot round-trip through `serde_json::Value`, which should
/// never happen for a well-typed receipt.
#[derive(Debug, thiserror::Error)]
pub enum CanonError {
    /// The receipt could not be converted to a JSON value.
    #[error("failed to canonicalize receipt: {0}")]
    Json(#[from] serde_json::Error),
}

/// Fields never included in the canonical hash regardless of phase or
/// configuration: server-assigned bookkeeping that must not
/// perturb the idempotency key.
const ALWAYS_STRIPPED_FIELDS: [&str; 4] =
    ["tenant_id", "stored_at", "canonical_hash", "idempotent_replay"];

/// Produce the canonical `serde_json::Value` for a receipt: null-valued and
/// unset fields omitted, server-assigned bookkeeping stripped, and
/// `created_at` included only when `include_created_at` is `true`.
///
/// # Errors
///
/// Returns [`CanonError::Json`] if the receipt cannot be converted to a
/// JSON value.
pub fn canonical_value(receipt: &Receipt, include_created_at: bool) -> Result<Value, CanonError> {
    let mut value = serde_json::to_value(receipt)?;
    if let Value::Object(map) = &mut value {
        for field in ALWAYS_STRIPPED_FIELDS {
            map.remove(field);
        }
        if !include_created_at {
            map.remove("created_at");
        }
    }
    strip_nulls(&mut value);
    Ok(value)
}

/// Produce `(canonical_json, canonical_hash)` for a receipt, where
/// `canonical_hash` is `"sha256:" + hex(sha256(canonical_json))`.
///
/// # Errors
///
/// Returns [`CanonError::Json`] if the receipt cannot be converted to a
/// JSON value.
///
/// # Examples
///
/// ```
/// use rg_canon::canonicalize;
/// use rg_core::{Receipt, ReceiptBody};
/// use std::collections::BTreeMap;
///
/// let receipt = Receipt {
///     receipt_id: "r-1".into(),
///     obligation_id: "o-1".into(),
///     caused_by_receipt_id: None,
///     created_by: "agent:a".into(),
///     recipient: "agent:b".into(),
///     principal: None,
///     task_ref: None,
///     plan_ref: None,
///     artifact_refs: vec![],
///     created_at: None,
///     canonical_hash: None,
///     tenant_id: None,
///     stored_at: None,
///     body: ReceiptBody::Accepted { summary: None, inputs: None, constraints: None, extra: BTreeMap::new() },
/// };
/// let (json_a, hash_a) = canonicalize(&receipt, false).unwrap();
/// let (json_b, hash_b) = canonicalize(&receipt, false).unwrap();
/// assert_eq!(json_a, json_b);
/// assert_eq!(hash_a, hash_b);
/// assert!(hash_a.starts_with("sha256:"));
/// ```
pub fn canonicalize(receipt: &Receipt, include_created_at: bool) -> Result<(String, String), CanonError> {
    let value = canonical_value(receipt, include_created_at)?;
    let json = to_ascii_compact_json(&value)?;
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    let hash = format!("sha256:{:x}", hasher.finalize());
    Ok((json, hash))
}

/// Recursively drop object fields whose value is `null`. Object keys are
/// already sorted lexicographically by `serde_json`'s default `BTreeMap`
/// backing (this workspace does not enable the `preserve_order` feature),
/// so no explicit sort step is required here.
fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            for v in map.values_mut() {
                strip_nulls(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_nulls(v);
            }
        }
        _ => {}
    }
}

/// A [`Formatter`] identical to `serde_json`'s `CompactFormatter` except
/// that it escapes every non-ASCII character as a `\uXXXX` sequence, so the
/// canonical form is stable regardless of the source encoding.
/// Every other `Formatter` method keeps its default (already-compact)
/// implementation; only string fragments need to change.
#[derive(Default)]
struct AsciiEscapeFormatter;

impl Formatter for AsciiEscapeFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut utf16_buf = [0u16; 2];
        for c in fragment.chars() {
            if c.is_ascii() {
                writer.write_all(&[c as u8])?;
            } else {
                for unit in c.encode_utf16(&mut utf16_buf) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

fn to_ascii_compact_json(value: &Value) -> Result<String, CanonError> {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, AsciiEscapeFormatter);
    value.serialize(&mut ser)?;
    // `AsciiEscapeFormatter` only ever writes ASCII bytes.
    Ok(String::from_utf8(buf).expect("ascii-escaped JSON is valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rg_core::{Receipt, ReceiptBody};
    use std::collections::BTreeMap;

    fn base_receipt() -> Receipt {
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
                summary: Some("héllo wörld".into()),
                inputs: None,
                constraints: None,
                extra: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn hash_is_stable_across_repeated_calls() {
        let r = base_receipt();
        let (j1, h1) = canonicalize(&r, false).unwrap();
        let (j2, h2) = canonicalize(&r, false).unwrap();
        assert_eq!(j1, j2);
        assert_eq!(h1, h2);
    }

    #[test]
    fn non_ascii_is_escaped() {
        let r = base_receipt();
        let (json, _) = canonicalize(&r, false).unwrap();
        assert!(!json.bytes().any(|b| b >= 0x80));
        assert!(json.contains("\\u00e9")); // é
        assert!(json.contains("\\u00f6")); // ö
    }

    #[test]
    fn server_assigned_fields_never_affect_hash() {
        let mut with_bookkeeping = base_receipt();
        with_bookkeeping.tenant_id = Some("tenant-x".into());
        with_bookkeeping.stored_at = Some(chrono::Utc::now());
        with_bookkeeping.canonical_hash = Some("sha256:deadbeef".into());

        let bare = base_receipt();

        let (_, h1) = canonicalize(&with_bookkeeping, false).unwrap();
        let (_, h2) = canonicalize(&bare, false).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn created_at_only_affects_hash_when_included() {
        let mut r = base_receipt();
        r.created_at = Some(chrono::Utc::now());

        let (_, included) = canonicalize(&r, true).unwrap();
        let (_, excluded) = canonicalize(&r, false).unwrap();
        assert_ne!(included, excluded);

        let (_, excluded_again) = canonicalize(&base_receipt(), false).unwrap();
        assert_eq!(excluded, excluded_again);
    }

    #[test]
    fn object_keys_are_sorted() {
        let r = base_receipt();
        let (json, _) = canonicalize(&r, false).unwrap();
        // `obligation_id` (o) sorts after `created_by` (c) sorts after `body` keys...
        let ob_idx = json.find("\"obligation_id\"").unwrap();
        let created_by_idx = json.find("\"created_by\"").unwrap();
        assert!(created_by_idx < ob_idx);
    }

    #[test]
    fn no_whitespace_in_output() {
        let r = base_receipt();
        let (json, _) = canonicalize(&r, false).unwrap();
        assert!(!json.contains(' '));
        assert!(!json.contains('\n'));
    }
}
