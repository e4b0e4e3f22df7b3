// SPDX-License-Identifier: MIT OR Apache-2.0
#![warn(missing_docs)]

//! rg-ledger
//!
//! The obligation state machine and its derived views: the idempotent write
//! path, inbox projection, causal chain
//! traversal, and search/stats pass-throughs. Built
//! on [`rg_store::LedgerStore`] — this crate owns the phase-invariant rule
//! table; the store owns the transactional mechanics that make it safe to
//! apply under concurrent writers.

mod chain;
mod inbox;
mod search;
mod state_machine;

pub use chain::ChainResult;
pub use inbox::InboxItem;
pub use state_machine::{Ledger, PutReceiptOutcome};

use rg_validate::ValidateLimits;

/// Tunables for one [`Ledger`] instance. Construction is the
/// caller's job — `rg-daemon` builds one of these from `rg_config::Config`
/// at startup; this crate has no opinion on where the numbers come from.
#[derive(Debug, Clone, Copy)]
pub struct LedgerOptions {
    /// Body-size limit enforced by `rg-validate`.
    pub validate_limits: ValidateLimits,
    /// Cap on [`Ledger::chain`]'s traversal depth.
    pub receipt_chain_max_depth: usize,
    /// Page size [`Ledger::search`] uses when the caller passes a
    /// non-positive `limit`.
    pub search_default_limit: i64,
    /// Upper bound [`Ledger::search`] clamps `limit` to.
    pub search_max_limit: i64,
    /// If `true`, [`Ledger::put_receipt`] rejects a receipt whose
    /// `caused_by_receipt_id` points at a receipt that does not exist.
    /// Off by default, since a dangling `caused_by_receipt_id` is tolerated
    /// as an informational back-pointer.
    pub enforce_cause_exists: bool,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            validate_limits: ValidateLimits::default(),
            receipt_chain_max_depth: 2048,
            search_default_limit: 50,
            search_max_limit: 500,
            enforce_cause_exists: false,
        }
    }
}
