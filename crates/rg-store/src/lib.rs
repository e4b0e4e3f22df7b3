// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
#![warn(missing_docs)]

//! rg-store
//!
//! Storage backends for the ReceiptGate ledger. One async
//! trait, [`LedgerStore`], with three implementations: [`memory::MemoryStore`]
//! (always available, used by every backend-agnostic test), `sqlite::SqliteStore`
//! (feature `sqlite`), and `postgres::PostgresStore` (feature `postgres`).
//!
//! The trait intentionally stops short of exposing the obligation state
//! machine's phase-invariant rules (that's `rg-ledger`'s job): [`LedgerStore::put_receipt`]
//! takes the rule check as a caller-supplied closure and is responsible only
//! for the parts that are genuinely store-specific — the receipt_id replay/
//! collision check, assembling an [`ObligationSnapshot`] for the caller's
//! closure to judge, and running both under whatever concurrency discipline
//! the backend uses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rg_core::{Phase, Receipt, RgError};
use std::collections::BTreeMap;

/// In-memory backend. Always compiled; the default for tests and for
/// deployments that don't need durability across restarts.
pub mod memory;

#[cfg(feature = "sqlite")]
/// SQLite backend (feature `sqlite`).
pub mod sqlite;

#[cfg(feature = "postgres")]
/// Postgres backend (feature `postgres`).
pub mod postgres;

#[cfg(any(feature = "sqlite", feature = "postgres"))]
mod shared;

/// Failures from a storage backend that are not part of the ledger's own
/// business rules: connection loss, serialization failures, driver errors.
/// Always surfaces to callers as [`RgError::Internal`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An opaque backend failure. The message is safe to log but is not
    /// shown to API callers.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for RgError {
    fn from(err: StoreError) -> Self {
        RgError::Internal(err.to_string())
    }
}

/// Search criteria for [`LedgerStore::search`].
/// Every field is an equality filter except `created_at_from`/`created_at_to`
/// (range) and `query` (substring match against the serialized `body`).
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Exact `receipt_id` match.
    pub receipt_id: Option<String>,
    /// Exact `obligation_id` match.
    pub obligation_id: Option<String>,
    /// Exact `phase` match.
    pub phase: Option<Phase>,
    /// Exact `recipient` match.
    pub recipient: Option<String>,
    /// Exact `created_by` match.
    pub created_by: Option<String>,
    /// Exact `principal` match.
    pub principal: Option<String>,
    /// Exact `caused_by_receipt_id` match.
    pub caused_by_receipt_id: Option<String>,
    /// Exact `task_ref.task_id` match.
    pub task_id: Option<String>,
    /// Exact `plan_ref.plan_id` match (plan_ref is free-form; this looks for
    /// a `plan_id` key inside it).
    pub plan_id: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_at_from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub created_at_to: Option<DateTime<Utc>>,
    /// Case-insensitive substring match against the serialized `body`.
    pub query: Option<String>,
    /// Maximum rows to return. Callers (`rg-ledger`) are responsible for
    /// clamping this to the configured `search_max_limit`.
    pub limit: i64,
    /// Rows to skip, for pagination.
    pub offset: i64,
}

/// Aggregate counts over the whole ledger.
#[derive(Debug, Clone)]
pub struct StatsSummary {
    /// Total number of stored receipts.
    pub total_receipts: u64,
    /// Count of receipts per phase, keyed by wire name (`"accepted"`, ...).
    pub by_phase: BTreeMap<String, u64>,
    /// Up to 10 recipients with the most receipts, most first.
    pub top_recipients: Vec<(String, u64)>,
}

/// Store-provided state about an obligation, assembled while the backend
/// holds its concurrency-control lock, for the caller's phase-invariant
/// check to judge.
#[derive(Debug, Clone, Default)]
pub struct ObligationSnapshot {
    /// The receipt that opened this obligation: either its own `accepted`
    /// receipt, or — if this obligation was itself born from an escalation —
    /// the `escalate` receipt whose `child_obligation_id` equals it. Used by
    /// the `complete`/`cancel` checks, which accept either kind of opening.
    pub opening: Option<Receipt>,
    /// The obligation's terminal receipt (`complete`, `escalate`, or
    /// `cancel`), if one already exists.
    pub terminal: Option<Receipt>,
    /// Only populated when the incoming receipt is an `escalate`: the
    /// specific `accepted`-phase receipt for `escalation.parent_obligation_id`.
    /// Resolved by `escalation.parent_receipt_id` when the client supplied
    /// one, otherwise by `receipt.obligation_id` alone.
    pub accepted_parent: Option<Receipt>,
    /// Only populated when the incoming receipt is an `escalate`: the
    /// `receipt_id` of any existing receipt that already uses
    /// `escalation.child_obligation_id`, either as its own `obligation_id` or
    /// as another escalation's own child obligation.
    pub child_conflict: Option<String>,
}

/// The result of [`LedgerStore::put_receipt`]: every case the write path can
/// land in, including the ones that are not storage failures at all.
#[derive(Debug)]
pub enum PutOutcome {
    /// No row existed for this `receipt_id`; the phase-invariant check
    /// passed and the receipt was inserted as given (with `stored_at`,
    /// `tenant_id`, and `created_at` filled in if the receipt didn't carry
    /// its own).
    Inserted(Receipt),
    /// A row already existed for this `receipt_id` with an identical
    /// canonical hash: an idempotent replay of a prior write.
    Replay(Receipt),
    /// A row already existed for this `receipt_id` with a *different*
    /// canonical hash: a genuine collision.
    Collision {
        /// The id that collided.
        receipt_id: String,
    },
    /// The caller-supplied phase-invariant check rejected the write. The backend rolled back whatever it had started.
    Rejected(RgError),
}

/// A phase-invariant check injected by `rg-ledger` into [`LedgerStore::put_receipt`].
/// Pure and synchronous: it only looks at the incoming receipt and the
/// snapshot the store handed it.
pub type PhaseCheck<'a> = dyn Fn(&Receipt, &ObligationSnapshot) -> Result<(), RgError> + Send + Sync + 'a;

/// Ledger storage contract. Every method is scoped to a
/// `tenant_id` — no query ever crosses a tenant boundary.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Fetch a single receipt by id, or `None` if it does not exist for this
    /// tenant.
    async fn get(&self, tenant_id: &str, receipt_id: &str) -> Result<Option<Receipt>, StoreError>;

    /// All receipts for an obligation, in the order they were stored.
    async fn list_by_obligation(
        &self,
        tenant_id: &str,
        obligation_id: &str,
    ) -> Result<Vec<Receipt>, StoreError>;

    /// All receipts of a given phase addressed to `recipient`, most recent
    /// first. Used to build the inbox's `accepted` side.
    async fn list_by_recipient_phase(
        &self,
        tenant_id: &str,
        recipient: &str,
        phase: Phase,
    ) -> Result<Vec<Receipt>, StoreError>;

    /// The `escalate` receipt, if any, whose `body.escalation.child_obligation_id`
    /// equals `child_obligation_id`. Used both to detect escalation-child
    /// collisions and to find the opening event of an escalation-born
    /// obligation.
    async fn find_escalation_by_child(
        &self,
        tenant_id: &str,
        child_obligation_id: &str,
    ) -> Result<Option<Receipt>, StoreError>;

    /// All `escalate` receipts addressed `to` a recipient. Used to build the
    /// inbox's escalation side.
    async fn list_escalations_by_recipient(
        &self,
        tenant_id: &str,
        recipient: &str,
    ) -> Result<Vec<Receipt>, StoreError>;

    /// Filtered, paginated search. Returns the matching
    /// page plus the total number of matches.
    async fn search(
        &self,
        tenant_id: &str,
        filter: &SearchFilter,
    ) -> Result<(Vec<Receipt>, u64), StoreError>;

    /// Ledger-wide counters.
    async fn stats(&self, tenant_id: &str) -> Result<StatsSummary, StoreError>;

    /// Assemble an [`ObligationSnapshot`] for `obligation_id` outside of any
    /// lock. Exposed for read-only callers (e.g. a future admin surface);
    /// [`Self::put_receipt`] assembles its own snapshot while holding the
    /// write lock instead of calling this.
    async fn snapshot_for_obligation(
        &self,
        tenant_id: &str,
        obligation_id: &str,
    ) -> Result<ObligationSnapshot, StoreError>;

    /// The idempotent write path: under whatever
    /// concurrency discipline the backend uses for `receipt.obligation_id`
    /// (and, for `escalate`, also `body.escalation.child_obligation_id`),
    /// check for an existing row, assemble a snapshot, run `check` against
    /// it, and insert.
    ///
    /// `canonical_hash` must already be computed; this method
    /// does not canonicalize.
    async fn put_receipt(
        &self,
        tenant_id: &str,
        receipt: Receipt,
        canonical_hash: String,
        check: &PhaseCheck<'_>,
    ) -> Result<PutOutcome, StoreError>;
}

/// Lock keys a `put_receipt` call needs held for `receipt`, in a fixed sort
/// order so two concurrent writers always acquire shared keys in the same
/// sequence.
#[must_use]
pub fn lock_keys(tenant_id: &str, receipt: &Receipt) -> Vec<String> {
    let mut keys = vec![format!("{tenant_id}:{}", receipt.obligation_id)];
    if let Some(escalation) = receipt.body.escalation() {
        let child_key = format!("{tenant_id}:{}", escalation.child_obligation_id);
        if !keys.contains(&child_key) {
            keys.push(child_key);
        }
    }
    keys.sort();
    keys
}

/// Whether a receipt is the opening event for `obligation_id`: either its
/// own `accepted` receipt, or an `escalate` receipt whose child obligation
/// is `obligation_id`.
#[must_use]
pub fn is_opening_event_for(receipt: &Receipt, obligation_id: &str) -> bool {
    match receipt.phase() {
        Phase::Accepted => receipt.obligation_id == obligation_id,
        Phase::Escalate => receipt
            .body
            .escalation()
            .is_some_and(|e| e.child_obligation_id == obligation_id),
        _ => false,
    }
}
