// SPDX-License-Identifier: MIT OR Apache-2.0

//! The canonical receipt envelope.
//!
//! There is exactly one internal representation: [`Receipt`], a struct of
//! shared fields plus a `#[serde(flatten)]` [`ReceiptBody`] tagged on
//! `phase`. Every transport (REST, JSON-RPC) converts into this shape at
//! its own boundary; nothing downstream of it sees a second envelope.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// The kind of event a [`Receipt`] records in an obligation's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Opens an obligation: a recipient has accepted the task.
    Accepted,
    /// Terminates an obligation successfully.
    Complete,
    /// Terminates the parent obligation and opens a child obligation.
    Escalate,
    /// Terminates an obligation without completion.
    Cancel,
}

impl Phase {
    /// All four phases, accepted first through the two ways an obligation can close.
    pub const ALL: [Phase; 4] = [Phase::Accepted, Phase::Complete, Phase::Escalate, Phase::Cancel];

    /// `true` for `complete`, `escalate`, and `cancel`. `escalate` is terminal for its *parent*
    /// obligation while opening a distinct child obligation.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Escalate | Phase::Cancel)
    }

    /// Wire representation, e.g. `"accepted"`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Accepted => "accepted",
            Phase::Complete => "complete",
            Phase::Escalate => "escalate",
            Phase::Cancel => "cancel",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Phase::Accepted),
            "complete" => Ok(Phase::Complete),
            "escalate" => Ok(Phase::Escalate),
            "cancel" => Ok(Phase::Cancel),
            other => Err(format!("unknown phase '{other}'")),
        }
    }
}

/// Reference to the task a receipt's obligation is attached to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskRef {
    /// Opaque identifier of the underlying task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Name of the queue the task was dispatched from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Lease duration granted to the recipient, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_seconds: Option<u64>,
}

/// Reference to an artifact produced or consumed by a receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRef {
    /// Artifact kind, e.g. `"binary"`, `"dataset"`, `"text"`, `"link"`.
    pub kind: String,
    /// Content digest. Required when `kind` is `binary` or `dataset`
    ///.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Location of the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Extra, free-form keys carried verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ArtifactRef {
    /// Artifact kinds that must carry a [`Self::digest`].
    pub const DIGEST_REQUIRED_KINDS: [&'static str; 2] = ["binary", "dataset"];

    /// Whether this artifact's kind requires a digest.
    #[must_use]
    pub fn requires_digest(&self) -> bool {
        Self::DIGEST_REQUIRED_KINDS.contains(&self.kind.as_str())
    }
}

/// Details specific to an `escalate` receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EscalationDetail {
    /// Receipt id that triggered the escalation, if tracked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_receipt_id: Option<String>,
    /// The obligation being escalated away from. Must equal the receipt's
    /// own `obligation_id`.
    pub parent_obligation_id: String,
    /// Newly minted obligation the escalation opens.
    pub child_obligation_id: String,
    /// Party the escalation originates from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Party the escalation is routed to. Must equal the receipt's own
    /// `recipient`.
    pub to: String,
    /// Human-readable reason for the escalation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Extra, free-form keys carried verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Details specific to a `cancel` receipt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CancelDetail {
    /// Human-readable reason the obligation was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Extra, free-form keys carried verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Phase-specific payload, internally tagged on `phase`.
///
/// Flattened into [`Receipt`] so `phase` appears as a top-level wire field
/// alongside the shared fields, rather than nested under a `body` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ReceiptBody {
    /// Opens an obligation.
    Accepted {
        /// Short human summary of the accepted task.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        /// Inputs handed to the recipient.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        inputs: Option<Value>,
        /// Constraints the recipient must honor.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        constraints: Option<Value>,
        /// Extra, free-form keys carried verbatim.
        #[serde(flatten)]
        extra: BTreeMap<String, Value>,
    },
    /// Terminates an obligation successfully.
    Complete {
        /// Short human summary of the outcome.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        /// Structured result payload.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        /// Extra, free-form keys carried verbatim.
        #[serde(flatten)]
        extra: BTreeMap<String, Value>,
    },
    /// Terminates the parent obligation, opens a child obligation.
    Escalate {
        /// Short human summary of why escalation was needed.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        /// Escalation routing and linkage (required).
        escalation: EscalationDetail,
        /// Extra, free-form keys carried verbatim.
        #[serde(flatten)]
        extra: BTreeMap<String, Value>,
    },
    /// Terminates an obligation without completion.
    Cancel {
        /// Short human summary of why the obligation was cancelled.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
        /// Cancellation detail (required).
        cancel: CancelDetail,
        /// Extra, free-form keys carried verbatim.
        #[serde(flatten)]
        extra: BTreeMap<String, Value>,
    },
}

impl ReceiptBody {
    /// The [`Phase`] this body belongs to.
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            ReceiptBody::Accepted { .. } => Phase::Accepted,
            ReceiptBody::Complete { .. } => Phase::Complete,
            ReceiptBody::Escalate { .. } => Phase::Escalate,
            ReceiptBody::Cancel { .. } => Phase::Cancel,
        }
    }

    /// The `escalation` sub-object, if this is an `escalate` body.
    #[must_use]
    pub fn escalation(&self) -> Option<&EscalationDetail> {
        match self {
            ReceiptBody::Escalate { escalation, .. } => Some(escalation),
            _ => None,
        }
    }
}

/// Deserializes the `"NA"` sentinel and absence as equivalent.
fn deserialize_na_as_none<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.filter(|s| s != "NA" && !s.is_empty()))
}

/// The canonical receipt envelope.
///
/// Immutable once stored. `tenant_id`, `stored_at`, and `canonical_hash` are
/// server-assigned; everything else may arrive from a client. `created_at`
/// is client-supplied *or* server-assigned — [`Receipt::created_at_is_client_supplied`]
/// tracks which, since that changes what the canonical hash covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Receipt {
    /// Externally supplied opaque identifier, unique within a tenant.
    pub receipt_id: String,
    /// Opaque identifier for the logical obligation this receipt participates in.
    pub obligation_id: String,
    /// Back-pointer to the prior receipt in the causal chain. `"NA"` and
    /// absence are equivalent at ingress.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_na_as_none"
    )]
    pub caused_by_receipt_id: Option<String>,
    /// Party that minted this receipt.
    pub created_by: String,
    /// Party this receipt is addressed to.
    pub recipient: String,
    /// Principal on whose behalf `created_by` is acting, if distinct.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,
    /// Reference to the task this obligation is attached to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,
    /// Opaque reference to the plan this obligation belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_ref: Option<Value>,
    /// Artifacts produced or consumed by this receipt.
    #[serde(default)]
    pub artifact_refs: Vec<ArtifactRef>,
    /// When the event occurred. Client-supplied, or server-assigned at
    /// insert time if omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Server-computed content hash, returned on every write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_hash: Option<String>,
    /// Server-assigned tenant isolating all queries. Never set by a client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// Server-assigned insert timestamp. Never set by a client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<DateTime<Utc>>,
    /// Phase-tagged payload.
    #[serde(flatten)]
    pub body: ReceiptBody,
}

impl Receipt {
    /// The phase this receipt belongs to.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.body.phase()
    }

    /// Whether the client supplied `created_at` on the wire, as opposed to
    /// it being assigned by the server at insert time. Determines whether
    /// `created_at` is included in the canonical hash.
    #[must_use]
    pub fn created_at_is_client_supplied(&self) -> bool {
        self.created_at.is_some()
    }
}
