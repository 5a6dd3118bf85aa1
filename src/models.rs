//! Core data models used throughout pod-migrate.
//!
//! These types represent the contacts, groups (aspects), and resolved
//! identities that flow between the source node, the reconciliation engine,
//! and the target node, plus the counters the engine accumulates.

use serde::{Deserialize, Serialize};

/// A person known to the source node.
///
/// Fetched once per run as part of the contact snapshot and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Contact {
    /// Federated address (`alice@pod.example`), globally unique per person.
    pub handle: String,
    /// Stable opaque identifier, unique across the federation.
    pub guid: String,
}

impl Contact {
    pub fn new(handle: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            guid: guid.into(),
        }
    }
}

/// Node-local group identifier. Never compared across nodes.
pub type GroupId = u64;

/// Node-local user identifier. `0` is the "not found" sentinel.
pub type UserId = u64;

/// A named partition of a user's contacts on one node (an "aspect").
///
/// Source and target groups are correlated by [`name`](Group::name) only.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Group {
    /// Node-assigned id. `None` means unassigned: the dry-run sentinel for a
    /// group that would be created.
    #[serde(default)]
    pub id: Option<GroupId>,
    pub name: String,
}

impl Group {
    pub fn new(id: GroupId, name: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: name.into(),
        }
    }

    /// A group that has not been created on the node.
    pub fn unassigned(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.id.is_some()
    }
}

/// Result of looking up a contact on the target node.
///
/// Recomputed on every attempt; never cached beyond one contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    pub target_user_id: UserId,
    pub guid: String,
}

impl ResolvedIdentity {
    /// The sentinel a node returns for an unknown user.
    pub fn not_found(guid: impl Into<String>) -> Self {
        Self {
            target_user_id: 0,
            guid: guid.into(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.target_user_id != 0
    }
}

/// How a user lookup addresses the person on the target node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserQuery<'a> {
    Handle(&'a str),
    Guid(&'a str),
}

/// Running tally of a migration.
///
/// Mutated only by the engine. Serializes to the mapping printed at the end
/// of a run: `{added, exists, notfound, unknownerrors, total, lookups}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationCounters {
    pub added: u64,
    #[serde(rename = "exists")]
    pub already_exists: u64,
    #[serde(rename = "notfound")]
    pub not_found: u64,
    #[serde(rename = "unknownerrors")]
    pub unknown_error: u64,
    pub total: u64,
    #[serde(rename = "lookups")]
    pub lookups_triggered: u64,
}

/// Which step of the per-contact pipeline failed to find the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotFoundStage {
    /// Identity lookup exhausted its attempt budget.
    Resolve,
    /// The target rejected the membership mutation as not found.
    Mutate,
}

/// Terminal state of one (group, contact) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ContactOutcome {
    /// Already in the ledger; no network call was made.
    Skipped,
    Added { user_id: UserId },
    AlreadyExists { user_id: UserId },
    NotFound { stage: NotFoundStage },
    UnknownError { message: String },
}

impl ContactOutcome {
    /// Whether this outcome counts as reconciled and belongs in the ledger.
    pub fn is_reconciled(&self) -> bool {
        matches!(
            self,
            ContactOutcome::Added { .. } | ContactOutcome::AlreadyExists { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ContactOutcome::Skipped => "skipped",
            ContactOutcome::Added { .. } => "added",
            ContactOutcome::AlreadyExists { .. } => "exists",
            ContactOutcome::NotFound { .. } => "notfound",
            ContactOutcome::UnknownError { .. } => "unknownerror",
        }
    }
}

impl MigrationCounters {
    /// Fold one contact outcome into the tally. `Skipped` touches nothing.
    pub fn record(&mut self, outcome: &ContactOutcome) {
        match outcome {
            ContactOutcome::Skipped => {}
            ContactOutcome::Added { .. } => self.added += 1,
            ContactOutcome::AlreadyExists { .. } => self.already_exists += 1,
            ContactOutcome::NotFound { .. } => self.not_found += 1,
            ContactOutcome::UnknownError { .. } => self.unknown_error += 1,
        }
    }
}
