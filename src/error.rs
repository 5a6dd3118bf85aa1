//! Typed errors at the collaborator and engine seams.
//!
//! Application-level code (CLI, orchestration, config) uses `anyhow`; these
//! enums exist where callers need to branch on the failure kind.

use thiserror::Error;

/// Failure of a [`NodeSession`](crate::session::NodeSession) call.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Connection, TLS, timeout, or body decoding failure.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The node answered with a non-success HTTP status.
    #[error("node returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The node's response could not be interpreted.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Login was refused or the session is not authenticated.
    #[error("authentication failed: {0}")]
    Auth(String),
}

impl SessionError {
    /// Whether retrying the same idempotent request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SessionError::Transport(_) => true,
            SessionError::Status { status, .. } => *status == 429 || *status >= 500,
            SessionError::Protocol(_) | SessionError::Auth(_) => false,
        }
    }
}

/// Classified failure of a group-membership mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    /// The user is already a member of the group.
    #[error("membership already present")]
    Conflict,

    /// The node no longer knows the user (or group).
    #[error("user or group not found on target")]
    NotFound,

    #[error("{0}")]
    Other(String),
}

/// Errors that cross the reconciliation engine boundary.
///
/// Everything per-contact is absorbed into counters; only these escape.
#[derive(Error, Debug)]
pub enum EngineError {
    /// External stop signal observed.
    #[error("migration cancelled by user")]
    Cancelled,

    /// Listing the source snapshot or target groups failed before any
    /// reconciliation began.
    #[error("setup failed: {0}")]
    Setup(#[source] SessionError),
}
