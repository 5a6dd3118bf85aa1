//! Node session abstraction.
//!
//! The [`NodeSession`] trait is the narrow interface the reconciliation
//! engine uses to talk to a node: contact and group listing, user lookup,
//! and group-membership mutation. Implementations must be `Send + Sync` to
//! run on the tokio runtime.
//!
//! | Implementation | Purpose |
//! |----------------|---------|
//! | [`pod::PodSession`] | Diaspora* pod over HTTP (cookie session + CSRF token) |
//! | [`memory::InMemoryNode`] | Scripted in-memory node for tests |

pub mod memory;
pub mod pod;

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::{MembershipError, SessionError};
use crate::models::{Contact, Group, GroupId, ResolvedIdentity, UserId, UserQuery};

/// Authenticated handle to one node.
///
/// All methods take `&self`; implementations keep session state (cookies,
/// CSRF token) behind interior mutability.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`login`](NodeSession::login) | Establish the authenticated session |
/// | [`logout`](NodeSession::logout) | End the session |
/// | [`list_contacts`](NodeSession::list_contacts) | Every contact of the logged-in user |
/// | [`list_groups`](NodeSession::list_groups) | The user's groups (aspects) |
/// | [`list_group_members`](NodeSession::list_group_members) | Guids of one group's members |
/// | [`create_group`](NodeSession::create_group) | Create a named group |
/// | [`lookup_user`](NodeSession::lookup_user) | Resolve a person by handle or guid |
/// | [`trigger_discovery`](NodeSession::trigger_discovery) | Ask the node to fetch a remote person |
/// | [`add_membership`](NodeSession::add_membership) | Put a user into a group |
#[async_trait]
pub trait NodeSession: Send + Sync {
    /// Host label used in log lines. Never contains credentials.
    fn host(&self) -> &str;

    async fn login(&self) -> Result<(), SessionError>;

    async fn logout(&self) -> Result<(), SessionError>;

    async fn list_contacts(&self) -> Result<Vec<Contact>, SessionError>;

    async fn list_groups(&self) -> Result<Vec<Group>, SessionError>;

    async fn list_group_members(&self, group_id: GroupId) -> Result<HashSet<String>, SessionError>;

    /// Create a group. The returned group may lack an id if the node does
    /// not echo one back.
    async fn create_group(&self, name: &str) -> Result<Group, SessionError>;

    /// Look a person up. An unknown person is `Ok` with
    /// [`ResolvedIdentity::not_found`], not an error.
    async fn lookup_user(&self, query: UserQuery<'_>) -> Result<ResolvedIdentity, SessionError>;

    /// Fire-and-forget hint asking the node to discover a remote person.
    async fn trigger_discovery(&self, handle: &str) -> Result<(), SessionError>;

    async fn add_membership(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<(), MembershipError>;
}

/// Login details for one node, parsed from `username:password@https://host.tld`.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeCredentials {
    pub username: String,
    pub password: String,
    /// Base URL without a trailing slash, e.g. `https://pod.example`.
    pub url: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid node address: {reason} (expected username:password@https://host.tld)")]
pub struct InvalidCredentials {
    reason: &'static str,
}

impl InvalidCredentials {
    fn new(reason: &'static str) -> Self {
        Self { reason }
    }
}

impl NodeCredentials {
    /// Host portion of the URL, for display.
    pub fn host(&self) -> &str {
        self.url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.url)
    }
}

impl FromStr for NodeCredentials {
    type Err = InvalidCredentials;

    /// The username ends at the first `:`, the URL starts after the last
    /// `@`, and the password is everything in between (so it may contain
    /// either character).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (username, rest) = s
            .split_once(':')
            .ok_or_else(|| InvalidCredentials::new("missing ':' after username"))?;
        let (password, url) = rest
            .rsplit_once('@')
            .ok_or_else(|| InvalidCredentials::new("missing '@' before URL"))?;

        if username.is_empty() {
            return Err(InvalidCredentials::new("empty username"));
        }
        if password.is_empty() {
            return Err(InvalidCredentials::new("empty password"));
        }
        let url = url.trim_end_matches('/');
        let host = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| InvalidCredentials::new("URL must start with http:// or https://"))?;
        if host.is_empty() {
            return Err(InvalidCredentials::new("empty host"));
        }

        Ok(Self {
            username: username.to_string(),
            password: password.to_string(),
            url: url.to_string(),
        })
    }
}

impl fmt::Debug for NodeCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("url", &self.url)
            .finish()
    }
}
