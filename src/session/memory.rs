//! In-memory [`NodeSession`] implementation for tests.
//!
//! Holds contacts, groups, and a user directory behind `std::sync::Mutex`,
//! and records every discovery, group creation, and membership call so
//! tests can assert on what reached the node. Users can be made visible
//! only after a number of discovery requests, which models a pod that has
//! to federate a remote profile before it can be looked up.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::NodeSession;
use crate::error::{MembershipError, SessionError};
use crate::models::{Contact, Group, GroupId, ResolvedIdentity, UserId, UserQuery};

struct DirectoryEntry {
    handle: String,
    guid: String,
    id: UserId,
    /// Whether a handle search finds this person (guid lookup always does).
    handle_indexed: bool,
    /// Discovery requests for the handle needed before the person resolves.
    visible_after: u32,
}

#[derive(Default)]
struct NodeState {
    logged_in: bool,
    logouts: u32,
    contacts: Vec<Contact>,
    groups: Vec<Group>,
    members: HashMap<GroupId, HashSet<String>>,
    next_group_id: GroupId,
    directory: Vec<DirectoryEntry>,
    discoveries: HashMap<String, u32>,
    discovery_log: Vec<String>,
    created_groups: Vec<String>,
    memberships: HashSet<(GroupId, UserId)>,
    membership_calls: Vec<(GroupId, UserId)>,
    membership_failures: HashMap<UserId, MembershipError>,
    failing_member_lists: HashSet<GroupId>,
    fail_login: bool,
    login_delay: Option<Duration>,
}

/// Scripted node for tests.
///
/// Configure with the `with_*` builders, hand out as `&dyn NodeSession`,
/// then inspect with the accessor methods.
pub struct InMemoryNode {
    host: String,
    state: Mutex<NodeState>,
}

impl InMemoryNode {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            state: Mutex::new(NodeState {
                next_group_id: 1,
                ..NodeState::default()
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, NodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_contact(self, handle: &str, guid: &str) -> Self {
        self.state().contacts.push(Contact::new(handle, guid));
        self
    }

    /// Add a group with the given member guids.
    pub fn with_group(self, id: GroupId, name: &str, members: &[&str]) -> Self {
        {
            let mut state = self.state();
            state.groups.push(Group::new(id, name));
            state
                .members
                .insert(id, members.iter().map(|g| g.to_string()).collect());
            state.next_group_id = state.next_group_id.max(id + 1);
        }
        self
    }

    /// A person that resolves immediately by handle.
    pub fn with_user(self, handle: &str, guid: &str, id: UserId) -> Self {
        self.push_user(handle, guid, id, true, 0)
    }

    /// A person the handle search misses but the guid lookup finds.
    pub fn with_user_by_guid_only(self, handle: &str, guid: &str, id: UserId) -> Self {
        self.push_user(handle, guid, id, false, 0)
    }

    /// A person that resolves only after `discoveries` discovery requests.
    pub fn with_user_after_discoveries(
        self,
        handle: &str,
        guid: &str,
        id: UserId,
        discoveries: u32,
    ) -> Self {
        self.push_user(handle, guid, id, true, discoveries)
    }

    fn push_user(
        self,
        handle: &str,
        guid: &str,
        id: UserId,
        handle_indexed: bool,
        visible_after: u32,
    ) -> Self {
        self.state().directory.push(DirectoryEntry {
            handle: handle.to_string(),
            guid: guid.to_string(),
            id,
            handle_indexed,
            visible_after,
        });
        self
    }

    /// Make every membership mutation for `user_id` fail with `error`.
    pub fn with_membership_error(self, user_id: UserId, error: MembershipError) -> Self {
        self.state().membership_failures.insert(user_id, error);
        self
    }

    /// Record an existing membership, so adding it again conflicts.
    pub fn with_membership(self, group_id: GroupId, user_id: UserId) -> Self {
        self.state().memberships.insert((group_id, user_id));
        self
    }

    pub fn with_failing_member_list(self, group_id: GroupId) -> Self {
        self.state().failing_member_lists.insert(group_id);
        self
    }

    pub fn with_login_failure(self) -> Self {
        self.state().fail_login = true;
        self
    }

    /// Make `login` take `delay` before it answers.
    pub fn with_login_delay(self, delay: Duration) -> Self {
        self.state().login_delay = Some(delay);
        self
    }

    pub fn is_logged_in(&self) -> bool {
        self.state().logged_in
    }

    pub fn logout_count(&self) -> u32 {
        self.state().logouts
    }

    /// Handles passed to `trigger_discovery`, in call order.
    pub fn discovery_requests(&self) -> Vec<String> {
        self.state().discovery_log.clone()
    }

    /// Names passed to `create_group`, in call order.
    pub fn created_groups(&self) -> Vec<String> {
        self.state().created_groups.clone()
    }

    /// Every `add_membership` call, successful or not.
    pub fn membership_calls(&self) -> Vec<(GroupId, UserId)> {
        self.state().membership_calls.clone()
    }

    pub fn groups(&self) -> Vec<Group> {
        self.state().groups.clone()
    }

    pub fn has_membership(&self, group_id: GroupId, user_id: UserId) -> bool {
        self.state().memberships.contains(&(group_id, user_id))
    }
}

#[async_trait]
impl NodeSession for InMemoryNode {
    fn host(&self) -> &str {
        &self.host
    }

    async fn login(&self) -> Result<(), SessionError> {
        let delay = self.state().login_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if state.fail_login {
            return Err(SessionError::Auth(format!("{} refused credentials", self.host)));
        }
        state.logged_in = true;
        Ok(())
    }

    async fn logout(&self) -> Result<(), SessionError> {
        let mut state = self.state();
        state.logged_in = false;
        state.logouts += 1;
        Ok(())
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>, SessionError> {
        Ok(self.state().contacts.clone())
    }

    async fn list_groups(&self) -> Result<Vec<Group>, SessionError> {
        Ok(self.state().groups.clone())
    }

    async fn list_group_members(&self, group_id: GroupId) -> Result<HashSet<String>, SessionError> {
        let state = self.state();
        if state.failing_member_lists.contains(&group_id) {
            return Err(SessionError::Status {
                status: 503,
                body: "members unavailable".to_string(),
            });
        }
        Ok(state.members.get(&group_id).cloned().unwrap_or_default())
    }

    async fn create_group(&self, name: &str) -> Result<Group, SessionError> {
        let mut state = self.state();
        let id = state.next_group_id;
        state.next_group_id += 1;
        let group = Group::new(id, name);
        state.groups.push(group.clone());
        state.members.insert(id, HashSet::new());
        state.created_groups.push(name.to_string());
        Ok(group)
    }

    async fn lookup_user(&self, query: UserQuery<'_>) -> Result<ResolvedIdentity, SessionError> {
        let state = self.state();
        let visible = |entry: &DirectoryEntry| {
            state.discoveries.get(&entry.handle).copied().unwrap_or(0) >= entry.visible_after
        };
        let hit = state.directory.iter().find(|entry| {
            let matches = match query {
                UserQuery::Handle(h) => entry.handle_indexed && entry.handle == h,
                UserQuery::Guid(g) => entry.guid == g,
            };
            matches && visible(entry)
        });
        Ok(match (hit, query) {
            (Some(entry), _) => ResolvedIdentity {
                target_user_id: entry.id,
                guid: entry.guid.clone(),
            },
            (None, UserQuery::Guid(g)) => ResolvedIdentity::not_found(g),
            (None, UserQuery::Handle(_)) => ResolvedIdentity::not_found(""),
        })
    }

    async fn trigger_discovery(&self, handle: &str) -> Result<(), SessionError> {
        let mut state = self.state();
        *state.discoveries.entry(handle.to_string()).or_insert(0) += 1;
        state.discovery_log.push(handle.to_string());
        Ok(())
    }

    async fn add_membership(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<(), MembershipError> {
        let mut state = self.state();
        state.membership_calls.push((group_id, user_id));
        if let Some(err) = state.membership_failures.get(&user_id) {
            return Err(err.clone());
        }
        if !state.memberships.insert((group_id, user_id)) {
            return Err(MembershipError::Conflict);
        }
        Ok(())
    }
}
