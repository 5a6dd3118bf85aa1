//! Map source groups onto target groups by name.
//!
//! The target's group list is fetched once and cached; groups created (or,
//! in dry-run, pretended) during the run are added to the cache, so mapping
//! the same name twice never creates two groups.

use crate::error::SessionError;
use crate::models::Group;
use crate::session::NodeSession;

pub struct GroupMapper<'a> {
    target: &'a dyn NodeSession,
    dry_run: bool,
    known: Option<Vec<Group>>,
}

impl<'a> GroupMapper<'a> {
    pub fn new(target: &'a dyn NodeSession, dry_run: bool) -> Self {
        Self {
            target,
            dry_run,
            known: None,
        }
    }

    /// Fetch the target's groups now rather than on first use.
    pub async fn prime(&mut self) -> Result<(), SessionError> {
        if self.known.is_none() {
            self.known = Some(self.target.list_groups().await?);
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&Group> {
        self.known.as_ref()?.iter().find(|g| g.name == name)
    }

    /// Return the target group named like `source`, creating it if needed.
    ///
    /// In dry-run mode a missing group comes back
    /// [unassigned](Group::unassigned) and nothing is created.
    pub async fn map_group(&mut self, source: &Group) -> Result<Group, SessionError> {
        self.prime().await?;
        if let Some(existing) = self.find(&source.name) {
            return Ok(existing.clone());
        }

        let group = if self.dry_run {
            tracing::info!(group = %source.name, "[dry-run] would create group on target");
            Group::unassigned(&source.name)
        } else {
            self.create(&source.name).await?
        };

        self.known.get_or_insert_with(Vec::new).push(group.clone());
        Ok(group)
    }

    async fn create(&self, name: &str) -> Result<Group, SessionError> {
        let created = self.target.create_group(name).await?;
        if created.is_assigned() {
            return Ok(created);
        }

        // Node did not echo an id back; read it from a fresh listing.
        self.target
            .list_groups()
            .await?
            .into_iter()
            .find(|g| g.name == name && g.is_assigned())
            .ok_or_else(|| {
                SessionError::Protocol(format!(
                    "group '{}' was created on {} but does not appear in its group list",
                    name,
                    self.target.host()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::memory::InMemoryNode;

    #[tokio::test]
    async fn finds_existing_group_by_name() {
        let target = InMemoryNode::new("target").with_group(5, "Family", &[]);
        let mut mapper = GroupMapper::new(&target, false);

        let mapped = mapper.map_group(&Group::new(99, "Family")).await.unwrap();
        assert_eq!(mapped, Group::new(5, "Family"));
        assert!(target.created_groups().is_empty());
    }

    #[tokio::test]
    async fn creates_exactly_once() {
        let target = InMemoryNode::new("target");
        let mut mapper = GroupMapper::new(&target, false);
        let source = Group::new(1, "Family");

        let first = mapper.map_group(&source).await.unwrap();
        let second = mapper.map_group(&source).await.unwrap();
        assert!(first.is_assigned());
        assert_eq!(first, second);
        assert_eq!(target.created_groups(), vec!["Family"]);
    }

    #[tokio::test]
    async fn dry_run_returns_unassigned_sentinel() {
        let target = InMemoryNode::new("target");
        let mut mapper = GroupMapper::new(&target, true);

        let mapped = mapper.map_group(&Group::new(1, "Work")).await.unwrap();
        assert_eq!(mapped, Group::unassigned("Work"));
        assert!(target.created_groups().is_empty());
        assert!(target.groups().is_empty());
    }

    #[tokio::test]
    async fn name_match_is_exact() {
        let target = InMemoryNode::new("target").with_group(5, "family", &[]);
        let mut mapper = GroupMapper::new(&target, false);

        let mapped = mapper.map_group(&Group::new(1, "Family")).await.unwrap();
        assert_ne!(mapped.id, Some(5));
        assert_eq!(target.created_groups(), vec!["Family"]);
    }
}
