//! In-memory node store implementing [`NodeRepository`] and [`AccessDecision`].
//!
//! Nodes are kept in insertion order, which is also the stable order used
//! by [`NodeRepository::list_uuids`]. Permission checks read the same maps
//! the projector turns into permission tokens, so the two agree unless a
//! test changes permissions without reindexing.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::collaborators::{AccessDecision, NodeRepository, TagField};
use crate::error::{SearchError, SearchResult};
use crate::models::{ContentSource, IndexableNode, NodeKind, Permission, Principal};
use crate::read_filter::SecurityRoles;

#[derive(Default)]
struct State {
    order: Vec<String>,
    nodes: HashMap<String, IndexableNode>,
    content: HashMap<String, ContentSource>,
    poisoned: HashSet<String>,
}

pub struct InMemoryNodes {
    security: SecurityRoles,
    state: RwLock<State>,
}

impl InMemoryNodes {
    pub fn new(security: SecurityRoles) -> Self {
        Self {
            security,
            state: RwLock::new(State::default()),
        }
    }

    /// Insert or replace a node. Its `content`, if set, is stored separately
    /// and served by `load_content`.
    pub fn insert(&self, mut node: IndexableNode) {
        let mut state = self.state.write();
        if let Some(content) = node.content.take() {
            state.content.insert(node.uuid.clone(), content);
        }
        if !state.nodes.contains_key(&node.uuid) {
            state.order.push(node.uuid.clone());
        }
        state.nodes.insert(node.uuid.clone(), node);
    }

    pub fn remove(&self, uuid: &str) -> Option<IndexableNode> {
        let mut state = self.state.write();
        state.order.retain(|u| u != uuid);
        state.content.remove(uuid);
        state.nodes.remove(uuid)
    }

    /// Replace a user's permission mask on an existing node.
    pub fn set_user_permission(&self, uuid: &str, user: &str, mask: u32) -> SearchResult<()> {
        let mut state = self.state.write();
        let node = state
            .nodes
            .get_mut(uuid)
            .ok_or_else(|| SearchError::NotFound(uuid.to_string()))?;
        if mask == 0 {
            node.user_permissions.remove(user);
        } else {
            node.user_permissions.insert(user.to_string(), mask);
        }
        Ok(())
    }

    /// Make every access check on `uuid` fail with a data-access error.
    pub fn poison_access(&self, uuid: &str) {
        self.state.write().poisoned.insert(uuid.to_string());
    }

    pub fn len(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryNodes {
    fn default() -> Self {
        Self::new(SecurityRoles::default())
    }
}

#[async_trait]
impl NodeRepository for InMemoryNodes {
    async fn get(&self, uuid: &str) -> SearchResult<Option<IndexableNode>> {
        Ok(self.state.read().nodes.get(uuid).cloned())
    }

    async fn load_content(&self, uuid: &str) -> SearchResult<Option<ContentSource>> {
        Ok(self.state.read().content.get(uuid).cloned())
    }

    async fn count(&self, kind: NodeKind) -> SearchResult<u64> {
        let state = self.state.read();
        Ok(state.nodes.values().filter(|n| n.kind == kind).count() as u64)
    }

    async fn list_uuids(&self, kind: NodeKind, offset: u64, limit: u64) -> SearchResult<Vec<String>> {
        let state = self.state.read();
        Ok(state
            .order
            .iter()
            .filter(|u| state.nodes.get(*u).map(|n| n.kind) == Some(kind))
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(usize::try_from(limit).unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn child_folders(&self, parent: &str) -> SearchResult<Vec<IndexableNode>> {
        let state = self.state.read();
        Ok(state
            .order
            .iter()
            .filter_map(|u| state.nodes.get(u))
            .filter(|n| n.kind == NodeKind::Folder && n.parent.as_deref() == Some(parent))
            .cloned()
            .collect())
    }

    async fn tagged(&self, field: TagField, value: &str) -> SearchResult<Vec<String>> {
        let state = self.state.read();
        Ok(state
            .order
            .iter()
            .filter_map(|u| state.nodes.get(u))
            .filter(|n| match field {
                TagField::Category => n.categories.contains(value),
                TagField::Keyword => n.keywords.contains(value),
            })
            .map(|n| n.uuid.clone())
            .collect())
    }
}

#[async_trait]
impl AccessDecision for InMemoryNodes {
    async fn is_granted(
        &self,
        principal: &Principal,
        node: &IndexableNode,
        permission: Permission,
    ) -> SearchResult<bool> {
        let state = self.state.read();
        if state.poisoned.contains(&node.uuid) {
            return Err(SearchError::DataAccess(format!(
                "permission lookup failed for {}",
                node.uuid
            )));
        }
        if self.security.is_superuser(principal) {
            return Ok(true);
        }
        // The stored node is authoritative; the caller's copy may be stale.
        let current = state.nodes.get(&node.uuid).unwrap_or(node);
        let by_user = current
            .user_permissions
            .get(&principal.user)
            .is_some_and(|mask| permission.is_set(*mask));
        let by_role = principal.roles.iter().any(|role| {
            current
                .role_permissions
                .get(role)
                .is_some_and(|mask| permission.is_set(*mask))
        });
        Ok(by_user || by_role)
    }
}
