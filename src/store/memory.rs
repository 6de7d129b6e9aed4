// ABOUTME: In-memory EntityStore used for the ephemeral single-writer mode
// ABOUTME: Also backs the reconciliation tests; mimics commit/pull/push semantics

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use super::{EntityId, EntityProps, EntityStore, RecordKey, TrackedRecord};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Default)]
struct Snapshot {
    next_id: EntityId,
    entities: HashMap<EntityId, EntityProps>,
    links: Vec<(EntityId, EntityId)>,
    records: HashMap<(EntityId, RecordKey), TrackedRecord>,
    scopes: HashSet<EntityId>,
    configs: HashMap<String, chrono::DateTime<chrono::Utc>>,
}

/// In-memory hierarchical entity store.
///
/// Holds one committed snapshot alongside the working copy so that
/// `save`/`discard` behave like the real store's local transaction
/// boundary. `pull`/`push` are counters only; there is no remote history
/// behind an ephemeral store. Tests can inject push contention to exercise
/// the runner's resync path.
pub struct MemoryStore {
    root: EntityId,
    working: Snapshot,
    committed: Snapshot,
    commits: Vec<String>,
    pulls: usize,
    pushes: usize,
    push_contention_budget: u32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut entities = HashMap::new();
        let root: EntityId = 1;
        entities.insert(
            root,
            EntityProps {
                parent: None,
                code: "root".to_string(),
                name: "Repository root".to_string(),
                kind: "root".to_string(),
                attrs: serde_json::Value::Null,
            },
        );
        let snapshot = Snapshot {
            next_id: 2,
            entities,
            ..Snapshot::default()
        };
        Self {
            root,
            working: snapshot.clone(),
            committed: snapshot,
            commits: Vec::new(),
            pulls: 0,
            pushes: 0,
            push_contention_budget: 0,
        }
    }

    /// Record a non-hierarchical (link-table) relationship `from -> to`.
    pub fn add_link(&mut self, from: EntityId, to: EntityId) {
        self.working.links.push((from, to));
    }

    pub fn entity_count(&self) -> usize {
        self.working.entities.len()
    }

    pub fn child_count(&self, parent: EntityId) -> usize {
        self.working
            .entities
            .values()
            .filter(|p| p.parent == Some(parent))
            .count()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    pub fn pull_count(&self) -> usize {
        self.pulls
    }

    pub fn push_count(&self) -> usize {
        self.pushes
    }

    /// Make the next `n` pushes fail with contention.
    pub fn set_push_contention(&mut self, n: u32) {
        self.push_contention_budget = n;
    }

    fn has_children(&self, id: EntityId) -> bool {
        self.working
            .entities
            .values()
            .any(|p| p.parent == Some(id))
    }

    fn has_incoming_link(&self, id: EntityId) -> bool {
        self.working
            .links
            .iter()
            .any(|(from, to)| *to == id && self.working.entities.contains_key(from))
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    fn root(&self) -> EntityId {
        self.root
    }

    async fn insert(&mut self, props: EntityProps) -> Result<EntityId> {
        let parent = props
            .parent
            .ok_or_else(|| SyncError::usage("inserted entities must have a parent"))?;
        if !self.working.entities.contains_key(&parent) {
            return Err(SyncError::external(format!(
                "parent entity {parent} does not exist"
            )));
        }
        let id = self.working.next_id;
        self.working.next_id += 1;
        self.working.entities.insert(id, props);
        Ok(id)
    }

    async fn update(&mut self, id: EntityId, props: EntityProps) -> Result<()> {
        match self.working.entities.get_mut(&id) {
            Some(existing) => {
                *existing = props;
                Ok(())
            }
            None => Err(SyncError::external(format!("entity {id} does not exist"))),
        }
    }

    async fn delete(&mut self, id: EntityId) -> Result<()> {
        if !self.working.entities.contains_key(&id) {
            return Err(SyncError::external(format!("entity {id} does not exist")));
        }
        if self.has_children(id) || self.has_incoming_link(id) {
            return Err(SyncError::ConstraintViolation { entity: id });
        }
        self.working.entities.remove(&id);
        self.working.links.retain(|(from, _)| *from != id);
        self.working.scopes.remove(&id);
        Ok(())
    }

    async fn contains(&self, id: EntityId) -> Result<bool> {
        Ok(self.working.entities.contains_key(&id))
    }

    async fn parent_of(&self, id: EntityId) -> Result<Option<EntityId>> {
        self.working
            .entities
            .get(&id)
            .map(|p| p.parent)
            .ok_or_else(|| SyncError::external(format!("entity {id} does not exist")))
    }

    async fn query_id_by_code(&self, parent: EntityId, code: &str) -> Result<Option<EntityId>> {
        Ok(self
            .working
            .entities
            .iter()
            .find(|(_, p)| p.parent == Some(parent) && p.code == code)
            .map(|(id, _)| *id))
    }

    async fn upsert_record(&mut self, record: TrackedRecord) -> Result<()> {
        self.working
            .records
            .insert((record.scope_id, record.key()), record);
        Ok(())
    }

    async fn delete_record(&mut self, scope_id: EntityId, key: &RecordKey) -> Result<()> {
        self.working.records.remove(&(scope_id, key.clone()));
        Ok(())
    }

    async fn records_in_scope(&self, scope_id: EntityId) -> Result<Vec<TrackedRecord>> {
        Ok(self
            .working
            .records
            .iter()
            .filter(|((scope, _), _)| *scope == scope_id)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn query_records_by_source(
        &self,
        scope_id: EntityId,
        kind: &str,
        source_id: &str,
    ) -> Result<Vec<TrackedRecord>> {
        let key = RecordKey::new(kind, source_id);
        Ok(self
            .working
            .records
            .get(&(scope_id, key))
            .cloned()
            .into_iter()
            .collect())
    }

    async fn register_scope(&mut self, root: EntityId) -> Result<()> {
        if !self.working.entities.contains_key(&root) {
            return Err(SyncError::external(format!(
                "scope root {root} does not exist"
            )));
        }
        self.working.scopes.insert(root);
        Ok(())
    }

    async fn scope_roots(&self) -> Result<Vec<EntityId>> {
        Ok(self.working.scopes.iter().copied().collect())
    }

    async fn get_sync_config(
        &self,
        job: &str,
    ) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        Ok(self.working.configs.get(job).copied())
    }

    async fn put_sync_config(
        &mut self,
        job: &str,
        last_run: chrono::DateTime<chrono::Utc>,
    ) -> Result<()> {
        self.working.configs.insert(job.to_string(), last_run);
        Ok(())
    }

    async fn pull(&mut self) -> Result<()> {
        self.pulls += 1;
        Ok(())
    }

    async fn save(&mut self, comment: &str) -> Result<()> {
        self.committed = self.working.clone();
        self.commits.push(comment.to_string());
        tracing::debug!("committed: {comment}");
        Ok(())
    }

    async fn push(&mut self, comment: &str) -> Result<()> {
        if self.push_contention_budget > 0 {
            self.push_contention_budget -= 1;
            return Err(SyncError::contention(format!("push:{comment}")));
        }
        self.pushes += 1;
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        self.working = self.committed.clone();
        Ok(())
    }
}
