// ABOUTME: Data model and EntityStore abstraction for the hierarchical entity store
// ABOUTME: The core consumes the store through this trait; implementations live elsewhere

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;

pub use memory::MemoryStore;

/// Store-assigned entity identifier.
pub type EntityId = u64;

/// Properties of an entity in the hierarchical store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityProps {
    /// Parent entity; `None` only for the repository root.
    pub parent: Option<EntityId>,
    /// Code unique among siblings, used for name-based lookup.
    pub code: String,
    /// Human-readable name.
    pub name: String,
    /// Entity kind tag (e.g. "container", "item", "definition").
    pub kind: String,
    /// Free-form attributes supplied by the connector.
    pub attrs: serde_json::Value,
}

impl EntityProps {
    pub fn new(parent: EntityId, code: &str, kind: &str) -> Self {
        Self {
            parent: Some(parent),
            code: code.to_string(),
            name: code.to_string(),
            kind: kind.to_string(),
            attrs: serde_json::Value::Null,
        }
    }
}

/// An externally-authored data unit: stable id plus opaque version marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: String,
    pub version: String,
}

impl SourceItem {
    pub fn new(id: &str, version: &str) -> Self {
        Self {
            id: id.to_string(),
            version: version.to_string(),
        }
    }
}

/// Classification of a source item against previously recorded state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    New,
    Changed,
    Unchanged,
    Deleted,
}

/// Identity of a tracked record within its scope: (kind, source id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: String,
    pub source_id: String,
}

impl RecordKey {
    pub fn new(kind: &str, source_id: &str) -> Self {
        Self {
            kind: kind.to_string(),
            source_id: source_id.to_string(),
        }
    }
}

/// Persisted link between a source item and the entity representing it.
///
/// (scope_id, kind, source_id) is unique; the store's upsert enforces it.
/// Records live inside the store itself and inherit its versioning and
/// locking guarantees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedRecord {
    pub scope_id: EntityId,
    pub kind: String,
    pub source_id: String,
    pub entity_id: EntityId,
    pub aspect_id: Option<String>,
    pub version_checksum: String,
}

impl TrackedRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.kind, &self.source_id)
    }
}

/// Result of synchronizing one source item.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub props: EntityProps,
    pub state: ItemState,
    pub entity_id: Option<EntityId>,
}

/// Controls which subtree deletion scanning is confined to when a job
/// configuration allows both flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopePolicy {
    /// Scope rooted at the job's document subject entity.
    #[default]
    Document,
    /// Scope rooted at the job's write-channel root.
    Channel,
}

/// A named subtree within which tracked-record identity and deletion
/// scanning are confined.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub root: EntityId,
    pub name: String,
}

impl Scope {
    pub fn new(root: EntityId, name: &str) -> Self {
        Self {
            root,
            name: name.to_string(),
        }
    }
}

/// An exclusively-lockable write boundary rooted at one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub root: EntityId,
}

impl Channel {
    pub fn new(root: EntityId) -> Self {
        Self { root }
    }

    /// Name of the exclusive lock guarding this channel's root.
    pub fn lock_name(&self) -> String {
        entity_lock_name(self.root)
    }
}

/// Lock name for an entity, as registered with the arbiter.
pub fn entity_lock_name(id: EntityId) -> String {
    format!("entity:{id}")
}

/// Interface to the hierarchical entity store.
///
/// The store is an external collaborator: this crate never implements its
/// on-disk format or transaction log. `MemoryStore` exists for the ephemeral
/// single-writer mode and for tests.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Repository root entity.
    fn root(&self) -> EntityId;

    async fn insert(&mut self, props: EntityProps) -> Result<EntityId>;

    async fn update(&mut self, id: EntityId, props: EntityProps) -> Result<()>;

    /// Delete an entity. Fails with `SyncError::ConstraintViolation` if a
    /// live relationship (hierarchical child or external link) still
    /// references it.
    async fn delete(&mut self, id: EntityId) -> Result<()>;

    async fn contains(&self, id: EntityId) -> Result<bool>;

    async fn parent_of(&self, id: EntityId) -> Result<Option<EntityId>>;

    /// Look up a direct child of `parent` by code.
    async fn query_id_by_code(&self, parent: EntityId, code: &str) -> Result<Option<EntityId>>;

    /// Upsert keyed on (scope_id, kind, source_id).
    async fn upsert_record(&mut self, record: TrackedRecord) -> Result<()>;

    async fn delete_record(&mut self, scope_id: EntityId, key: &RecordKey) -> Result<()>;

    async fn records_in_scope(&self, scope_id: EntityId) -> Result<Vec<TrackedRecord>>;

    async fn query_records_by_source(
        &self,
        scope_id: EntityId,
        kind: &str,
        source_id: &str,
    ) -> Result<Vec<TrackedRecord>>;

    /// Mark an entity as the root of a deletion-scanning scope.
    async fn register_scope(&mut self, root: EntityId) -> Result<()>;

    async fn scope_roots(&self) -> Result<Vec<EntityId>>;

    /// Last successful run timestamp for a job, if any.
    async fn get_sync_config(&self, job: &str) -> Result<Option<chrono::DateTime<chrono::Utc>>>;

    async fn put_sync_config(
        &mut self,
        job: &str,
        last_run: chrono::DateTime<chrono::Utc>,
    ) -> Result<()>;

    /// Merge remote changes into the working copy.
    async fn pull(&mut self) -> Result<()>;

    /// Commit the working copy locally.
    async fn save(&mut self, comment: &str) -> Result<()>;

    /// Publish committed changes to shared history. May fail with
    /// `SyncError::Contention` when another writer advanced the history.
    async fn push(&mut self, comment: &str) -> Result<()>;

    /// Drop uncommitted local changes, restoring the last committed state.
    async fn discard(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_key() {
        let record = TrackedRecord {
            scope_id: 3,
            kind: "item".into(),
            source_id: "src-1".into(),
            entity_id: 10,
            aspect_id: None,
            version_checksum: "abc".into(),
        };
        assert_eq!(record.key(), RecordKey::new("item", "src-1"));
    }

    #[test]
    fn test_entity_lock_name() {
        assert_eq!(entity_lock_name(42), "entity:42");
        assert_eq!(Channel::new(7).lock_name(), "entity:7");
    }

    #[test]
    fn test_scope_policy_default() {
        assert_eq!(ScopePolicy::default(), ScopePolicy::Document);
    }

    #[test]
    fn test_store_is_shareable_across_awaits() {
        // Readers hold &dyn EntityStore across await points, which needs Sync.
        fn assert_sync<T: Sync + ?Sized>() {}
        assert_sync::<dyn EntityStore>();
        assert_sync::<MemoryStore>();
    }
}
