// ABOUTME: ChangeTracker classifies source items as new/changed/unchanged
// ABOUTME: Records checksums in the store and marks records touched per pass

use sha2::{Digest, Sha256};
use std::collections::HashSet;

use crate::error::{Result, SyncError};
use crate::store::{
    EntityId, EntityProps, EntityStore, ItemState, RecordKey, Scope, SourceItem, SyncOutcome,
    TrackedRecord,
};

/// Checksum of an opaque version marker.
///
/// The marker's content is meaningless to the core; only equality with the
/// previously recorded checksum matters.
pub fn version_checksum(version: &str) -> String {
    let digest = Sha256::digest(version.as_bytes());
    format!("{digest:x}")
}

/// Per-state tally of the items a pass has synchronized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
}

/// Tracks which source items a pass has seen within one scope.
///
/// The touched set is pass-local; tracked records persist in the store.
/// Ancestor containers must be committed on every pass even when unchanged,
/// otherwise the deletion scanner treats their whole subtree as abandoned.
pub struct ChangeTracker {
    scope: Scope,
    touched: HashSet<RecordKey>,
    counts: StateCounts,
}

impl ChangeTracker {
    pub fn new(scope: Scope) -> Self {
        Self {
            scope,
            touched: HashSet::new(),
            counts: StateCounts::default(),
        }
    }

    pub fn counts(&self) -> StateCounts {
        self.counts
    }

    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    pub fn touched(&self) -> &HashSet<RecordKey> {
        &self.touched
    }

    pub fn touched_count(&self) -> usize {
        self.touched.len()
    }

    /// Mark a record touched without rewriting it, for records the
    /// orchestrator committed before this tracker existed.
    pub fn touch(&mut self, key: RecordKey) {
        self.touched.insert(key);
    }

    /// Classify `item` against the record stored for it, if any.
    pub async fn classify(
        &self,
        store: &dyn EntityStore,
        kind: &str,
        item: &SourceItem,
    ) -> Result<ItemState> {
        let records = store
            .query_records_by_source(self.scope.root, kind, &item.id)
            .await?;
        match records.first() {
            None => Ok(ItemState::New),
            Some(record) if record.version_checksum == version_checksum(&item.version) => {
                Ok(ItemState::Unchanged)
            }
            Some(_) => Ok(ItemState::Changed),
        }
    }

    /// Upsert the record linking `item` to `entity_id` and mark it touched.
    ///
    /// Idempotent for repeated commits at the same version.
    pub async fn commit(
        &mut self,
        store: &mut dyn EntityStore,
        kind: &str,
        item: &SourceItem,
        entity_id: EntityId,
        aspect_id: Option<&str>,
    ) -> Result<TrackedRecord> {
        let record = TrackedRecord {
            scope_id: self.scope.root,
            kind: kind.to_string(),
            source_id: item.id.clone(),
            entity_id,
            aspect_id: aspect_id.map(String::from),
            version_checksum: version_checksum(&item.version),
        };
        store.upsert_record(record.clone()).await?;
        self.touched.insert(record.key());
        Ok(record)
    }

    /// Classify, apply, and commit one source item.
    ///
    /// New items are inserted, changed items updated in place, unchanged
    /// items confirmed without mutating the store. This is the path
    /// connectors use from their `update_data` hook.
    pub async fn sync_item(
        &mut self,
        store: &mut dyn EntityStore,
        kind: &str,
        item: &SourceItem,
        props: EntityProps,
    ) -> Result<SyncOutcome> {
        let state = self.classify(store, kind, item).await?;
        let entity_id = match state {
            ItemState::New => store.insert(props.clone()).await?,
            ItemState::Changed | ItemState::Unchanged => {
                let records = store
                    .query_records_by_source(self.scope.root, kind, &item.id)
                    .await?;
                let record = records.first().ok_or_else(|| {
                    SyncError::consistency(
                        &self.scope.name,
                        format!("record for {kind} '{}' vanished mid-pass", item.id),
                    )
                })?;
                if !store.contains(record.entity_id).await? {
                    return Err(SyncError::consistency(
                        &self.scope.name,
                        format!(
                            "record for {kind} '{}' points at missing entity {}",
                            item.id, record.entity_id
                        ),
                    ));
                }
                if state == ItemState::Changed {
                    store.update(record.entity_id, props.clone()).await?;
                }
                record.entity_id
            }
            ItemState::Deleted => {
                return Err(SyncError::usage("cannot sync an already-deleted item"))
            }
        };
        self.commit(store, kind, item, entity_id, None).await?;
        match state {
            ItemState::New => self.counts.new += 1,
            ItemState::Changed => self.counts.changed += 1,
            ItemState::Unchanged => self.counts.unchanged += 1,
            ItemState::Deleted => {}
        }
        Ok(SyncOutcome {
            props,
            state,
            entity_id: Some(entity_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn scope_in(store: &MemoryStore) -> Scope {
        Scope::new(store.root(), "test-scope")
    }

    #[tokio::test]
    async fn test_first_sighting_is_new() {
        let store = MemoryStore::new();
        let tracker = ChangeTracker::new(scope_in(&store));
        let item = SourceItem::new("a", "v1");
        let state = tracker.classify(&store, "item", &item).await.unwrap();
        assert_eq!(state, ItemState::New);
    }

    #[tokio::test]
    async fn test_same_version_is_unchanged() {
        let mut store = MemoryStore::new();
        let root = store.root();
        let mut tracker = ChangeTracker::new(scope_in(&store));
        let item = SourceItem::new("a", "v1");
        let outcome = tracker
            .sync_item(&mut store, "item", &item, EntityProps::new(root, "a", "item"))
            .await
            .unwrap();
        assert_eq!(outcome.state, ItemState::New);

        let state = tracker.classify(&store, "item", &item).await.unwrap();
        assert_eq!(state, ItemState::Unchanged);
    }

    #[tokio::test]
    async fn test_version_bump_is_changed_and_updates_checksum() {
        let mut store = MemoryStore::new();
        let root = store.root();
        let mut tracker = ChangeTracker::new(scope_in(&store));
        tracker
            .sync_item(
                &mut store,
                "item",
                &SourceItem::new("a", "v1"),
                EntityProps::new(root, "a", "item"),
            )
            .await
            .unwrap();

        let bumped = SourceItem::new("a", "v2");
        assert_eq!(
            tracker.classify(&store, "item", &bumped).await.unwrap(),
            ItemState::Changed
        );
        let outcome = tracker
            .sync_item(&mut store, "item", &bumped, EntityProps::new(root, "a", "item"))
            .await
            .unwrap();
        assert_eq!(outcome.state, ItemState::Changed);

        let records = store
            .query_records_by_source(root, "item", "a")
            .await
            .unwrap();
        assert_eq!(records[0].version_checksum, version_checksum("v2"));
    }

    #[tokio::test]
    async fn test_unchanged_item_does_not_mutate_entity() {
        let mut store = MemoryStore::new();
        let root = store.root();
        let mut tracker = ChangeTracker::new(scope_in(&store));
        let item = SourceItem::new("a", "v1");
        let first = tracker
            .sync_item(&mut store, "item", &item, EntityProps::new(root, "a", "item"))
            .await
            .unwrap();
        let count_before = store.entity_count();

        let second = tracker
            .sync_item(&mut store, "item", &item, EntityProps::new(root, "a", "item"))
            .await
            .unwrap();
        assert_eq!(second.state, ItemState::Unchanged);
        assert_eq!(second.entity_id, first.entity_id);
        assert_eq!(store.entity_count(), count_before);
    }

    #[tokio::test]
    async fn test_commit_is_idempotent_at_same_version() {
        let mut store = MemoryStore::new();
        let root = store.root();
        let mut tracker = ChangeTracker::new(scope_in(&store));
        let item = SourceItem::new("a", "v1");
        let entity = store
            .insert(EntityProps::new(root, "a", "item"))
            .await
            .unwrap();
        let r1 = tracker
            .commit(&mut store, "item", &item, entity, None)
            .await
            .unwrap();
        let r2 = tracker
            .commit(&mut store, "item", &item, entity, None)
            .await
            .unwrap();
        assert_eq!(r1, r2);
        assert_eq!(tracker.touched_count(), 1);
        assert_eq!(store.records_in_scope(root).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_record_pointing_at_missing_entity_is_fatal() {
        let mut store = MemoryStore::new();
        let root = store.root();
        let mut tracker = ChangeTracker::new(scope_in(&store));
        let item = SourceItem::new("a", "v1");
        // Forge a record at an entity that does not exist.
        store
            .upsert_record(TrackedRecord {
                scope_id: root,
                kind: "item".into(),
                source_id: "a".into(),
                entity_id: 999,
                aspect_id: None,
                version_checksum: version_checksum("v0"),
            })
            .await
            .unwrap();
        let err = tracker
            .sync_item(&mut store, "item", &item, EntityProps::new(root, "a", "item"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Consistency { .. }));
    }
}
