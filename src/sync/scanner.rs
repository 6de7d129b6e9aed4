// ABOUTME: DeletionScanner removes entities abandoned by the current pass
// ABOUTME: Deletes bottom-up within a scope, skipping entities kept alive by links

use std::collections::{HashMap, HashSet};

use crate::error::{Result, SyncError};
use crate::store::{EntityId, EntityStore, RecordKey, Scope, TrackedRecord};

/// Scans one scope after a pass and deletes what the pass did not touch.
pub struct DeletionScanner;

impl DeletionScanner {
    /// Remove entities recorded in `scope` but absent from `touched`.
    ///
    /// Candidates are ordered bottom-up (children before parents). A delete
    /// rejected by a live relationship from outside the abandoned subtree is
    /// a "still in use" signal, not an error: the entity and its record
    /// survive. An empty touched set degenerates to deleting everything the
    /// scope has ever recorded.
    pub async fn scan(
        store: &mut dyn EntityStore,
        scope: &Scope,
        touched: &HashSet<RecordKey>,
    ) -> Result<Vec<EntityId>> {
        Self::reject_nested_scope(store, scope).await?;

        let records = store.records_in_scope(scope.root).await?;
        let recorded_entities: HashMap<EntityId, &TrackedRecord> =
            records.iter().map(|r| (r.entity_id, r)).collect();

        let mut candidates: Vec<(u32, &TrackedRecord)> = Vec::new();
        for record in &records {
            if touched.contains(&record.key()) {
                continue;
            }
            let depth = Self::depth_below_scope(store, scope, record, &recorded_entities).await?;
            candidates.push((depth, record));
        }

        // Children before parents.
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        let mut removed = Vec::new();
        for (_, record) in candidates {
            match store.delete(record.entity_id).await {
                Ok(()) => {
                    store.delete_record(scope.root, &record.key()).await?;
                    removed.push(record.entity_id);
                }
                Err(SyncError::ConstraintViolation { entity }) => {
                    tracing::info!(
                        "entity {entity} ({} '{}') is still referenced, keeping it",
                        record.kind,
                        record.source_id
                    );
                }
                Err(other) => return Err(other),
            }
        }

        tracing::info!(
            "deletion scan of scope '{}' removed {} of {} recorded entities",
            scope.name,
            removed.len(),
            records.len()
        );
        Ok(removed)
    }

    /// Scopes must not nest, in either direction: scanning a scope whose
    /// root sits inside another registered scope, or one that contains a
    /// registered scope root, would delete across the boundary.
    async fn reject_nested_scope(store: &dyn EntityStore, scope: &Scope) -> Result<()> {
        let roots: HashSet<EntityId> = store.scope_roots().await?.into_iter().collect();
        let mut cursor = store.parent_of(scope.root).await?;
        while let Some(ancestor) = cursor {
            if roots.contains(&ancestor) {
                return Err(SyncError::usage(format!(
                    "scope '{}' (root entity {}) is nested inside the scope rooted at \
                     entity {ancestor}; nested scopes are unsupported",
                    scope.name, scope.root
                )));
            }
            cursor = store.parent_of(ancestor).await?;
        }
        for root in roots {
            if root == scope.root {
                continue;
            }
            let mut cursor = store.parent_of(root).await?;
            while let Some(ancestor) = cursor {
                if ancestor == scope.root {
                    return Err(SyncError::usage(format!(
                        "scope '{}' (root entity {}) contains the registered scope rooted \
                         at entity {root}; nested scopes are unsupported",
                        scope.name, scope.root
                    )));
                }
                cursor = store.parent_of(ancestor).await?;
            }
        }
        Ok(())
    }

    /// Depth of a candidate below the scope root, validating the chain on
    /// the way up: the entity must exist, every ancestor container strictly
    /// inside the scope must carry a tracked record, and the chain must
    /// reach the scope root.
    async fn depth_below_scope(
        store: &dyn EntityStore,
        scope: &Scope,
        record: &TrackedRecord,
        recorded_entities: &HashMap<EntityId, &TrackedRecord>,
    ) -> Result<u32> {
        if !store.contains(record.entity_id).await? {
            return Err(SyncError::consistency(
                &scope.name,
                format!(
                    "record for {} '{}' points at missing entity {}",
                    record.kind, record.source_id, record.entity_id
                ),
            ));
        }

        let mut depth = 0u32;
        let mut cursor = record.entity_id;
        while cursor != scope.root {
            if depth > 0 && !recorded_entities.contains_key(&cursor) {
                return Err(SyncError::consistency(
                    &scope.name,
                    format!(
                        "ancestor container (entity {cursor}) of {} '{}' has no tracked record",
                        record.kind, record.source_id
                    ),
                ));
            }
            cursor = match store.parent_of(cursor).await? {
                Some(parent) => parent,
                None => {
                    return Err(SyncError::consistency(
                        &scope.name,
                        format!(
                            "entity {} for {} '{}' lies outside scope root {}",
                            record.entity_id, record.kind, record.source_id, scope.root
                        ),
                    ))
                }
            };
            depth += 1;
        }
        Ok(depth)
    }
}
