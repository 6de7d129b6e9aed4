// ABOUTME: Connector for JSON source documents on disk
// ABOUTME: Walks the document tree and feeds every node through the change tracker

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::connector::{ConnectorCallbacks, PhaseContext, SchemaKind, SourceDocument};
use crate::error::{Result, SyncError};
use crate::store::{EntityId, EntityProps, EntityStore, SourceItem};
use crate::sync::tracker::ChangeTracker;

/// On-disk shape of a source document.
#[derive(Debug, Clone, Deserialize)]
struct FileDocument {
    code: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    items: Vec<FileNode>,
}

#[derive(Debug, Clone, Deserialize)]
struct FileNode {
    id: String,
    version: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    attrs: serde_json::Value,
    #[serde(default)]
    children: Vec<FileNode>,
}

impl FileNode {
    /// Record identity includes the kind, so it must stay stable across
    /// passes. Nodes default to "node" unless the document says otherwise;
    /// deriving it from the current child count would re-key a container
    /// the moment its children vanish.
    fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("node")
    }
}

/// Reads a JSON document from disk and synchronizes its node tree.
///
/// Parents are synced before their children, so every ancestor is
/// touched on every pass regardless of whether it changed.
pub struct FileConnector {
    path: PathBuf,
    document: Option<FileDocument>,
}

impl FileConnector {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            document: None,
        }
    }

    fn sync_node<'a>(
        store: &'a mut dyn EntityStore,
        tracker: &'a mut ChangeTracker,
        parent: EntityId,
        node: FileNode,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let code = node.code.clone().unwrap_or_else(|| node.id.clone());
            let mut props = EntityProps::new(parent, &code, node.kind());
            props.attrs = node.attrs.clone();
            let item = SourceItem::new(&node.id, &node.version);
            let outcome = tracker
                .sync_item(store, node.kind(), &item, props)
                .await?;
            let entity = outcome.entity_id.ok_or_else(|| {
                SyncError::external(format!("no entity resolved for source item '{}'", node.id))
            })?;
            for child in node.children {
                Self::sync_node(store, tracker, entity, child).await?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ConnectorCallbacks for FileConnector {
    async fn open_source(&mut self) -> Result<SourceDocument> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SyncError::external(format!(
                "failed to read source document {}: {e}",
                self.path.display()
            ))
        })?;
        let document: FileDocument = serde_json::from_str(&contents).map_err(|e| {
            SyncError::external(format!(
                "failed to parse source document {}: {e}",
                self.path.display()
            ))
        })?;
        let source = SourceDocument {
            code: document.code.clone(),
            name: document
                .name
                .clone()
                .unwrap_or_else(|| document.code.clone()),
        };
        self.document = Some(document);
        Ok(source)
    }

    async fn import_schema(
        &mut self,
        _store: &mut dyn EntityStore,
        kind: SchemaKind,
    ) -> Result<()> {
        // JSON documents carry no schema of their own.
        tracing::debug!("file connector has no {kind:?} schema to import");
        Ok(())
    }

    async fn import_definitions(&mut self, _ctx: PhaseContext<'_>) -> Result<()> {
        tracing::debug!("file connector has no shared definitions");
        Ok(())
    }

    async fn update_data(&mut self, ctx: PhaseContext<'_>) -> Result<()> {
        let document = self
            .document
            .clone()
            .ok_or_else(|| SyncError::usage("update_data called before open_source"))?;
        tracing::info!(
            "syncing {} top-level item(s) from {}",
            document.items.len(),
            self.path.display()
        );
        let PhaseContext {
            store,
            tracker,
            subject,
        } = ctx;
        for node in document.items {
            Self::sync_node(store, tracker, subject, node).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_source_reads_document_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        tokio::fs::write(
            &path,
            r#"{"code": "catalog", "name": "Fruit catalog", "items": []}"#,
        )
        .await
        .unwrap();
        let mut connector = FileConnector::new(&path);
        let doc = connector.open_source().await.unwrap();
        assert_eq!(doc.code, "catalog");
        assert_eq!(doc.name, "Fruit catalog");
    }

    #[tokio::test]
    async fn test_missing_document_is_external_failure() {
        let mut connector = FileConnector::new(Path::new("/nonexistent/doc.json"));
        let err = connector.open_source().await.unwrap_err();
        assert!(matches!(err, SyncError::External(_)));
    }

    #[test]
    fn test_node_kind_is_explicit_or_default() {
        let doc: FileDocument = serde_json::from_str(
            r#"{"code": "c", "items": [
                {"id": "a", "version": "1", "kind": "container", "children": [
                    {"id": "b", "version": "1"}
                ]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(doc.items[0].kind(), "container");
        assert_eq!(doc.items[0].children[0].kind(), "node");
    }

    #[test]
    fn test_node_kind_ignores_child_count() {
        // The same node with and without children keeps one identity.
        let with: FileNode = serde_json::from_str(
            r#"{"id": "a", "version": "1", "children": [{"id": "b", "version": "1"}]}"#,
        )
        .unwrap();
        let without: FileNode = serde_json::from_str(r#"{"id": "a", "version": "2"}"#).unwrap();
        assert_eq!(with.kind(), without.kind());
    }
}
