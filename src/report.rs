// ABOUTME: ErrorSink abstraction and the JSON failure-report file
// ABOUTME: The orchestrator records one structured failure per aborted run

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Where structured failure records go. Persisted outside the core.
#[async_trait]
pub trait ErrorSink: Send + Sync {
    async fn record(&self, kind: &str, message: &str, phase: &str) -> Result<()>;
}

/// One persisted failure record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: String,
    pub message: String,
    pub phase: String,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Writes the failure report as pretty-printed JSON to a fixed path.
pub struct JsonFileSink {
    path: PathBuf,
}

impl JsonFileSink {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from(".entity-replicator/last-failure.json")
    }
}

#[async_trait]
impl ErrorSink for JsonFileSink {
    async fn record(&self, kind: &str, message: &str, phase: &str) -> Result<()> {
        let report = FailureReport {
            kind: kind.to_string(),
            message: message.to_string(),
            phase: phase.to_string(),
            at: chrono::Utc::now(),
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                SyncError::external(format!(
                    "failed to create report directory {}: {e}",
                    parent.display()
                ))
            })?;
        }
        let contents = serde_json::to_string_pretty(&report)?;
        tokio::fs::write(&self.path, contents).await.map_err(|e| {
            SyncError::external(format!(
                "failed to write failure report to {}: {e}",
                self.path.display()
            ))
        })?;
        Ok(())
    }
}
