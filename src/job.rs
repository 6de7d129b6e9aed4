// ABOUTME: Job description loaded from a TOML file
// ABOUTME: Names the source, store mode, scope policy, and retry bounds for one job

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::store::ScopePolicy;
use crate::sync::runner::RetryPolicy;

/// Description of one synchronization job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job name; also the default write-channel code.
    pub name: String,
    /// Write-channel code under the repository root. Defaults to `name`.
    #[serde(default)]
    pub channel: Option<String>,
    /// Whether deletion scanning is confined to the source document or to
    /// the whole write channel.
    #[serde(default)]
    pub scope_policy: ScopePolicy,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub source: SourceConfig,
    /// Prepended to every commit comment.
    #[serde(default)]
    pub comment_prefix: Option<String>,
    /// Where the structured failure report goes.
    #[serde(default)]
    pub error_report: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum StoreConfig {
    /// In-memory store, single writer, no arbiter.
    #[default]
    Ephemeral,
    /// Shared multi-writer store behind a remote lock arbiter.
    Live {
        arbiter_url: String,
        #[serde(default)]
        token_file: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_wait_seconds")]
    pub max_wait_seconds: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_wait_seconds() -> u64 {
    10
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_wait_seconds: default_max_wait_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Connector kind (currently only "file").
    pub kind: String,
    pub path: PathBuf,
}

impl JobSpec {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read job file {}", path.display()))?;
        let job: JobSpec = toml::from_str(&contents)
            .with_context(|| format!("failed to parse job file {}", path.display()))?;
        Ok(job)
    }

    pub fn channel_code(&self) -> &str {
        self.channel.as_deref().unwrap_or(&self.name)
    }

    pub fn comment(&self, phase: &str) -> String {
        match &self.comment_prefix {
            Some(prefix) => format!("{prefix}{}: {phase}", self.name),
            None => format!("{}: {phase}", self.name),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            max_wait: Duration::from_secs(self.retry.max_wait_seconds),
        }
    }
}
