// ABOUTME: Remote collaborators - access tokens and the HTTP lock arbiter
// ABOUTME: Credentials stay opaque to the reconciliation core

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

pub mod arbiter;

pub use arbiter::HttpLockArbiter;

/// Supplies the credential attached to arbiter and store requests.
/// The credential's content is opaque to the core.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn get_token(&self) -> Result<String>;
}

/// Reads the access token from a file, one token per file.
pub struct FileTokenProvider {
    path: PathBuf,
}

impl FileTokenProvider {
    pub fn new(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_token_path()?,
        };
        Ok(Self { path })
    }
}

#[async_trait]
impl AccessTokenProvider for FileTokenProvider {
    async fn get_token(&self) -> Result<String> {
        let contents = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SyncError::external(format!(
                "failed to read token file {}: {e}",
                self.path.display()
            ))
        })?;
        let token = contents.trim().to_string();
        if token.is_empty() {
            return Err(SyncError::external(format!(
                "token file {} is empty",
                self.path.display()
            )));
        }
        Ok(token)
    }
}

fn default_token_path() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SyncError::external("could not determine home directory"))?;
    Ok(home.join(".entity-replicator/token"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Token provider with a fixed in-memory credential.
    pub struct StaticTokens {
        token: String,
    }

    impl StaticTokens {
        pub fn new(token: &str) -> Self {
            Self {
                token: token.to_string(),
            }
        }
    }

    #[async_trait]
    impl AccessTokenProvider for StaticTokens {
        async fn get_token(&self) -> Result<String> {
            Ok(self.token.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_token_read_and_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        tokio::fs::write(&path, "  secret-token\n").await.unwrap();
        let provider = FileTokenProvider::new(Some(&path)).unwrap();
        assert_eq!(provider.get_token().await.unwrap(), "secret-token");
    }

    #[tokio::test]
    async fn test_empty_token_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        tokio::fs::write(&path, "\n").await.unwrap();
        let provider = FileTokenProvider::new(Some(&path)).unwrap();
        assert!(provider.get_token().await.is_err());
    }
}
