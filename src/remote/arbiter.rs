// ABOUTME: HTTP client for the remote lock arbiter
// ABOUTME: Maps 409 responses to contention; everything else is an external failure

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::AccessTokenProvider;
use crate::error::{Result, SyncError};
use crate::locks::{LockArbiter, LockRequest};

/// Lock arbiter reached over HTTP.
///
/// The arbiter brokers locks across sessions; a lock held by another writer
/// comes back as 409 and is surfaced as `SyncError::Contention` so the
/// transaction runner can apply its retry policy.
pub struct HttpLockArbiter {
    client: Client,
    base_url: String,
    tokens: Arc<dyn AccessTokenProvider>,
    session: Uuid,
}

#[derive(Serialize)]
struct AcquireBody<'a> {
    session: Uuid,
    exclusive: &'a [String],
    shared: &'a [String],
}

#[derive(Serialize)]
struct ReleaseBody<'a> {
    session: Uuid,
    names: &'a [String],
}

impl HttpLockArbiter {
    pub fn new(base_url: String, tokens: Arc<dyn AccessTokenProvider>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::external(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url,
            tokens,
            session: Uuid::new_v4(),
        })
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response> {
        let token = self.tokens.get_token().await?;
        let url = format!("{}/{path}", self.base_url.trim_end_matches('/'));
        self.client
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| SyncError::external(format!("lock arbiter unreachable at {url}: {e}")))
    }
}

#[async_trait]
impl LockArbiter for HttpLockArbiter {
    async fn acquire(&self, request: &LockRequest) -> Result<()> {
        let body = AcquireBody {
            session: self.session,
            exclusive: &request.exclusive,
            shared: &request.shared,
        };
        let response = self.post("locks/acquire", &body).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => {
                let lock = response
                    .text()
                    .await
                    .ok()
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| {
                        request.names().next().unwrap_or("unknown").to_string()
                    });
                Err(SyncError::Contention { lock })
            }
            StatusCode::UNAUTHORIZED => Err(SyncError::external(
                "lock arbiter rejected the access token; it may be invalid or expired",
            )),
            status => {
                let text = response.text().await.unwrap_or_default();
                Err(SyncError::external(format!(
                    "lock acquisition failed with status {status}: {text}"
                )))
            }
        }
    }

    async fn release(&self, names: &[String]) -> Result<()> {
        let body = ReleaseBody {
            session: self.session,
            names,
        };
        let response = self.post("locks/release", &body).await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(SyncError::external(format!(
                "lock release failed with status {status}: {text}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::test_support::StaticTokens;

    #[test]
    fn test_arbiter_creation() {
        let arbiter = HttpLockArbiter::new(
            "https://arbiter.example.com".to_string(),
            Arc::new(StaticTokens::new("k")),
        );
        assert!(arbiter.is_ok());
    }

    #[test]
    fn test_each_arbiter_gets_its_own_session() {
        let tokens: Arc<dyn AccessTokenProvider> = Arc::new(StaticTokens::new("k"));
        let a = HttpLockArbiter::new("http://a".into(), tokens.clone()).unwrap();
        let b = HttpLockArbiter::new("http://a".into(), tokens).unwrap();
        assert_ne!(a.session(), b.session());
    }
}
