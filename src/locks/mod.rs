// ABOUTME: Lock coordination against a remote arbiter
// ABOUTME: Tracks held locks per session so same-writer re-acquisition is a no-op

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;

pub mod channel;

pub use channel::ChannelGuard;

/// A set of lock names to acquire in one arbiter round-trip.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LockRequest {
    pub exclusive: Vec<String>,
    pub shared: Vec<String>,
}

impl LockRequest {
    pub fn exclusive(names: impl IntoIterator<Item = String>) -> Self {
        Self {
            exclusive: names.into_iter().collect(),
            shared: Vec::new(),
        }
    }

    pub fn with_shared(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.shared.extend(names);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.exclusive.is_empty() && self.shared.is_empty()
    }

    /// All names in the request, exclusive first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.exclusive
            .iter()
            .chain(self.shared.iter())
            .map(|s| s.as_str())
    }
}

/// Remote lock arbiter. The arbiter is the only cross-session coordination
/// mechanism; in-process mutual exclusion never suffices across sessions.
#[async_trait]
pub trait LockArbiter: Send + Sync {
    /// Acquire every lock in the request or none. A lock exclusively held
    /// by another writer surfaces as `SyncError::Contention`.
    async fn acquire(&self, request: &LockRequest) -> Result<()>;

    async fn release(&self, names: &[String]) -> Result<()>;
}

/// Per-session lock bookkeeping in front of the arbiter.
///
/// Built without an arbiter for the ephemeral single-writer mode, where no
/// other session can exist and acquisition is pure bookkeeping.
pub struct LockCoordinator {
    arbiter: Option<Arc<dyn LockArbiter>>,
    held: HashSet<String>,
}

impl LockCoordinator {
    pub fn new(arbiter: Arc<dyn LockArbiter>) -> Self {
        Self {
            arbiter: Some(arbiter),
            held: HashSet::new(),
        }
    }

    pub fn ephemeral() -> Self {
        Self {
            arbiter: None,
            held: HashSet::new(),
        }
    }

    pub fn holds(&self, name: &str) -> bool {
        self.held.contains(name)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Acquire the locks in `request` that this session does not already
    /// hold. Re-acquiring a held lock is a no-op by design: the arbiter is
    /// only consulted for the remainder.
    pub async fn acquire(&mut self, request: &LockRequest) -> Result<()> {
        let wanted = LockRequest {
            exclusive: request
                .exclusive
                .iter()
                .filter(|n| !self.held.contains(*n))
                .cloned()
                .collect(),
            shared: request
                .shared
                .iter()
                .filter(|n| !self.held.contains(*n))
                .cloned()
                .collect(),
        };
        if wanted.is_empty() {
            return Ok(());
        }
        if let Some(arbiter) = &self.arbiter {
            arbiter.acquire(&wanted).await?;
        }
        self.held.extend(wanted.names().map(String::from));
        tracing::debug!("acquired {} lock(s)", wanted.exclusive.len() + wanted.shared.len());
        Ok(())
    }

    pub async fn release(&mut self, name: &str) -> Result<()> {
        if !self.held.remove(name) {
            return Ok(());
        }
        if let Some(arbiter) = &self.arbiter {
            arbiter.release(&[name.to_string()]).await?;
        }
        Ok(())
    }

    pub async fn release_all(&mut self) -> Result<()> {
        if self.held.is_empty() {
            return Ok(());
        }
        let names: Vec<String> = self.held.drain().collect();
        if let Some(arbiter) = &self.arbiter {
            arbiter.release(&names).await?;
        }
        tracing::debug!("released {} lock(s)", names.len());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Arbiter that grants everything and counts acquire calls.
    #[derive(Default)]
    pub struct GrantingArbiter {
        pub acquires: AtomicU32,
        pub releases: AtomicU32,
    }

    #[async_trait]
    impl LockArbiter for GrantingArbiter {
        async fn acquire(&self, _request: &LockRequest) -> Result<()> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release(&self, _names: &[String]) -> Result<()> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Arbiter that always reports contention.
    #[derive(Default)]
    pub struct ContendedArbiter {
        pub attempts: AtomicU32,
    }

    #[async_trait]
    impl LockArbiter for ContendedArbiter {
        async fn acquire(&self, request: &LockRequest) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let lock = request
                .names()
                .next()
                .unwrap_or("unknown")
                .to_string();
            Err(SyncError::Contention { lock })
        }

        async fn release(&self, _names: &[String]) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{ContendedArbiter, GrantingArbiter};
    use super::*;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_reacquire_held_lock_skips_arbiter() {
        let arbiter = Arc::new(GrantingArbiter::default());
        let mut coordinator = LockCoordinator::new(arbiter.clone());
        let request = LockRequest::exclusive(["entity:1".to_string()]);
        coordinator.acquire(&request).await.unwrap();
        coordinator.acquire(&request).await.unwrap();
        assert_eq!(arbiter.acquires.load(Ordering::SeqCst), 1);
        assert!(coordinator.holds("entity:1"));
    }

    #[tokio::test]
    async fn test_contention_surfaces_as_typed_error() {
        let arbiter = Arc::new(ContendedArbiter::default());
        let mut coordinator = LockCoordinator::new(arbiter);
        let err = coordinator
            .acquire(&LockRequest::exclusive(["entity:9".to_string()]))
            .await
            .unwrap_err();
        assert!(err.is_contention());
        assert!(!coordinator.holds("entity:9"));
    }

    #[tokio::test]
    async fn test_release_all_clears_held_set() {
        let arbiter = Arc::new(GrantingArbiter::default());
        let mut coordinator = LockCoordinator::new(arbiter.clone());
        let request = LockRequest::exclusive(["entity:1".to_string()])
            .with_shared(["entity:2".to_string()]);
        coordinator.acquire(&request).await.unwrap();
        assert_eq!(coordinator.held_count(), 2);
        coordinator.release_all().await.unwrap();
        assert_eq!(coordinator.held_count(), 0);
        assert_eq!(arbiter.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_coordinator_needs_no_arbiter() {
        let mut coordinator = LockCoordinator::ephemeral();
        coordinator
            .acquire(&LockRequest::exclusive(["entity:5".to_string()]))
            .await
            .unwrap();
        assert!(coordinator.holds("entity:5"));
        coordinator.release("entity:5").await.unwrap();
        assert!(!coordinator.holds("entity:5"));
    }
}
