// ABOUTME: TransactionRunner wraps lock-acquire, task, persist with bounded retry
// ABOUTME: Retries only contention; push failures force a resync before the next try

use async_trait::async_trait;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::locks::{LockArbiter, LockCoordinator, LockRequest};
use crate::store::EntityStore;

/// How the session reaches the shared store.
///
/// `Live` is the multi-writer mode: locks are brokered by a remote arbiter
/// and every persist pulls, saves, and pushes shared history. `Ephemeral`
/// is a single-writer throwaway store where neither applies. Callers
/// pattern-match instead of probing optional fields.
#[derive(Clone)]
pub enum StoreMode {
    Live { arbiter: Arc<dyn LockArbiter> },
    Ephemeral,
}

impl StoreMode {
    pub fn is_live(&self) -> bool {
        matches!(self, StoreMode::Live { .. })
    }

    pub fn coordinator(&self) -> LockCoordinator {
        match self {
            StoreMode::Live { arbiter } => LockCoordinator::new(arbiter.clone()),
            StoreMode::Ephemeral => LockCoordinator::ephemeral(),
        }
    }
}

/// One unit of work executed under the runner's lock/persist discipline.
///
/// A task may run more than once when a push is contended, so it must be
/// written to re-derive its work from the store rather than from leftovers
/// of a previous attempt.
#[async_trait]
pub trait SyncTask: Send {
    type Output: Send;

    async fn run(&mut self, store: &mut dyn EntityStore) -> Result<Self::Output>;
}

/// Bounds for contention retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt; max_retries = N means N+1 attempts.
    pub max_retries: u32,
    /// Upper bound of the uniform random backoff before each retry.
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_wait: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> Duration {
        let cap = self.max_wait.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
    }
}

/// Runs one phase body inside the lock/persist discipline.
///
/// `run` acquires the requested locks, executes the task, and persists.
/// Contention at acquisition is retried with a random backoff up to the
/// policy bound, then re-raised as fatal. Contention at push means another
/// writer advanced shared history: the runner marks itself as needing a
/// resync, pulls before the next attempt, and re-runs the task. Any other
/// task error discards local changes and propagates without a retry.
pub struct TransactionRunner {
    policy: RetryPolicy,
    live: bool,
    must_resync: bool,
}

impl TransactionRunner {
    pub fn new(policy: RetryPolicy, mode: &StoreMode) -> Self {
        Self {
            policy,
            live: mode.is_live(),
            must_resync: false,
        }
    }

    pub async fn run<T: SyncTask>(
        &mut self,
        store: &mut dyn EntityStore,
        coordinator: &mut LockCoordinator,
        request: &LockRequest,
        comment: &str,
        task: &mut T,
    ) -> Result<T::Output> {
        let mut failures = 0u32;
        loop {
            // Set only by a failed push, never by a failed acquisition.
            if self.must_resync {
                store.pull().await?;
                self.must_resync = false;
            }

            match coordinator.acquire(request).await {
                Ok(()) => {}
                Err(err @ SyncError::Contention { .. }) => {
                    failures += 1;
                    if failures > self.policy.max_retries {
                        return Err(err);
                    }
                    let wait = self.policy.backoff();
                    tracing::warn!(
                        "lock contention (attempt {}/{}), retrying in {:?}: {err}",
                        failures,
                        self.policy.max_retries + 1,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
                Err(other) => return Err(other),
            }

            let value = match task.run(store).await {
                Ok(value) => value,
                Err(err) => {
                    store.discard().await?;
                    return Err(err);
                }
            };

            if self.live {
                store.pull().await?;
                store.save(comment).await?;
                match store.push(comment).await {
                    Ok(()) => {}
                    Err(err @ SyncError::Contention { .. }) => {
                        failures += 1;
                        if failures > self.policy.max_retries {
                            return Err(err);
                        }
                        // Another writer advanced shared history.
                        self.must_resync = true;
                        let wait = self.policy.backoff();
                        tracing::warn!(
                            "push contention (attempt {}/{}), resyncing in {:?}",
                            failures,
                            self.policy.max_retries + 1,
                            wait
                        );
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    Err(other) => return Err(other),
                }
            } else {
                store.save(comment).await?;
            }

            return Ok(value);
        }
    }
}
