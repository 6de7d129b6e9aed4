// ABOUTME: ChannelGuard enforces at most one exclusive write channel per session
// ABOUTME: A second enter while the first root lock is held is a fatal usage error

use super::{LockCoordinator, LockRequest};
use crate::error::{Result, SyncError};
use crate::store::Channel;

/// Guards the session's single exclusive write channel.
///
/// The orchestrator enters a channel at the job-subject phase and leaves it
/// at finalize. Entering a second channel while the first's root lock is
/// still held signals a sequencing bug upstream and is never retried.
#[derive(Debug, Default)]
pub struct ChannelGuard {
    active: Option<Channel>,
}

impl ChannelGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<Channel> {
        self.active
    }

    pub async fn enter(
        &mut self,
        coordinator: &mut LockCoordinator,
        channel: Channel,
    ) -> Result<()> {
        if let Some(current) = self.active {
            if coordinator.holds(&current.lock_name()) {
                if current == channel {
                    // Re-entering the channel we already hold.
                    return Ok(());
                }
                return Err(SyncError::usage(format!(
                    "cannot enter channel rooted at entity {} while the channel rooted at \
                     entity {} is exclusively held; leave it first",
                    channel.root, current.root
                )));
            }
        }
        coordinator
            .acquire(&LockRequest::exclusive([channel.lock_name()]))
            .await?;
        self.active = Some(channel);
        tracing::debug!("entered channel rooted at entity {}", channel.root);
        Ok(())
    }

    pub async fn leave(&mut self, coordinator: &mut LockCoordinator) -> Result<()> {
        if let Some(channel) = self.active.take() {
            coordinator.release(&channel.lock_name()).await?;
            tracing::debug!("left channel rooted at entity {}", channel.root);
        }
        Ok(())
    }

    /// Release the previous channel's root lock (if any), then acquire the
    /// new root exclusively.
    pub async fn transition(
        &mut self,
        coordinator: &mut LockCoordinator,
        channel: Channel,
    ) -> Result<()> {
        self.leave(coordinator).await?;
        self.enter(coordinator, channel).await
    }
}
