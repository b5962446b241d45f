//! Presence heartbeat for a waiting user.
//!
//! While a user waits, a background task refreshes `lastSeen` on the user's
//! ticket every heartbeat interval so other users don't evict it as a ghost.
//! The task is bound to the waiting lifecycle: it is started on entering the
//! waiting state and stopped on leaving it, and it ends by itself once the
//! ticket is gone (the user was claimed or cancelled).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::model::UserId;
use crate::store::DocumentStore;

/// Why a heartbeat task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceExit {
    /// Stopped through [`PresenceHandle::stop`] or by dropping the handle.
    Cancelled,
    /// The ticket no longer exists.
    TicketGone,
    /// A refresh failed for another reason.
    Failed(StoreError),
}

/// Handle to a running heartbeat task. Dropping it stops the task.
pub struct PresenceHandle {
    cancel: CancellationToken,
    handle: Option<JoinHandle<PresenceExit>>,
}

impl PresenceHandle {
    /// Spawn the heartbeat task for `user`.
    ///
    /// The first refresh happens one `interval` after start, since the ticket
    /// was just written.
    pub fn start(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        user: UserId,
        interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    biased;
                    _ = task_cancel.cancelled() => {
                        debug!(user_id = %user, "presence stopped");
                        return PresenceExit::Cancelled;
                    }
                    _ = ticker.tick() => {
                        match store.touch_ticket(&user, clock.now()).await {
                            Ok(()) => debug!(user_id = %user, "heartbeat"),
                            Err(e) if e.is_not_found() => {
                                debug!(user_id = %user, "ticket gone, presence ending");
                                return PresenceExit::TicketGone;
                            }
                            Err(e) => {
                                warn!(user_id = %user, error = %e, "heartbeat failed, presence ending");
                                return PresenceExit::Failed(e);
                            }
                        }
                    }
                }
            }
        });

        Self {
            cancel,
            handle: Some(handle),
        }
    }

    /// Request the task to stop. It exits at its next poll.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Wait for the task to end and report why.
    pub async fn join(mut self) -> PresenceExit {
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or(PresenceExit::Cancelled),
            None => PresenceExit::Cancelled,
        }
    }
}

impl Drop for PresenceHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
