//! The waiting list: one ticket per user looking for a partner.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::StoreError;
use crate::model::{UserId, WaitingTicket};
use crate::store::DocumentStore;

/// Enqueue, cancel and scan operations over the waiting collection.
#[derive(Clone)]
pub struct WaitingQueue {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl WaitingQueue {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Create or overwrite the user's ticket with `joinedAt = lastSeen = now`.
    pub async fn enqueue(&self, user: &UserId) -> Result<WaitingTicket, StoreError> {
        let ticket = WaitingTicket::new(user.clone(), self.clock.now());
        self.store.put_ticket(ticket.clone()).await?;
        info!(user_id = %user, "joined waiting list");
        Ok(ticket)
    }

    /// Remove the user's ticket. A missing ticket is not an error.
    pub async fn cancel(&self, user: &UserId) -> Result<(), StoreError> {
        self.store.delete_ticket(user).await?;
        debug!(user_id = %user, "left waiting list");
        Ok(())
    }

    /// Read up to `window` tickets and drop the caller's own.
    ///
    /// The window is applied before the self-filter, so a caller whose own
    /// ticket sits inside the window sees at most `window - 1` candidates.
    pub async fn scan(
        &self,
        exclude: &UserId,
        window: usize,
    ) -> Result<Vec<WaitingTicket>, StoreError> {
        let tickets = self.store.scan_tickets(window).await?;
        Ok(tickets
            .into_iter()
            .filter(|ticket| ticket.user_id != *exclude)
            .collect())
    }

    /// Whether `ticket` has outlived the ghost threshold right now.
    pub fn is_ghost(&self, ticket: &WaitingTicket, threshold: Duration) -> bool {
        ticket.is_ghost(self.clock.now(), threshold)
    }

    /// Delete a ghost ticket. Failures are logged and swallowed.
    pub async fn evict_ghost(&self, ticket: &WaitingTicket) {
        match self.store.delete_ticket(&ticket.user_id).await {
            Ok(()) => info!(
                user_id = %ticket.user_id,
                last_seen = %ticket.last_seen,
                "evicted ghost ticket"
            ),
            Err(e) => warn!(
                user_id = %ticket.user_id,
                error = %e,
                "failed to evict ghost ticket"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{FailPoint, InMemoryStore};

    fn queue() -> (WaitingQueue, InMemoryStore, ManualClock) {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let queue = WaitingQueue::new(Arc::new(store.clone()), Arc::new(clock.clone()));
        (queue, store, clock)
    }

    #[tokio::test]
    async fn test_enqueue_twice_keeps_one_ticket_with_fresh_times() {
        let (queue, store, clock) = queue();
        let alice = UserId::new("alice");

        queue.enqueue(&alice).await.unwrap();
        clock.advance(Duration::from_secs(30));
        let second = queue.enqueue(&alice).await.unwrap();

        let tickets = store.tickets();
        assert_eq!(tickets.len(), 1);
        assert_eq!(tickets[0], second);
        assert_eq!(second.joined_at, clock.now());
    }

    #[tokio::test]
    async fn test_cancel_without_ticket_is_ok() {
        let (queue, _, _) = queue();
        assert!(queue.cancel(&UserId::new("alice")).await.is_ok());
    }

    #[tokio::test]
    async fn test_scan_filters_self_after_window() {
        let (queue, _, _) = queue();
        for name in ["a", "b", "c", "d"] {
            queue.enqueue(&UserId::new(name)).await.unwrap();
        }

        let seen = queue.scan(&UserId::new("a"), 3).await.unwrap();

        let ids: Vec<_> = seen.iter().map(|t| t.user_id.as_str()).collect();
        assert_eq!(ids, ["b", "c"]);
    }

    #[tokio::test]
    async fn test_evict_ghost_swallows_failures() {
        let (queue, store, clock) = queue();
        let ticket = queue.enqueue(&UserId::new("ghost")).await.unwrap();
        clock.advance(Duration::from_secs(16));
        assert!(queue.is_ghost(&ticket, Duration::from_secs(15)));

        store.fail_next(FailPoint::DeleteTicket);
        queue.evict_ghost(&ticket).await;
        assert_eq!(store.tickets().len(), 1);

        queue.evict_ghost(&ticket).await;
        assert!(store.tickets().is_empty());
    }
}
