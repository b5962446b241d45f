//! Matchmaking: claim a live waiter or join the waiting list.
//!
//! # Protocol
//!
//! ```text
//! join(self)
//!     │
//!     ├─► scan waiting list (bounded window, self filtered out)
//!     ├─► evict ghosts, pick the first live candidate
//!     │
//!     ├─► none ─────────────────────────────► enqueue(self) ─► Waiting
//!     │
//!     └─► claim(candidate) in one transaction
//!             re-read ticket ─► gone? abort
//!             delete ticket
//!             create session (self = A, candidate = B)
//!             commit ─────────► ok ──────────────────────────► Paired
//!                         └──► conflict / failure ─► enqueue(self) ─► Waiting
//! ```
//!
//! There is no retry loop. A lost race always degrades to waiting, which is
//! what keeps two claimers from repeatedly colliding on the same candidates.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::MatchConfig;
use crate::error::{Result, StoreError};
use crate::model::{Session, SessionId, UserId, WaitingTicket};
use crate::queue::WaitingQueue;
use crate::store::DocumentStore;

/// Result of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// A session was created with `partner` in seat B.
    Paired {
        session_id: SessionId,
        partner: UserId,
    },
    /// The user's ticket is on the waiting list.
    Waiting,
}

/// Why a claim transaction was abandoned. Never leaves this module.
#[derive(Debug, Error)]
enum ClaimAbort {
    #[error("candidate ticket disappeared before the claim")]
    CandidateGone,

    #[error("refusing to pair user '{0}' with itself")]
    SelfMatch(UserId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Runs the join protocol for a user.
#[derive(Clone)]
pub struct Matchmaker {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    queue: WaitingQueue,
    config: MatchConfig,
}

impl Matchmaker {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, config: MatchConfig) -> Self {
        let queue = WaitingQueue::new(Arc::clone(&store), Arc::clone(&clock));
        Self {
            store,
            clock,
            queue,
            config,
        }
    }

    pub fn queue(&self) -> &WaitingQueue {
        &self.queue
    }

    /// Pair `user` with a live waiter, or put `user` on the waiting list.
    ///
    /// Only a failing scan or enqueue is reported as an error. Losing a claim
    /// race is not an error: the user simply ends up waiting.
    pub async fn join(&self, user: &UserId) -> Result<JoinOutcome> {
        let candidates = self.queue.scan(user, self.config.scan_window).await?;
        debug!(user_id = %user, scanned = candidates.len(), "scanned waiting list");

        let Some(candidate) = self.pick_live(candidates).await else {
            return self.wait(user).await;
        };

        match self.claim(user, &candidate).await {
            Ok(session_id) => {
                info!(
                    user_id = %user,
                    partner = %candidate.user_id,
                    session_id = %session_id,
                    "paired"
                );
                Ok(JoinOutcome::Paired {
                    session_id,
                    partner: candidate.user_id,
                })
            }
            Err(reason) => {
                debug!(
                    user_id = %user,
                    candidate = %candidate.user_id,
                    reason = %reason,
                    "claim abandoned, joining waiting list"
                );
                self.wait(user).await
            }
        }
    }

    /// First non-ghost ticket in scan order. Ghosts seen before it are
    /// evicted; tickets after it are left alone.
    async fn pick_live(&self, candidates: Vec<WaitingTicket>) -> Option<WaitingTicket> {
        for ticket in candidates {
            if self.queue.is_ghost(&ticket, self.config.ghost_threshold) {
                self.queue.evict_ghost(&ticket).await;
                continue;
            }
            return Some(ticket);
        }
        None
    }

    async fn claim(
        &self,
        user: &UserId,
        candidate: &WaitingTicket,
    ) -> std::result::Result<SessionId, ClaimAbort> {
        let mut tx = self.store.begin().await?;

        let Some(ticket) = tx.get_ticket(&candidate.user_id).await? else {
            return Err(ClaimAbort::CandidateGone);
        };
        tx.delete_ticket(&ticket.user_id);

        if ticket.user_id == *user {
            return Err(ClaimAbort::SelfMatch(ticket.user_id));
        }

        let session = Session::open(user.clone(), ticket.user_id, self.clock.now());
        let session_id = session.id.clone();
        tx.create_session(session);
        tx.commit().await?;

        Ok(session_id)
    }

    async fn wait(&self, user: &UserId) -> Result<JoinOutcome> {
        self.queue.enqueue(user).await?;
        Ok(JoinOutcome::Waiting)
    }
}
