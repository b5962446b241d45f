//! Match listener: notices when a waiting user has been claimed.
//!
//! The claimer creates the session, so the claimed user only learns about it
//! through a subscription. Both seats are watched because the store has no
//! disjunctive query.

use std::future::Future;

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::StoreError;
use crate::model::{Role, SessionId, UserId};
use crate::store::DocumentStore;

/// An active session that includes the waiting user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchFound {
    pub session_id: SessionId,
    pub partner: UserId,
}

/// Wait until `user` shows up in an active session in either seat.
///
/// The first snapshot holding a session the user has not left wins. An error from either subscription ends
/// the wait.
pub async fn next_match(store: &dyn DocumentStore, user: &UserId) -> Result<MatchFound, StoreError> {
    let as_a = store.watch_active_sessions(user, Role::A);
    let as_b = store.watch_active_sessions(user, Role::B);
    let mut merged = stream::select(as_a, as_b);

    while let Some(snapshot) = merged.next().await {
        let sessions = snapshot?;
        let found = sessions.into_iter().find_map(|session| {
            // A session this user already walked out of stays active until
            // the partner leaves too.
            if session.has_left(session.role_of(user)?) {
                return None;
            }
            let partner = session.partner_of(user)?.clone();
            Some(MatchFound {
                session_id: session.id,
                partner,
            })
        });
        if let Some(found) = found {
            debug!(user_id = %user, session_id = %found.session_id, "match observed");
            return Ok(found);
        }
    }

    Err(StoreError::backend("session subscription closed"))
}

/// A cancellable background task. Dropping the handle cancels the task.
pub struct ListenerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ListenerHandle {
    /// Spawn `task`, racing it against cancellation.
    pub fn spawn<F>(task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = task => {}
            }
        });
        Self { cancel, handle }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
