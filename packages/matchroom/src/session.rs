//! Session lifecycle: opening, composing messages and leaving.
//!
//! A session is `Active` from creation until both participants have left,
//! at which point it becomes `Ended` for good. Each participant only ever
//! writes its own left-flag; the second leaver ends the session in the same
//! update that sets its flag.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::AppendMode;
use crate::error::{MatchError, Result};
use crate::model::{Message, Session, SessionId, SessionStatus, UserId};
use crate::store::{DocumentStore, MessagesPatch, SessionUpdate};

/// Seeded as the first message of every new session.
pub const CONNECTED_TEXT: &str = "You are now connected! Say hello.";

/// Appended when a participant leaves.
pub const LEFT_TEXT: &str = "User has left the chat.";

/// Shown locally once a session is observed as ended.
pub const CLOSED_TEXT: &str = "Chat closed. Both users have disconnected.";

impl Session {
    /// A fresh active session between the claiming user (`initiator`, seat A)
    /// and the claimed waiter (seat B).
    pub fn open(initiator: UserId, claimed: UserId, now: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::for_pair(&initiator, &claimed, now),
            participant_a: initiator,
            participant_b: claimed,
            status: SessionStatus::Active,
            left_a: false,
            left_b: false,
            messages: vec![Message::system(CONNECTED_TEXT, now)],
            created_at: now,
        }
    }
}

/// Build a user message for `session`, or `None` if the text is blank or the
/// session no longer accepts messages.
pub fn compose_message(
    status: SessionStatus,
    sender: &UserId,
    text: &str,
    now: DateTime<Utc>,
) -> Option<Message> {
    let text = text.trim();
    if text.is_empty() || status != SessionStatus::Active {
        return None;
    }
    Some(Message::from_user(sender.clone(), text, now))
}

/// Compute the update for `user` leaving `session`.
///
/// Returns `Ok(None)` if the user already left or the session has ended.
/// In read-modify-write mode the departure notice is written back together
/// with the messages in `session`; in atomic mode it is appended.
pub fn leave_update(
    session: &Session,
    user: &UserId,
    now: DateTime<Utc>,
    mode: AppendMode,
) -> Result<Option<SessionUpdate>> {
    let role = session
        .role_of(user)
        .ok_or_else(|| MatchError::NotParticipant {
            user: user.clone(),
            session: session.id.clone(),
        })?;

    if !session.is_active() || session.has_left(role) {
        return Ok(None);
    }

    let notice = Message::system(LEFT_TEXT, now);
    let mut update = SessionUpdate {
        messages: Some(match mode {
            AppendMode::ReadModifyWrite => {
                let mut messages = session.messages.clone();
                messages.push(notice);
                MessagesPatch::Replace(messages)
            }
            AppendMode::Atomic => MessagesPatch::Append(vec![notice]),
        }),
        ..Default::default()
    };
    update.set_left(role);
    if session.has_left(role.other()) {
        update.status = Some(SessionStatus::Ended);
    }

    Ok(Some(update))
}

/// Result of a leave request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The left-flag was written. `ended` is set if this closed the session.
    Left { ended: bool },
    /// The user had already left, or the session was already over.
    AlreadyLeft,
    /// The session document no longer exists.
    Gone,
}

/// Store-backed session operations.
#[derive(Clone)]
pub struct SessionService {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    append_mode: AppendMode,
}

impl SessionService {
    pub fn new(store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>, append_mode: AppendMode) -> Self {
        Self {
            store,
            clock,
            append_mode,
        }
    }

    /// Mark `user` as having left session `id`, ending it if the partner
    /// already left.
    pub async fn leave(&self, id: &SessionId, user: &UserId) -> Result<LeaveOutcome> {
        let Some(session) = self.store.get_session(id).await? else {
            debug!(session_id = %id, user_id = %user, "leave on missing session");
            return Ok(LeaveOutcome::Gone);
        };

        let Some(update) = leave_update(&session, user, self.clock.now(), self.append_mode)? else {
            return Ok(LeaveOutcome::AlreadyLeft);
        };
        let mut ended = update.status == Some(SessionStatus::Ended);

        match self.store.update_session(id, update).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(LeaveOutcome::Gone),
            Err(e) => return Err(e.into()),
        }

        if !ended {
            ended = self.close_if_abandoned(id).await?;
        }

        info!(session_id = %id, user_id = %user, ended, "left session");
        Ok(LeaveOutcome::Left { ended })
    }

    /// End a session whose participants both left from the same snapshot.
    ///
    /// Each of two simultaneous leavers sees the other still present, so
    /// neither sets the status. Whoever looks again afterwards closes it.
    async fn close_if_abandoned(&self, id: &SessionId) -> Result<bool> {
        let Some(session) = self.store.get_session(id).await? else {
            return Ok(false);
        };
        if !(session.is_active() && session.left_a && session.left_b) {
            return Ok(false);
        }

        debug!(session_id = %id, "both participants left concurrently, closing");
        let update = SessionUpdate {
            status: Some(SessionStatus::Ended),
            ..Default::default()
        };
        match self.store.update_session(id, update).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{Role, Sender};
    use crate::store::{InMemoryStore, StoreTransaction};

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    async fn open(store: &InMemoryStore, now: DateTime<Utc>) -> Session {
        let session = Session::open(alice(), bob(), now);
        let mut tx = store.begin().await.unwrap();
        tx.create_session(session.clone());
        tx.commit().await.unwrap();
        session
    }

    fn service(store: &InMemoryStore, clock: &ManualClock, mode: AppendMode) -> SessionService {
        SessionService::new(Arc::new(store.clone()), Arc::new(clock.clone()), mode)
    }

    #[test]
    fn test_open_seeds_connected_message() {
        let session = Session::open(alice(), bob(), Utc::now());

        assert!(session.is_active());
        assert_eq!(session.participant(Role::A), &alice());
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].sender_id, Sender::System);
        assert_eq!(session.messages[0].text, CONNECTED_TEXT);
    }

    #[test]
    fn test_compose_rejects_blank_and_inactive() {
        let now = Utc::now();
        assert!(compose_message(SessionStatus::Active, &alice(), "   ", now).is_none());
        assert!(compose_message(SessionStatus::Ended, &alice(), "hi", now).is_none());

        let message = compose_message(SessionStatus::Active, &alice(), "  hi  ", now).unwrap();
        assert_eq!(message.text, "hi");
    }

    #[test]
    fn test_leave_update_rejects_outsider() {
        let session = Session::open(alice(), bob(), Utc::now());

        let err = leave_update(&session, &UserId::new("mallory"), Utc::now(), AppendMode::default())
            .unwrap_err();

        assert!(matches!(err, MatchError::NotParticipant { .. }));
    }

    #[test]
    fn test_second_leaver_ends_session() {
        let mut session = Session::open(alice(), bob(), Utc::now());
        session.left_a = true;

        let update = leave_update(&session, &bob(), Utc::now(), AppendMode::default())
            .unwrap()
            .unwrap();

        assert_eq!(update.left_b, Some(true));
        assert_eq!(update.status, Some(SessionStatus::Ended));
    }

    #[tokio::test]
    async fn test_leave_a_then_b() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let session = open(&store, clock.now()).await;
        let service = service(&store, &clock, AppendMode::ReadModifyWrite);

        assert_eq!(
            service.leave(&session.id, &alice()).await.unwrap(),
            LeaveOutcome::Left { ended: false }
        );
        let after_a = store.get_session(&session.id).await.unwrap().unwrap();
        assert!(after_a.left_a && !after_a.left_b);
        assert!(after_a.is_active());
        assert_eq!(after_a.messages.last().unwrap().text, LEFT_TEXT);

        assert_eq!(
            service.leave(&session.id, &bob()).await.unwrap(),
            LeaveOutcome::Left { ended: true }
        );
        let after_b = store.get_session(&session.id).await.unwrap().unwrap();
        assert!(after_b.left_a && after_b.left_b);
        assert_eq!(after_b.status, SessionStatus::Ended);
        assert_eq!(after_b.messages.len(), 3);
    }

    #[tokio::test]
    async fn test_leave_twice_is_noop() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let session = open(&store, clock.now()).await;
        let service = service(&store, &clock, AppendMode::Atomic);

        service.leave(&session.id, &alice()).await.unwrap();
        assert_eq!(
            service.leave(&session.id, &alice()).await.unwrap(),
            LeaveOutcome::AlreadyLeft
        );

        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_simultaneous_leaves_still_end_session() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();
        let session = open(&store, clock.now()).await;
        let service = service(&store, &clock, AppendMode::Atomic);

        let (alice, bob) = (alice(), bob());
        let (a, b) = tokio::join!(
            service.leave(&session.id, &alice),
            service.leave(&session.id, &bob)
        );
        assert!(matches!(a.unwrap(), LeaveOutcome::Left { .. }));
        assert!(matches!(b.unwrap(), LeaveOutcome::Left { .. }));

        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert!(stored.left_a && stored.left_b);
        assert_eq!(stored.status, SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_leave_missing_session_is_gone() {
        let store = InMemoryStore::new();
        let clock = ManualClock::default();

        let outcome = service(&store, &clock, AppendMode::default())
            .leave(&SessionId::from("nope"), &alice())
            .await
            .unwrap();

        assert_eq!(outcome, LeaveOutcome::Gone);
    }
}
