//! Per-participant view of a session's messages and the send path.
//!
//! Sending is split in two so callers can release their own locks across the
//! store round trip: [`MessageChannel::stage`] appends optimistically and
//! returns a [`PendingSend`], whose [`deliver`](PendingSend::deliver) performs
//! the write.
//!
//! In [`AppendMode::ReadModifyWrite`] the write carries the sender's whole
//! last-known sequence. If both participants send from the same snapshot the
//! later write wins and the earlier message is lost from the document; it
//! remains only in the sender's local view until the next snapshot arrives.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::AppendMode;
use crate::error::StoreError;
use crate::model::{sort_for_display, Message, Session, SessionId, SessionStatus, UserId};
use crate::session::compose_message;
use crate::store::{DocumentStore, MessagesPatch, SessionUpdate};

pub struct MessageChannel {
    session_id: SessionId,
    user: UserId,
    messages: Vec<Message>,
    status: SessionStatus,
    append_mode: AppendMode,
}

impl MessageChannel {
    pub fn new(session_id: SessionId, user: UserId, append_mode: AppendMode) -> Self {
        Self {
            session_id,
            user,
            messages: Vec::new(),
            status: SessionStatus::Active,
            append_mode,
        }
    }

    /// Messages in display order.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Replace the local view with a store snapshot.
    pub fn reconcile(&mut self, session: &Session) {
        self.messages = session.messages.clone();
        sort_for_display(&mut self.messages);
        self.status = session.status;
    }

    /// Add a message that exists only locally.
    pub fn push_local(&mut self, message: Message) {
        self.messages.push(message);
        sort_for_display(&mut self.messages);
    }

    /// Append `text` locally and prepare the store write.
    ///
    /// Returns `None` (and changes nothing) if the text is blank or the
    /// session is no longer active.
    pub fn stage(&mut self, text: &str, now: DateTime<Utc>) -> Option<PendingSend> {
        let message = compose_message(self.status, &self.user, text, now)?;

        let patch = match self.append_mode {
            AppendMode::ReadModifyWrite => {
                let mut all = self.messages.clone();
                all.push(message.clone());
                MessagesPatch::Replace(all)
            }
            AppendMode::Atomic => MessagesPatch::Append(vec![message.clone()]),
        };
        self.push_local(message.clone());

        Some(PendingSend {
            session_id: self.session_id.clone(),
            message,
            update: SessionUpdate {
                messages: Some(patch),
                ..Default::default()
            },
        })
    }

    /// Stage and deliver in one step.
    ///
    /// On failure the optimistic message stays in the local view.
    pub async fn send(
        &mut self,
        store: &dyn DocumentStore,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>, StoreError> {
        match self.stage(text, now) {
            Some(pending) => pending.deliver(store).await.map(Some),
            None => Ok(None),
        }
    }
}

/// A staged message awaiting its store write.
#[derive(Debug)]
pub struct PendingSend {
    session_id: SessionId,
    message: Message,
    update: SessionUpdate,
}

impl PendingSend {
    pub fn message(&self) -> &Message {
        &self.message
    }

    pub async fn deliver(self, store: &dyn DocumentStore) -> Result<Message, StoreError> {
        store.update_session(&self.session_id, self.update).await?;
        debug!(session_id = %self.session_id, sender = %self.message.sender_id, "message sent");
        Ok(self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::model::Sender;
    use crate::store::{FailPoint, InMemoryStore};

    async fn open(store: &InMemoryStore, now: DateTime<Utc>) -> Session {
        let session = Session::open(UserId::new("alice"), UserId::new("bob"), now);
        let mut tx = store.begin().await.unwrap();
        tx.create_session(session.clone());
        tx.commit().await.unwrap();
        session
    }

    fn channel(session: &Session, user: &str, mode: AppendMode) -> MessageChannel {
        let mut channel = MessageChannel::new(session.id.clone(), UserId::new(user), mode);
        channel.reconcile(session);
        channel
    }

    fn later(base: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
        base + chrono::Duration::from_std(Duration::from_secs(secs)).unwrap()
    }

    #[tokio::test]
    async fn test_send_writes_full_sequence() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let session = open(&store, now).await;
        let mut alice = channel(&session, "alice", AppendMode::ReadModifyWrite);

        let sent = alice.send(&store, " hello ", later(now, 1)).await.unwrap();

        assert_eq!(sent.unwrap().text, "hello");
        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 2);
        assert_eq!(alice.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_blank_send_is_noop() {
        let store = InMemoryStore::new();
        let session = open(&store, Utc::now()).await;
        let mut alice = channel(&session, "alice", AppendMode::ReadModifyWrite);

        assert_eq!(alice.send(&store, "   ", Utc::now()).await.unwrap(), None);
        assert_eq!(alice.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_send_on_ended_session_is_noop() {
        let store = InMemoryStore::new();
        let mut session = open(&store, Utc::now()).await;
        session.status = SessionStatus::Ended;
        let mut alice = channel(&session, "alice", AppendMode::ReadModifyWrite);

        assert_eq!(alice.status(), SessionStatus::Ended);
        assert!(alice.stage("hi", Utc::now()).is_none());
    }

    #[tokio::test]
    async fn test_failed_send_keeps_optimistic_message() {
        let store = InMemoryStore::new();
        let session = open(&store, Utc::now()).await;
        let mut alice = channel(&session, "alice", AppendMode::ReadModifyWrite);
        store.fail_next(FailPoint::UpdateSession);

        assert!(alice.send(&store, "hello", Utc::now()).await.is_err());

        assert_eq!(alice.messages().len(), 2);
        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_read_modify_write_loses_a_message() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let session = open(&store, now).await;
        let mut alice = channel(&session, "alice", AppendMode::ReadModifyWrite);
        let mut bob = channel(&session, "bob", AppendMode::ReadModifyWrite);

        let from_alice = alice.stage("from alice", later(now, 1)).unwrap();
        let from_bob = bob.stage("from bob", later(now, 2)).unwrap();
        assert_eq!(from_alice.message().sender_id, Sender::User(UserId::new("alice")));
        from_alice.deliver(&store).await.unwrap();
        from_bob.deliver(&store).await.unwrap();

        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        let texts: Vec<_> = stored.messages.iter().map(|m| m.text.as_str()).collect();
        assert!(texts.contains(&"from bob"));
        assert!(!texts.contains(&"from alice"));
    }

    #[tokio::test]
    async fn test_atomic_append_keeps_both_messages() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let session = open(&store, now).await;
        let mut alice = channel(&session, "alice", AppendMode::Atomic);
        let mut bob = channel(&session, "bob", AppendMode::Atomic);

        let from_alice = alice.stage("from alice", later(now, 1)).unwrap();
        let from_bob = bob.stage("from bob", later(now, 2)).unwrap();
        from_alice.deliver(&store).await.unwrap();
        from_bob.deliver(&store).await.unwrap();

        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 3);
    }

    #[test]
    fn test_reconcile_sorts_by_timestamp() {
        let now = Utc::now();
        let mut session = Session::open(UserId::new("alice"), UserId::new("bob"), now);
        session.messages.insert(
            0,
            Message::from_user(UserId::new("bob"), "late", later(now, 5)),
        );
        let mut alice = MessageChannel::new(session.id.clone(), UserId::new("alice"), AppendMode::default());

        alice.reconcile(&session);

        assert_eq!(alice.messages().last().unwrap().text, "late");
    }
}
