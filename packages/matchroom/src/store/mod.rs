//! Document store capability.
//!
//! The matchmaking core coordinates exclusively through a shared document
//! store. It never assumes a backing technology; it only needs:
//!
//! - keyed get / upsert / update / delete on the two collections
//! - a bounded query over waiting tickets
//! - real-time subscriptions yielding full snapshots
//! - a transaction with read tracking and all-or-nothing commit
//!
//! # Concurrency
//!
//! Transactions use optimistic concurrency. Every document read inside a
//! [`StoreTransaction`] is checked again at commit; if any of them changed
//! (including being deleted or re-created) the commit fails with
//! [`StoreError::Conflict`] and none of the buffered writes apply.
//!
//! # Subscriptions
//!
//! Streams start with the current snapshot and then yield a new snapshot for
//! every committed change to the watched document or query, in the store's
//! commit order for that document.

mod memory;

pub use memory::{FailPoint, InMemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::StoreError;
use crate::model::{Message, Role, Session, SessionId, SessionStatus, UserId, WaitingTicket};

/// Collection holding waiting tickets, keyed by user id.
pub const WAITING_COLLECTION: &str = "waiting_users";

/// Collection holding sessions, keyed by session id.
pub const SESSION_COLLECTION: &str = "conversations";

/// A stream of full snapshots.
pub type SnapshotStream<T> = BoxStream<'static, Result<T, StoreError>>;

// =============================================================================
// Revision
// =============================================================================

/// Per-document revision for optimistic concurrency control.
///
/// - [`Revision::NONE`] means the document was never written.
/// - Every write or delete advances the revision, so a document that was
///   deleted and re-created does not compare equal to the original.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    /// Sentinel value for a document that has never been written.
    pub const NONE: Revision = Revision(0);

    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

// =============================================================================
// Session Update
// =============================================================================

/// How an update touches the `messages` array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagesPatch {
    /// Overwrite the whole sequence (read-modify-write).
    Replace(Vec<Message>),
    /// Append atomically on the store side.
    Append(Vec<Message>),
}

/// A partial update of a session document. Unset fields are left untouched.
///
/// The participant pair is not updatable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub messages: Option<MessagesPatch>,
    pub left_a: Option<bool>,
    pub left_b: Option<bool>,
    pub status: Option<SessionStatus>,
}

impl SessionUpdate {
    pub fn set_left(&mut self, role: Role) {
        match role {
            Role::A => self.left_a = Some(true),
            Role::B => self.left_b = Some(true),
        }
    }

    /// Apply this update to a session.
    ///
    /// Left-flags only ever go from `false` to `true`, and an `Ended` session
    /// never returns to `Active`.
    pub fn apply_to(self, session: &mut Session) {
        match self.messages {
            Some(MessagesPatch::Replace(messages)) => session.messages = messages,
            Some(MessagesPatch::Append(mut messages)) => session.messages.append(&mut messages),
            None => {}
        }
        if let Some(left) = self.left_a {
            session.left_a |= left;
        }
        if let Some(left) = self.left_b {
            session.left_b |= left;
        }
        if let Some(status) = self.status {
            if session.status != SessionStatus::Ended {
                session.status = status;
            }
        }
    }
}

// =============================================================================
// Store Traits
// =============================================================================

/// The shared document store the coordination protocol runs on.
#[async_trait]
pub trait DocumentStore: Send + Sync + 'static {
    /// Read a waiting ticket by user id.
    async fn get_ticket(&self, user: &UserId) -> Result<Option<WaitingTicket>, StoreError>;

    /// Upsert a ticket keyed by its user id. At most one ticket per user exists.
    async fn put_ticket(&self, ticket: WaitingTicket) -> Result<(), StoreError>;

    /// Refresh `lastSeen` on an existing ticket.
    ///
    /// Returns [`StoreError::NotFound`] if the ticket no longer exists.
    async fn touch_ticket(&self, user: &UserId, last_seen: DateTime<Utc>)
        -> Result<(), StoreError>;

    /// Delete a ticket. Deleting a missing ticket is not an error.
    async fn delete_ticket(&self, user: &UserId) -> Result<(), StoreError>;

    /// Return up to `limit` tickets in store-defined order.
    async fn scan_tickets(&self, limit: usize) -> Result<Vec<WaitingTicket>, StoreError>;

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError>;

    /// Apply a partial update to a session.
    ///
    /// Returns [`StoreError::NotFound`] if the session does not exist.
    async fn update_session(&self, id: &SessionId, update: SessionUpdate)
        -> Result<(), StoreError>;

    /// Subscribe to one session document. `None` means it does not exist.
    fn watch_session(&self, id: &SessionId) -> SnapshotStream<Option<Session>>;

    /// Subscribe to the active sessions where `user` sits in seat `role`.
    fn watch_active_sessions(&self, user: &UserId, role: Role) -> SnapshotStream<Vec<Session>>;

    /// Start a transaction.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// A single optimistic transaction.
///
/// Reads are tracked and re-validated at commit; writes are buffered and
/// applied together. Dropping a transaction without committing aborts it.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read a ticket and record its revision. Sees this transaction's own
    /// buffered deletes.
    async fn get_ticket(&mut self, user: &UserId) -> Result<Option<WaitingTicket>, StoreError>;

    fn delete_ticket(&mut self, user: &UserId);

    /// Create a session. Commit fails with a conflict if the id already exists.
    fn create_session(&mut self, session: Session);

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}
