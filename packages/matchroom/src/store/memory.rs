//! In-memory document store.
//!
//! Backs tests and the simulation binary. Documents live in ordered maps
//! behind a single mutex; every committed write is published on a broadcast
//! channel from which the subscription streams are built.
//!
//! Each operation yields to the scheduler once before touching state, the way
//! a round trip to a remote store would, so concurrently running clients
//! interleave at every store call.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::{
    DocumentStore, Revision, SessionUpdate, SnapshotStream, StoreTransaction, SESSION_COLLECTION,
    WAITING_COLLECTION,
};
use crate::error::StoreError;
use crate::model::{Role, Session, SessionId, UserId, WaitingTicket};

/// Change feed capacity. Lagging subscribers resynchronize from current state.
const CHANGE_CAPACITY: usize = 1024;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    GetTicket,
    PutTicket,
    TouchTicket,
    DeleteTicket,
    ScanTickets,
    GetSession,
    UpdateSession,
    Subscribe,
    Begin,
    Commit,
}

#[derive(Debug, Clone)]
enum Change {
    Ticket(UserId),
    Session {
        id: SessionId,
        snapshot: Option<Session>,
    },
}

#[derive(Default)]
struct State {
    tickets: BTreeMap<UserId, WaitingTicket>,
    ticket_revisions: HashMap<UserId, Revision>,
    sessions: BTreeMap<SessionId, Session>,
    session_revisions: HashMap<SessionId, Revision>,
}

impl State {
    fn ticket_revision(&self, user: &UserId) -> Revision {
        self.ticket_revisions
            .get(user)
            .copied()
            .unwrap_or(Revision::NONE)
    }

    fn bump_ticket(&mut self, user: &UserId) {
        let next = self.ticket_revision(user).next();
        self.ticket_revisions.insert(user.clone(), next);
    }

    fn bump_session(&mut self, id: &SessionId) {
        let next = self
            .session_revisions
            .get(id)
            .copied()
            .unwrap_or(Revision::NONE)
            .next();
        self.session_revisions.insert(id.clone(), next);
    }

    fn active_sessions(&self, user: &UserId, role: Role) -> Vec<Session> {
        self.sessions
            .values()
            .filter(|s| s.is_active() && s.participant(role) == user)
            .cloned()
            .collect()
    }
}

struct Inner {
    state: Mutex<State>,
    changes: broadcast::Sender<Change>,
    failures: Mutex<HashMap<FailPoint, usize>>,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|e| StoreError::backend(format!("mutex poisoned: {}", e)))
    }

    fn check(&self, point: FailPoint) -> Result<(), StoreError> {
        let mut failures = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match failures.get_mut(&point) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::backend(format!("injected failure at {:?}", point)))
            }
            _ => Ok(()),
        }
    }

    /// Publish a committed change. Must be called with the state lock held so
    /// subscribers observe changes in commit order.
    fn publish(&self, change: Change) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }

    async fn round_trip(&self, point: FailPoint) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        self.check(point)
    }
}

/// In-memory [`DocumentStore`] with revision-checked transactions.
///
/// Cloning shares the same underlying documents.
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
                failures: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Make the next call at `point` fail with a backend error.
    ///
    /// Calling this several times queues several failures.
    pub fn fail_next(&self, point: FailPoint) {
        let mut failures = self
            .inner
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *failures.entry(point).or_insert(0) += 1;
    }

    /// All tickets, in scan order.
    pub fn tickets(&self) -> Vec<WaitingTicket> {
        self.inner
            .lock()
            .map(|state| state.tickets.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All sessions, ordered by id.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner
            .lock()
            .map(|state| state.sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove a session document, as an external retention policy would.
    pub fn purge_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let mut state = self.inner.lock()?;
        let removed = state.sessions.remove(id).is_some();
        if removed {
            state.bump_session(id);
            self.inner.publish(Change::Session {
                id: id.clone(),
                snapshot: None,
            });
        }
        Ok(removed)
    }

    /// Dump both collections as JSON, keyed by document id.
    pub fn export(&self) -> Result<serde_json::Value, StoreError> {
        let state = self.inner.lock()?;
        let tickets: serde_json::Map<String, serde_json::Value> = state
            .tickets
            .iter()
            .map(|(id, ticket)| Ok((id.to_string(), serde_json::to_value(ticket)?)))
            .collect::<Result<_, serde_json::Error>>()
            .map_err(|e| StoreError::backend(e.to_string()))?;
        let sessions: serde_json::Map<String, serde_json::Value> = state
            .sessions
            .iter()
            .map(|(id, session)| Ok((id.to_string(), serde_json::to_value(session)?)))
            .collect::<Result<_, serde_json::Error>>()
            .map_err(|e| StoreError::backend(e.to_string()))?;

        Ok(json!({
            WAITING_COLLECTION: tickets,
            SESSION_COLLECTION: sessions,
        }))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get_ticket(&self, user: &UserId) -> Result<Option<WaitingTicket>, StoreError> {
        self.inner.round_trip(FailPoint::GetTicket).await?;
        let state = self.inner.lock()?;
        Ok(state.tickets.get(user).cloned())
    }

    async fn put_ticket(&self, ticket: WaitingTicket) -> Result<(), StoreError> {
        self.inner.round_trip(FailPoint::PutTicket).await?;
        let mut state = self.inner.lock()?;
        let user = ticket.user_id.clone();
        state.tickets.insert(user.clone(), ticket);
        state.bump_ticket(&user);
        self.inner.publish(Change::Ticket(user));
        Ok(())
    }

    async fn touch_ticket(
        &self,
        user: &UserId,
        last_seen: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.inner.round_trip(FailPoint::TouchTicket).await?;
        let mut state = self.inner.lock()?;
        let ticket = state
            .tickets
            .get_mut(user)
            .ok_or_else(|| StoreError::not_found(WAITING_COLLECTION, user.as_str()))?;
        ticket.last_seen = last_seen;
        state.bump_ticket(user);
        self.inner.publish(Change::Ticket(user.clone()));
        Ok(())
    }

    async fn delete_ticket(&self, user: &UserId) -> Result<(), StoreError> {
        self.inner.round_trip(FailPoint::DeleteTicket).await?;
        let mut state = self.inner.lock()?;
        if state.tickets.remove(user).is_some() {
            state.bump_ticket(user);
            self.inner.publish(Change::Ticket(user.clone()));
        }
        Ok(())
    }

    async fn scan_tickets(&self, limit: usize) -> Result<Vec<WaitingTicket>, StoreError> {
        self.inner.round_trip(FailPoint::ScanTickets).await?;
        let state = self.inner.lock()?;
        Ok(state.tickets.values().take(limit).cloned().collect())
    }

    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.inner.round_trip(FailPoint::GetSession).await?;
        let state = self.inner.lock()?;
        Ok(state.sessions.get(id).cloned())
    }

    async fn update_session(
        &self,
        id: &SessionId,
        update: SessionUpdate,
    ) -> Result<(), StoreError> {
        self.inner.round_trip(FailPoint::UpdateSession).await?;
        let mut state = self.inner.lock()?;
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| StoreError::not_found(SESSION_COLLECTION, id.as_str()))?;
        update.apply_to(session);
        let snapshot = session.clone();
        state.bump_session(id);
        self.inner.publish(Change::Session {
            id: id.clone(),
            snapshot: Some(snapshot),
        });
        Ok(())
    }

    fn watch_session(&self, id: &SessionId) -> SnapshotStream<Option<Session>> {
        if let Err(e) = self.inner.check(FailPoint::Subscribe) {
            return stream::once(async move { Err(e) }).boxed();
        }

        // Subscribe before reading so no commit falls between the two.
        let receiver = self.inner.changes.subscribe();
        let initial = self
            .inner
            .lock()
            .map(|state| state.sessions.get(id).cloned());

        let updates = stream::unfold(
            (receiver, Arc::clone(&self.inner), id.clone()),
            |(mut receiver, inner, id)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(Change::Session {
                            id: changed,
                            snapshot,
                        }) if changed == id => {
                            return Some((Ok(snapshot), (receiver, inner, id)));
                        }
                        Ok(_) => continue,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, session_id = %id, "session watcher lagged, resending current snapshot");
                            let current = inner.lock().map(|state| state.sessions.get(&id).cloned());
                            return Some((current, (receiver, inner, id)));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            },
        );

        stream::once(async move { initial }).chain(updates).boxed()
    }

    fn watch_active_sessions(&self, user: &UserId, role: Role) -> SnapshotStream<Vec<Session>> {
        if let Err(e) = self.inner.check(FailPoint::Subscribe) {
            return stream::once(async move { Err(e) }).boxed();
        }

        let receiver = self.inner.changes.subscribe();
        let initial = self
            .inner
            .lock()
            .map(|state| state.active_sessions(user, role));

        let updates = stream::unfold(
            (receiver, Arc::clone(&self.inner), user.clone()),
            move |(mut receiver, inner, user)| async move {
                loop {
                    let relevant = match receiver.recv().await {
                        Ok(Change::Session { snapshot, .. }) => snapshot
                            .as_ref()
                            .map_or(true, |s| s.participant(role) == &user),
                        Ok(Change::Ticket(_)) => false,
                        Err(RecvError::Lagged(missed)) => {
                            warn!(missed, user_id = %user, "session query lagged, recomputing");
                            true
                        }
                        Err(RecvError::Closed) => return None,
                    };
                    if relevant {
                        let current = inner.lock().map(|state| state.active_sessions(&user, role));
                        return Some((current, (receiver, inner, user)));
                    }
                }
            },
        );

        stream::once(async move { initial }).chain(updates).boxed()
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        self.inner.round_trip(FailPoint::Begin).await?;
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            reads: HashMap::new(),
            deletes: Vec::new(),
            creates: Vec::new(),
        }))
    }
}

// =============================================================================
// Transaction
// =============================================================================

struct MemoryTransaction {
    inner: Arc<Inner>,
    reads: HashMap<UserId, Revision>,
    deletes: Vec<UserId>,
    creates: Vec<Session>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get_ticket(&mut self, user: &UserId) -> Result<Option<WaitingTicket>, StoreError> {
        self.inner.round_trip(FailPoint::GetTicket).await?;
        if self.deletes.contains(user) {
            return Ok(None);
        }
        let state = self.inner.lock()?;
        let revision = state.ticket_revision(user);
        self.reads.entry(user.clone()).or_insert(revision);
        Ok(state.tickets.get(user).cloned())
    }

    fn delete_ticket(&mut self, user: &UserId) {
        if !self.deletes.contains(user) {
            self.deletes.push(user.clone());
        }
    }

    fn create_session(&mut self, session: Session) {
        self.creates.push(session);
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction {
            inner,
            reads,
            deletes,
            creates,
        } = *self;

        inner.round_trip(FailPoint::Commit).await?;
        let mut state = inner.lock()?;

        // Validate everything before applying anything.
        for (user, seen) in &reads {
            let current = state.ticket_revision(user);
            if current != *seen {
                debug!(user_id = %user, %seen, %current, "stale read, aborting transaction");
                return Err(StoreError::Conflict);
            }
        }
        if let Some(existing) = creates.iter().find(|s| state.sessions.contains_key(&s.id)) {
            debug!(session_id = %existing.id, "session already exists, aborting transaction");
            return Err(StoreError::Conflict);
        }

        for user in deletes {
            if state.tickets.remove(&user).is_some() {
                state.bump_ticket(&user);
                inner.publish(Change::Ticket(user));
            }
        }
        for session in creates {
            let id = session.id.clone();
            state.bump_session(&id);
            state.sessions.insert(id.clone(), session.clone());
            inner.publish(Change::Session {
                id,
                snapshot: Some(session),
            });
        }

        Ok(())
    }
}
