//! Per-user chat client.
//!
//! `ChatClient` owns one user's view of the world and drives it through
//! `Idle → Joining → Waiting → Chatting → Ended → Idle`. User actions run on
//! the caller's task; store subscriptions and the presence heartbeat run on
//! background tasks that report back into the same state.
//!
//! # Stale events
//!
//! Every transition bumps an epoch. Background tasks remember the epoch they
//! were started under and their events are dropped once it has moved on, so a
//! late snapshot from a session the user already left can never drag the
//! client back into it.

use std::fmt;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::channel::MessageChannel;
use crate::clock::{Clock, SystemClock};
use crate::config::MatchConfig;
use crate::error::{MatchError, Result, StoreError};
use crate::identity::IdentityProvider;
use crate::listener::{next_match, ListenerHandle, MatchFound};
use crate::matchmaker::{JoinOutcome, Matchmaker};
use crate::model::{Message, Session, SessionId, UserId};
use crate::presence::PresenceHandle;
use crate::session::{SessionService, CLOSED_TEXT};
use crate::store::DocumentStore;

pub const JOIN_FAILED_TEXT: &str = "Error joining.";
pub const SEND_FAILED_TEXT: &str = "Failed to send.";
pub const LEAVE_FAILED_TEXT: &str = "Failed to leave.";
pub const CONNECTION_ERROR_TEXT: &str = "Real-time connection error.";

/// Suffix appended to the partner's id once they have left.
pub const DISCONNECTED_SUFFIX: &str = " (disconnected)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientStatus {
    Idle,
    Joining,
    Waiting,
    Chatting,
    Ended,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientStatus::Idle => "idle",
            ClientStatus::Joining => "joining",
            ClientStatus::Waiting => "waiting",
            ClientStatus::Chatting => "chatting",
            ClientStatus::Ended => "ended",
        };
        f.write_str(s)
    }
}

/// What a user interface renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    pub user_id: UserId,
    pub status: ClientStatus,
    pub session_id: Option<SessionId>,
    pub partner: Option<UserId>,
    pub partner_left: bool,
    /// In display order.
    pub messages: Vec<Message>,
    /// Last user-visible failure, cleared by the next successful action.
    pub error: Option<String>,
}

impl ClientView {
    fn idle(user_id: UserId) -> Self {
        Self {
            user_id,
            status: ClientStatus::Idle,
            session_id: None,
            partner: None,
            partner_left: false,
            messages: Vec::new(),
            error: None,
        }
    }

    /// The partner id as shown to the user.
    pub fn partner_display(&self) -> Option<String> {
        self.partner.as_ref().map(|partner| {
            if self.partner_left {
                format!("{}{}", partner, DISCONNECTED_SUFFIX)
            } else {
                partner.to_string()
            }
        })
    }
}

// =============================================================================
// State
// =============================================================================

struct ClientState {
    status: ClientStatus,
    epoch: u64,
    session_id: Option<SessionId>,
    partner: Option<UserId>,
    partner_left: bool,
    channel: Option<MessageChannel>,
    error: Option<String>,
    presence: Option<PresenceHandle>,
    match_listener: Option<ListenerHandle>,
    session_listener: Option<ListenerHandle>,
    grace_timer: Option<ListenerHandle>,
}

impl ClientState {
    fn new() -> Self {
        Self {
            status: ClientStatus::Idle,
            epoch: 0,
            session_id: None,
            partner: None,
            partner_left: false,
            channel: None,
            error: None,
            presence: None,
            match_listener: None,
            session_listener: None,
            grace_timer: None,
        }
    }

    fn advance_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    fn is_current(&self, epoch: u64, status: ClientStatus) -> bool {
        self.epoch == epoch && self.status == status
    }

    fn stop_waiting(&mut self) {
        if let Some(presence) = self.presence.take() {
            presence.stop();
        }
        if let Some(listener) = self.match_listener.take() {
            listener.stop();
        }
    }

    fn stop_session(&mut self) {
        if let Some(listener) = self.session_listener.take() {
            listener.stop();
        }
        if let Some(timer) = self.grace_timer.take() {
            timer.stop();
        }
    }

    /// Back to idle, with every background task stopped.
    fn reset(&mut self) {
        self.stop_waiting();
        self.stop_session();
        self.status = ClientStatus::Idle;
        self.session_id = None;
        self.partner = None;
        self.partner_left = false;
        self.channel = None;
        self.error = None;
        self.advance_epoch();
    }

    fn view(&self, user_id: &UserId) -> ClientView {
        ClientView {
            user_id: user_id.clone(),
            status: self.status,
            session_id: self.session_id.clone(),
            partner: self.partner.clone(),
            partner_left: self.partner_left,
            messages: self
                .channel
                .as_ref()
                .map(|c| c.messages().to_vec())
                .unwrap_or_default(),
            error: self.error.clone(),
        }
    }
}

struct ClientInner {
    user: UserId,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: MatchConfig,
    matchmaker: Matchmaker,
    sessions: SessionService,
    state: Mutex<ClientState>,
    view: watch::Sender<ClientView>,
}

impl ClientInner {
    fn publish(&self, state: &ClientState) {
        self.view.send_replace(state.view(&self.user));
    }

    fn enter_waiting(self: &Arc<Self>, state: &mut ClientState) {
        state.status = ClientStatus::Waiting;
        let epoch = state.advance_epoch();

        state.presence = Some(PresenceHandle::start(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.user.clone(),
            self.config.heartbeat_interval,
        ));

        let weak = Arc::downgrade(self);
        let store = Arc::clone(&self.store);
        let user = self.user.clone();
        state.match_listener = Some(ListenerHandle::spawn(async move {
            let result = next_match(store.as_ref(), &user).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_match(epoch, result).await;
            }
        }));

        info!(user_id = %self.user, "waiting for a partner");
    }

    fn enter_chatting(self: &Arc<Self>, state: &mut ClientState, session_id: SessionId, partner: UserId) {
        state.status = ClientStatus::Chatting;
        let epoch = state.advance_epoch();
        state.channel = Some(MessageChannel::new(
            session_id.clone(),
            self.user.clone(),
            self.config.append_mode,
        ));
        state.session_id = Some(session_id.clone());
        state.partner = Some(partner.clone());
        state.partner_left = false;

        let weak = Arc::downgrade(self);
        let mut snapshots = self.store.watch_session(&session_id);
        state.session_listener = Some(ListenerHandle::spawn(async move {
            while let Some(snapshot) = snapshots.next().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.on_session_snapshot(epoch, snapshot).await {
                    return;
                }
            }
        }));

        info!(user_id = %self.user, partner = %partner, session_id = %session_id, "chatting");
    }

    async fn on_match(self: &Arc<Self>, epoch: u64, result: std::result::Result<MatchFound, StoreError>) {
        let mut state = self.state.lock().await;
        if !state.is_current(epoch, ClientStatus::Waiting) {
            debug!(user_id = %self.user, "ignoring stale match event");
            return;
        }

        match result {
            Ok(found) => {
                // Claims delete the ticket themselves; this covers a match that
                // arrived some other way. Runs before the listener is stopped.
                if let Err(e) = self.matchmaker.queue().cancel(&self.user).await {
                    warn!(user_id = %self.user, error = %e, "failed to remove ticket after match");
                }
                state.stop_waiting();
                self.enter_chatting(&mut state, found.session_id, found.partner);
            }
            Err(e) => {
                state.stop_waiting();
                warn!(user_id = %self.user, error = %e, "match subscription failed, leaving waiting list");
                state.reset();
                state.error = Some(CONNECTION_ERROR_TEXT.to_string());
                // This task is cancelled by the reset, so the cleanup runs on its own.
                let queue = self.matchmaker.queue().clone();
                let user = self.user.clone();
                tokio::spawn(async move {
                    if let Err(e) = queue.cancel(&user).await {
                        warn!(user_id = %user, error = %e, "failed to remove ticket");
                    }
                });
            }
        }
        self.publish(&state);
    }

    /// Apply a session snapshot. Returns whether the listener should keep going.
    async fn on_session_snapshot(
        self: &Arc<Self>,
        epoch: u64,
        snapshot: std::result::Result<Option<Session>, StoreError>,
    ) -> bool {
        let mut state = self.state.lock().await;
        if !state.is_current(epoch, ClientStatus::Chatting) {
            return false;
        }

        let keep_going = match snapshot {
            Err(e) => {
                warn!(user_id = %self.user, error = %e, "session subscription failed");
                state.reset();
                state.error = Some(CONNECTION_ERROR_TEXT.to_string());
                false
            }
            Ok(None) => {
                info!(user_id = %self.user, "session no longer exists");
                state.reset();
                false
            }
            Ok(Some(session)) if !session.is_active() => {
                let now = self.clock.now();
                if let Some(channel) = state.channel.as_mut() {
                    channel.reconcile(&session);
                    channel.push_local(Message::system(CLOSED_TEXT, now));
                }
                state.partner_left = true;
                state.status = ClientStatus::Ended;
                let epoch = state.advance_epoch();
                if let Some(listener) = state.session_listener.take() {
                    listener.stop();
                }
                state.grace_timer = Some(self.start_grace_timer(epoch));
                info!(user_id = %self.user, session_id = %session.id, "session ended");
                false
            }
            Ok(Some(session)) => {
                let partner_gone = session
                    .role_of(&self.user)
                    .is_some_and(|role| session.has_left(role.other()));
                if partner_gone && !state.partner_left {
                    state.partner_left = true;
                    info!(user_id = %self.user, session_id = %session.id, "partner left");
                }
                if let Some(channel) = state.channel.as_mut() {
                    channel.reconcile(&session);
                }
                true
            }
        };

        self.publish(&state);
        keep_going
    }

    fn start_grace_timer(self: &Arc<Self>, epoch: u64) -> ListenerHandle {
        let weak = Arc::downgrade(self);
        let grace = self.config.ended_grace;
        ListenerHandle::spawn(async move {
            tokio::time::sleep(grace).await;
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock().await;
                if state.is_current(epoch, ClientStatus::Ended) {
                    state.reset();
                    inner.publish(&state);
                    debug!(user_id = %inner.user, "back to idle after session end");
                }
            }
        })
    }
}

// =============================================================================
// Client
// =============================================================================

/// One user's connection to the matchmaking system.
///
/// Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    /// Sign in and return an idle client. Authentication failure is fatal.
    pub async fn connect(
        identity: &dyn IdentityProvider,
        store: Arc<dyn DocumentStore>,
        config: MatchConfig,
    ) -> Result<Self> {
        Self::connect_with_clock(identity, store, Arc::new(SystemClock), config).await
    }

    pub async fn connect_with_clock(
        identity: &dyn IdentityProvider,
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        config: MatchConfig,
    ) -> Result<Self> {
        let user = identity.ensure_signed_in().await?;
        let matchmaker = Matchmaker::new(Arc::clone(&store), Arc::clone(&clock), config.clone());
        let sessions = SessionService::new(Arc::clone(&store), Arc::clone(&clock), config.append_mode);
        let (view, _) = watch::channel(ClientView::idle(user.clone()));

        info!(user_id = %user, "client connected");
        Ok(Self {
            inner: Arc::new(ClientInner {
                user,
                store,
                clock,
                config,
                matchmaker,
                sessions,
                state: Mutex::new(ClientState::new()),
                view,
            }),
        })
    }

    pub fn user_id(&self) -> &UserId {
        &self.inner.user
    }

    /// Current view.
    pub fn view(&self) -> ClientView {
        self.inner.view.borrow().clone()
    }

    /// Stream of views, updated on every state change.
    pub fn subscribe(&self) -> watch::Receiver<ClientView> {
        self.inner.view.subscribe()
    }

    /// Look for a partner. Only valid while idle.
    pub async fn join(&self) -> Result<JoinOutcome> {
        let inner = &self.inner;
        let epoch = {
            let mut state = inner.state.lock().await;
            if state.status != ClientStatus::Idle {
                return Err(MatchError::Busy {
                    status: state.status,
                });
            }
            state.status = ClientStatus::Joining;
            state.error = None;
            let epoch = state.advance_epoch();
            inner.publish(&state);
            epoch
        };

        let result = inner.matchmaker.join(&inner.user).await;

        let mut state = inner.state.lock().await;
        if !state.is_current(epoch, ClientStatus::Joining) {
            // Shut down while the join was in flight; undo whatever it did.
            drop(state);
            if let Ok(outcome) = &result {
                self.undo_join(outcome).await;
            }
            return result;
        }

        match &result {
            Ok(JoinOutcome::Paired { session_id, partner }) => {
                inner.enter_chatting(&mut state, session_id.clone(), partner.clone());
            }
            Ok(JoinOutcome::Waiting) => {
                inner.enter_waiting(&mut state);
            }
            Err(e) => {
                warn!(user_id = %inner.user, error = %e, "join failed");
                state.status = ClientStatus::Idle;
                state.advance_epoch();
                state.error = Some(JOIN_FAILED_TEXT.to_string());
            }
        }
        inner.publish(&state);
        result
    }

    async fn undo_join(&self, outcome: &JoinOutcome) {
        let inner = &self.inner;
        let undone = match outcome {
            JoinOutcome::Waiting => inner.matchmaker.queue().cancel(&inner.user).await.map_err(MatchError::from),
            JoinOutcome::Paired { session_id, .. } => inner.sessions.leave(session_id, &inner.user).await.map(|_| ()),
        };
        if let Err(e) = undone {
            warn!(user_id = %inner.user, error = %e, "failed to undo join");
        }
    }

    /// Send a message to the partner.
    ///
    /// Returns `Ok(None)` without doing anything if the text is blank or the
    /// client is not chatting. The message shows up locally before the store
    /// write and stays there if the write fails.
    pub async fn send_message(&self, text: &str) -> Result<Option<Message>> {
        let inner = &self.inner;
        let (pending, epoch) = {
            let mut state = inner.state.lock().await;
            if state.status != ClientStatus::Chatting {
                return Ok(None);
            }
            let now = inner.clock.now();
            let Some(pending) = state.channel.as_mut().and_then(|c| c.stage(text, now)) else {
                return Ok(None);
            };
            state.error = None;
            inner.publish(&state);
            (pending, state.epoch)
        };

        match pending.deliver(inner.store.as_ref()).await {
            Ok(message) => Ok(Some(message)),
            Err(e) => {
                warn!(user_id = %inner.user, error = %e, "send failed");
                let mut state = inner.state.lock().await;
                if state.epoch == epoch {
                    state.error = Some(SEND_FAILED_TEXT.to_string());
                    inner.publish(&state);
                }
                Err(e.into())
            }
        }
    }

    /// Leave whatever the client is doing and go back to idle.
    ///
    /// On a store failure the error is surfaced and the state is kept.
    pub async fn leave(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        let result = match state.status {
            ClientStatus::Idle => return Ok(()),
            ClientStatus::Joining => {
                return Err(MatchError::Busy {
                    status: state.status,
                })
            }
            ClientStatus::Waiting => inner
                .matchmaker
                .queue()
                .cancel(&inner.user)
                .await
                .map_err(MatchError::from),
            ClientStatus::Chatting => match state.session_id.clone() {
                Some(id) => inner.sessions.leave(&id, &inner.user).await.map(|outcome| {
                    debug!(user_id = %inner.user, ?outcome, "leave applied");
                }),
                None => Ok(()),
            },
            ClientStatus::Ended => Ok(()),
        };

        match result {
            Ok(()) => {
                info!(user_id = %inner.user, from = %state.status, "left");
                state.reset();
                inner.publish(&state);
                Ok(())
            }
            Err(e) => {
                warn!(user_id = %inner.user, error = %e, "leave failed");
                state.error = Some(LEAVE_FAILED_TEXT.to_string());
                inner.publish(&state);
                Err(e)
            }
        }
    }

    /// Best-effort cleanup before the process goes away: leave an active
    /// session or drop the waiting ticket, then stop every background task.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        match state.status {
            ClientStatus::Waiting => {
                if let Err(e) = inner.matchmaker.queue().cancel(&inner.user).await {
                    warn!(user_id = %inner.user, error = %e, "failed to remove ticket on shutdown");
                }
            }
            ClientStatus::Chatting => {
                if let Some(id) = state.session_id.clone() {
                    if let Err(e) = inner.sessions.leave(&id, &inner.user).await {
                        warn!(user_id = %inner.user, error = %e, "failed to leave session on shutdown");
                    }
                }
            }
            _ => {}
        }

        state.reset();
        inner.publish(&state);
        info!(user_id = %inner.user, "client shut down");
    }
}
