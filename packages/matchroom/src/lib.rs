//! # Matchroom
//!
//! Anonymous one-on-one chat matchmaking over a shared document store.
//!
//! Users who want to talk either claim someone already waiting or put
//! themselves on a waiting list until somebody claims them. Once paired, the
//! two users share a session document holding their messages until both have
//! left.
//!
//! ## Architecture
//!
//! ```text
//! ChatClient (one per user)
//!     │
//!     ├─► join() ─► Matchmaker
//!     │               ├─► WaitingQueue.scan() ─► evict ghosts
//!     │               ├─► claim: one transaction
//!     │               │     delete waiter's ticket + create Session
//!     │               └─► or WaitingQueue.enqueue()
//!     │
//!     ├─► Waiting:  PresenceHandle (heartbeat task)
//!     │             next_match() (subscription on both seats)
//!     │
//!     ├─► Chatting: session subscription ─► MessageChannel
//!     │             send_message() / leave()
//!     │
//!     └─► Ended:    closing notice, back to Idle after a grace period
//!
//! DocumentStore (shared by every client)
//!     waiting_users   one ticket per waiting user
//!     conversations   one document per session
//! ```
//!
//! ## Guarantees
//!
//! - A ticket is claimed by at most one user, and deleting it is atomic with
//!   creating the session.
//! - Nobody is ever paired with themselves.
//! - Tickets idle for longer than the ghost threshold are never claimed.
//! - A session never goes back from `ENDED` to `active`.
//!
//! ## Not guaranteed
//!
//! - With the default read-modify-write send, two messages sent from the same
//!   snapshot can overwrite each other. [`AppendMode::Atomic`] avoids this on
//!   stores that support atomic appends.
//! - Losing a claim race puts the user on the waiting list rather than
//!   retrying, so two simultaneous joiners can both end up waiting.

mod channel;
mod client;
mod clock;
mod config;
mod error;
mod identity;
mod listener;
mod matchmaker;
mod model;
mod presence;
mod queue;
mod session;

pub mod store;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export documents
pub use model::{
    sort_for_display, Message, Role, Sender, Session, SessionId, SessionStatus, UserId,
    WaitingTicket, SYSTEM_SENDER,
};

// Re-export error types
pub use error::{MatchError, Result, StoreError};

// Re-export configuration
pub use config::{AppendMode, MatchConfig, ENDED_GRACE, GHOST_THRESHOLD, HEARTBEAT_INTERVAL, SCAN_WINDOW};

// Re-export clocks
pub use clock::{Clock, ManualClock, SystemClock};

// Re-export identity
pub use identity::{AnonymousIdentity, IdentityProvider, StaticIdentity};

// Re-export coordination components
pub use channel::{MessageChannel, PendingSend};
pub use listener::{next_match, ListenerHandle, MatchFound};
pub use matchmaker::{JoinOutcome, Matchmaker};
pub use presence::{PresenceExit, PresenceHandle};
pub use queue::WaitingQueue;
pub use session::{
    compose_message, leave_update, LeaveOutcome, SessionService, CLOSED_TEXT, CONNECTED_TEXT,
    LEFT_TEXT,
};

// Re-export the client
pub use client::{
    ChatClient, ClientStatus, ClientView, CONNECTION_ERROR_TEXT, DISCONNECTED_SUFFIX,
    JOIN_FAILED_TEXT, LEAVE_FAILED_TEXT, SEND_FAILED_TEXT,
};

// Re-export commonly used external types
pub use async_trait::async_trait;
