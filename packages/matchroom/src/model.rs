//! Documents shared through the store: waiting tickets, sessions and messages.
//!
//! Field names serialize in camelCase so the documents keep the layout of the
//! two persisted collections (`waiting_users` keyed by user id, and
//! `conversations` keyed by [`SessionId`]).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sender id reserved for messages generated by the system itself.
pub const SYSTEM_SENDER: &str = "SYSTEM";

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque, stable identifier of an anonymous user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a session document.
///
/// Derived from the sorted participant pair plus the creation time, so both
/// sides can compute it without a round trip and repeated pairings of the same
/// two users never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Build the id for a pair created at `created_at`.
    ///
    /// The result is `"{lower}_{higher}_{unix millis}"`, independent of which
    /// user initiated the pairing.
    pub fn for_pair(a: &UserId, b: &UserId, created_at: DateTime<Utc>) -> Self {
        let (lower, higher) = if a <= b { (a, b) } else { (b, a) };
        Self(format!(
            "{}_{}_{}",
            lower,
            higher,
            created_at.timestamp_millis()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

// =============================================================================
// Waiting Ticket
// =============================================================================

/// A waiting-room record for one user seeking a partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingTicket {
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl WaitingTicket {
    /// A fresh ticket: joined and last seen at `now`.
    pub fn new(user_id: UserId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            joined_at: now,
            last_seen: now,
        }
    }

    /// A ticket is a ghost once its owner has not refreshed it for longer
    /// than `threshold`.
    pub fn is_ghost(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let idle_ms = (now - self.last_seen).num_milliseconds();
        let threshold_ms = i64::try_from(threshold.as_millis()).unwrap_or(i64::MAX);
        idle_ms > threshold_ms
    }
}

// =============================================================================
// Messages
// =============================================================================

/// Who sent a message: a participant or the system.
///
/// Serialized as the bare user id, or as [`SYSTEM_SENDER`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Sender {
    System,
    User(UserId),
}

impl Sender {
    pub fn is_system(&self) -> bool {
        matches!(self, Sender::System)
    }
}

impl From<String> for Sender {
    fn from(raw: String) -> Self {
        if raw == SYSTEM_SENDER {
            Sender::System
        } else {
            Sender::User(UserId(raw))
        }
    }
}

impl From<Sender> for String {
    fn from(sender: Sender) -> Self {
        match sender {
            Sender::System => SYSTEM_SENDER.to_string(),
            Sender::User(id) => id.0,
        }
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::System => f.write_str(SYSTEM_SENDER),
            Sender::User(id) => id.fmt(f),
        }
    }
}

/// A single chat line. Ordering is by `timestamp`, never by array position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub text: String,
    pub sender_id: Sender,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn system(text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            sender_id: Sender::System,
            timestamp,
        }
    }

    pub fn from_user(user: UserId, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            sender_id: Sender::User(user),
            timestamp,
        }
    }
}

/// Stable sort by timestamp ascending. Messages sharing a timestamp keep
/// their relative order.
pub fn sort_for_display(messages: &mut [Message]) {
    messages.sort_by_key(|m| m.timestamp);
}

// =============================================================================
// Session
// =============================================================================

/// Session lifecycle. `Ended` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "ENDED")]
    Ended,
}

/// Which seat a participant occupies. `A` is the user who ran the claim,
/// `B` the waiter who was claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    A,
    B,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::A => Role::B,
            Role::B => Role::A,
        }
    }
}

/// The paired conversation between exactly two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    #[serde(rename = "userAId")]
    pub participant_a: UserId,
    #[serde(rename = "userBId")]
    pub participant_b: UserId,
    pub status: SessionStatus,
    #[serde(rename = "userHasLeftA", default)]
    pub left_a: bool,
    #[serde(rename = "userHasLeftB", default)]
    pub left_b: bool,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn participant(&self, role: Role) -> &UserId {
        match role {
            Role::A => &self.participant_a,
            Role::B => &self.participant_b,
        }
    }

    pub fn role_of(&self, user: &UserId) -> Option<Role> {
        if *user == self.participant_a {
            Some(Role::A)
        } else if *user == self.participant_b {
            Some(Role::B)
        } else {
            None
        }
    }

    /// The non-`user` participant, if `user` belongs to this session.
    pub fn partner_of(&self, user: &UserId) -> Option<&UserId> {
        self.role_of(user).map(|role| self.participant(role.other()))
    }

    pub fn has_left(&self, role: Role) -> bool {
        match role {
            Role::A => self.left_a,
            Role::B => self.left_b,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}
