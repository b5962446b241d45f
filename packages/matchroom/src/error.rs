//! Error types for matchmaking and session coordination.
//!
//! Two layers:
//! - [`StoreError`] is what the document store reports. `Conflict` and
//!   `NotFound` are expected under concurrency; `Backend` is a system failure.
//! - [`MatchError`] is what the public operations return.
//!
//! Contention during a claim is never an error at this level: the matchmaker
//! recovers from it by joining the waiting list.

use thiserror::Error;

use crate::client::ClientStatus;
use crate::model::{SessionId, UserId};

// =============================================================================
// Store Error
// =============================================================================

/// Errors reported by a [`DocumentStore`](crate::store::DocumentStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The addressed document does not exist.
    #[error("document not found: {collection} '{id}'")]
    NotFound {
        collection: &'static str,
        id: String,
    },

    /// A document read inside a transaction changed before commit.
    #[error("revision conflict: document was modified concurrently")]
    Conflict,

    /// Transport or storage failure.
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(collection: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            collection,
            id: id.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict)
    }
}

// =============================================================================
// Match Error
// =============================================================================

/// Errors returned by the client-facing operations.
#[derive(Debug, Error)]
pub enum MatchError {
    /// The identity provider could not issue a user id. Fatal to startup.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// A store read, write or subscription failed. Non-fatal; state is left
    /// as it was.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The operation is not valid in the client's current status.
    #[error("operation not allowed while {status}")]
    Busy { status: ClientStatus },

    /// The user does not belong to the session it tried to act on.
    #[error("user '{user}' is not a participant of session '{session}'")]
    NotParticipant { user: UserId, session: SessionId },
}

impl MatchError {
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    pub fn is_store(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// A type alias for `Result<T, MatchError>`.
pub type Result<T, E = MatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let missing = StoreError::not_found("waiting_users", "alice");
        assert!(missing.to_string().contains("waiting_users"));
        assert!(missing.is_not_found());

        let conflict = StoreError::Conflict;
        assert!(conflict.to_string().contains("conflict"));
        assert!(conflict.is_conflict());

        let backend = StoreError::backend("connection reset");
        assert!(backend.to_string().contains("connection reset"));
    }

    #[test]
    fn test_store_error_converts_into_match_error() {
        let err: MatchError = StoreError::backend("down").into();
        assert!(err.is_store());
        assert!(!err.is_auth());
    }
}
