//! Anonymous identity.
//!
//! Every participant needs a stable opaque id before touching the store. The
//! chat core only asks for one; how it is issued is up to the provider.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::error::{MatchError, Result};
use crate::model::UserId;

#[async_trait]
pub trait IdentityProvider: Send + Sync + 'static {
    /// The signed-in user, if any.
    fn current_user(&self) -> Option<UserId>;

    /// Sign in if needed and return the user id.
    async fn ensure_signed_in(&self) -> Result<UserId>;
}

/// Issues a random id on first sign-in and keeps it for the provider's
/// lifetime.
#[derive(Debug, Default)]
pub struct AnonymousIdentity {
    user: Mutex<Option<UserId>>,
}

impl AnonymousIdentity {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdentityProvider for AnonymousIdentity {
    fn current_user(&self) -> Option<UserId> {
        self.user
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn ensure_signed_in(&self) -> Result<UserId> {
        let mut user = self
            .user
            .lock()
            .map_err(|_| MatchError::auth("identity state poisoned"))?;
        if let Some(existing) = user.as_ref() {
            return Ok(existing.clone());
        }

        let issued = UserId::new(Uuid::new_v4().simple().to_string());
        info!(user_id = %issued, "signed in anonymously");
        *user = Some(issued.clone());
        Ok(issued)
    }
}

/// A fixed identity, or none at all.
///
/// `StaticIdentity::unavailable()` models a provider that cannot sign in.
#[derive(Debug, Clone)]
pub struct StaticIdentity(Option<UserId>);

impl StaticIdentity {
    pub fn new(user: impl Into<UserId>) -> Self {
        Self(Some(user.into()))
    }

    pub fn unavailable() -> Self {
        Self(None)
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<UserId> {
        self.0.clone()
    }

    async fn ensure_signed_in(&self) -> Result<UserId> {
        self.0
            .clone()
            .ok_or_else(|| MatchError::auth("identity provider unavailable"))
    }
}
