//! Authenticator contract.
//!
//! Sign-in itself (OAuth flows, keystores, token refresh plumbing) lives
//! with the embedder; the engine only needs this capability set.

use thiserror::Error;
use std::collections::VecDeque;

/// A successful sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignIn {
    /// Stable user identifier shared by all of the account's devices.
    pub user_id: String,
    /// Bearer token presented to the remote.
    pub id_token: String,
}

/// Out-of-band notifications from the authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// The bearer token was refreshed.
    TokenRefreshed(String),
    /// The account was deleted remotely; payload says whether it
    /// succeeded.
    AccountDeleted(bool),
}

/// Authenticator failures.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    /// Sign-in failed.
    #[error("sign-in failed: {0}")]
    SignInFailed(String),
    /// Account deletion failed.
    #[error("account deletion failed: {0}")]
    DeletionFailed(String),
}

/// Produces a user id and bearer token for the connector.
pub trait Authenticator {
    /// Signs the user in.
    fn sign_in(&mut self) -> Result<SignIn, AuthError>;

    /// The current bearer token, if signed in.
    fn id_token(&self) -> Option<String>;

    /// Requests deletion of the whole account.
    fn delete_account(&mut self) -> Result<(), AuthError>;

    /// Drains one pending notification.
    fn take_event(&mut self) -> Option<AuthEvent> {
        None
    }
}

/// An authenticator holding fixed credentials.
///
/// The default for tests and deployments where credentials are provisioned
/// out of band.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    user_id: String,
    id_token: String,
    signed_in: bool,
    fail_sign_in: Option<String>,
    events: VecDeque<AuthEvent>,
}

impl StaticAuthenticator {
    /// Creates an authenticator for the given account.
    pub fn new(user_id: impl Into<String>, id_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            id_token: id_token.into(),
            ..Self::default()
        }
    }

    /// Makes the next `sign_in` fail with the given message.
    pub fn fail_next_sign_in(&mut self, message: impl Into<String>) {
        self.fail_sign_in = Some(message.into());
    }

    /// Queues a notification for the engine to pick up.
    pub fn push_event(&mut self, event: AuthEvent) {
        self.events.push_back(event);
    }
}

impl Authenticator for StaticAuthenticator {
    fn sign_in(&mut self) -> Result<SignIn, AuthError> {
        if let Some(message) = self.fail_sign_in.take() {
            return Err(AuthError::SignInFailed(message));
        }
        self.signed_in = true;
        Ok(SignIn {
            user_id: self.user_id.clone(),
            id_token: self.id_token.clone(),
        })
    }

    fn id_token(&self) -> Option<String> {
        self.signed_in.then(|| self.id_token.clone())
    }

    fn delete_account(&mut self) -> Result<(), AuthError> {
        self.signed_in = false;
        self.events.push_back(AuthEvent::AccountDeleted(true));
        Ok(())
    }

    fn take_event(&mut self) -> Option<AuthEvent> {
        self.events.pop_front()
    }
}
