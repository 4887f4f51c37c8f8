//! Authenticator state machines.
//!
//! A tagged sum rather than a trait object hierarchy: both variants
//! implement the same advance/identity contract, and dispatch is a plain
//! match rather than dynamic dispatch over an inheritance hierarchy.

pub mod plaintext;
pub mod scram;

use std::fmt;
use thiserror::Error;

use crate::error::{ErrorKind, ReportableError};

/// Error codes 10-20 are reserved for authentication failures; this crate
/// emits a handful of them, leaving the rest available to a richer
/// credential backend.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct AuthenticationError {
    pub code: i32,
    pub message: String,
}

impl AuthenticationError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        assert!((10..=20).contains(&code), "authentication error codes are 10-20");
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_credentials(user: &str) -> Self {
        Self::new(10, format!("Unknown user or incorrect password: '{user}'"))
    }

    pub fn malformed_message(detail: &'static str) -> Self {
        Self::new(11, format!("Malformed authentication message: {detail}"))
    }

    pub fn protocol_violation(detail: &'static str) -> Self {
        Self::new(12, format!("Authentication protocol violation: {detail}"))
    }
}

impl ReportableError for AuthenticationError {
    fn get_error_kind(&self) -> ErrorKind {
        ErrorKind::Auth
    }
}

/// Looked up once per session from the credential watchable; opaque
/// beyond what each authenticator variant needs.
#[derive(Clone)]
pub enum StoredCredential {
    /// The legacy shared key, compared byte-for-byte.
    PlaintextKey(Vec<u8>),
    /// A SCRAM-SHA-256 server secret: salt, iteration count, stored key,
    /// server key (RFC 5802 §3).
    ScramSecret(scram::ServerSecret),
}

/// External collaborator: looks up a user's stored credential.
/// Authentication is interleaved with framed message exchange, so this is
/// consulted mid-handshake, not just at session start.
#[async_trait::async_trait]
pub trait AuthWatchable: Send + Sync {
    /// SCRAM path: look up a named user's stored credential.
    async fn lookup(&self, user: &str) -> Option<StoredCredential>;

    /// Legacy path: the server has exactly one shared key (there is no
    /// username on this wire grammar).
    async fn check_legacy_key(&self, presented: &[u8]) -> bool;
}

/// Opaque authenticated identity, produced once an authenticator variant
/// reaches its terminal state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthenticatedUser(pub String);

impl fmt::Display for AuthenticatedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The common capability every authenticator variant exposes: advance the
/// state machine with one client message, and once `Done`, read back the
/// authenticated identity.
pub enum Authenticator {
    Plaintext(plaintext::PlaintextAuthenticator),
    Scram(Box<scram::ScramAuthenticator>),
}

impl Authenticator {
    pub fn plaintext(watchable: std::sync::Arc<dyn AuthWatchable>) -> Self {
        Authenticator::Plaintext(plaintext::PlaintextAuthenticator::new(watchable))
    }

    pub fn scram(watchable: std::sync::Arc<dyn AuthWatchable>) -> Self {
        Authenticator::Scram(Box::new(scram::ScramAuthenticator::new(watchable)))
    }

    /// Advance the state machine with one client message. The legacy
    /// variant's single invocation produces an unused placeholder string;
    /// its terminal state is implicit, so callers should not frame this
    /// return value onto the wire.
    pub async fn next_message(&mut self, client_input: &str) -> Result<String, AuthenticationError> {
        match self {
            Authenticator::Plaintext(a) => a.next_message(client_input).await,
            Authenticator::Scram(a) => a.next_message(client_input).await,
        }
    }

    /// Valid only once the machine has reached `Done`.
    pub fn authenticated_user(&self) -> Option<AuthenticatedUser> {
        match self {
            Authenticator::Plaintext(a) => a.authenticated_user(),
            Authenticator::Scram(a) => a.authenticated_user(),
        }
    }
}
