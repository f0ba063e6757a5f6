//! Error types for the client core.
//!
//! Every failure the client can surface is one of these variants, so callers
//! (and the [`ErrorObserver`]) can tell an authentication rejection apart from
//! a dropped socket without string matching.
//!
//! [`ErrorObserver`]: crate::observer::ErrorObserver

use std::{io, sync::Arc};

use thiserror::Error;

/// Top-level error type for the client.
///
/// `Clone` so that the same value can be handed to the error observer and
/// returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Credential material is missing, unreadable or malformed, or a user
    /// supplied credential callback failed.
    #[error("credential error: {0}")]
    Credential(String),

    /// The server sent something we could not make sense of (bad greeting,
    /// unparseable frame).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server rejected our credentials.
    #[error("authorization error: {0}")]
    Auth(String),

    /// Socket level failure. Always transient.
    #[error("io error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// A request did not receive a reply in time.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The operation needs a ready connection and there is none right now.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// The client was closed.
    #[error("connection closed")]
    Closed,

    /// Invalid client options.
    #[error("configuration error: {0}")]
    Config(String),

    /// A non-authorization `-ERR` sent by the server.
    #[error("server error: {0}")]
    Server(String),

    /// A subject that can't be put on the wire.
    #[error("invalid subject: {0:?}")]
    InvalidSubject(String),

    /// A subscriber fell behind and a message was dropped.
    #[error("slow consumer on subscription {sid} ({subject}), message dropped")]
    SlowConsumer { sid: u64, subject: String },
}

impl ClientError {
    /// Build an `Io` error from a kind and message.
    pub fn io(kind: io::ErrorKind, msg: impl Into<String>) -> Self {
        ClientError::Io(Arc::new(io::Error::new(kind, msg.into())))
    }

    /// Returns true if the server rejected our credentials.
    pub fn is_auth(&self) -> bool {
        matches!(self, ClientError::Auth(_))
    }

    /// Returns true if this error is a request timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }

    /// Returns true if this error is expected to go away on its own and
    /// should drive reconnection.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Io(_))
    }

    /// Returns true if retrying the same attempt with the same inputs can't
    /// succeed: the attempt is over, though a later attempt might not be.
    pub fn is_terminal_for_attempt(&self) -> bool {
        matches!(
            self,
            ClientError::Credential(_) | ClientError::Protocol(_) | ClientError::Auth(_)
        )
    }

    /// Returns true if the failure is on our side and will repeat for every
    /// server in the pool.
    pub(crate) fn is_local(&self) -> bool {
        matches!(self, ClientError::Credential(_) | ClientError::Config(_))
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Protocol(format!("json: {err}"))
    }
}

/// Shorthand result alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
