//! Connection lifecycle state machine.
//!
//! ```text
//! Disconnected -> Connecting -> Authenticating -> Ready
//!                      |              |             |
//!                      v              v             v
//!                 Disconnected   Disconnected   Reconnecting -> Authenticating
//! any (except Closed) -> Closed
//! ```
//!
//! `Closed` is terminal. Transitions are checked and applied atomically so
//! that concurrent `close()` and reconnect paths can't both win.

use std::fmt;

use tokio::sync::watch;
use tracing::trace;

use crate::error::{ClientError, ClientResult};

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not connected; no attempt in progress.
    Disconnected,
    /// Opening a socket to a server.
    Connecting,
    /// Socket open, handshake in progress.
    Authenticating,
    /// Handshake accepted, operations flow.
    Ready,
    /// Lost an established connection, retrying the pool.
    Reconnecting,
    /// Shut down for good.
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting)
            | (Connecting, Authenticating)
            | (Connecting, Disconnected)
            | (Authenticating, Ready)
            | (Authenticating, Disconnected)
            | (Authenticating, Reconnecting)
            | (Ready, Reconnecting)
            | (Reconnecting, Authenticating) => true,
            _ => false,
        }
    }

    /// Value exported through the state gauge.
    pub fn as_gauge(self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Authenticating => 2,
            ConnectionState::Ready => 3,
            ConnectionState::Reconnecting => 4,
            ConnectionState::Closed => 5,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Ready => "ready",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Holds the current state and publishes every change.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`. Fails with `Closed` once closed, or `Protocol` for a
    /// transition the lifecycle doesn't allow.
    pub fn transition(&self, next: ConnectionState) -> ClientResult<ConnectionState> {
        let mut result = Ok(next);
        self.tx.send_if_modified(|state| {
            let prev = *state;
            if prev == ConnectionState::Closed {
                result = Err(ClientError::Closed);
                return false;
            }
            if !prev.can_transition_to(next) {
                result = Err(ClientError::Protocol(format!(
                    "illegal state transition {prev} -> {next}"
                )));
                return false;
            }
            trace!(from = %prev, to = %next, "state transition");
            *state = next;
            result = Ok(prev);
            crate::metrics::CONNECTION_STATE.set(next.as_gauge());
            true
        });
        result
    }

    /// Move to `Closed`. Returns true only for the caller that performed the
    /// transition.
    pub fn close(&self) -> bool {
        self.transition(ConnectionState::Closed).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.current() == ConnectionState::Closed
    }
}
