//! Asynchronous error notification.
//!
//! Every failure the connection machinery hits (refused sockets, rejected
//! handshakes, slow consumers) is reported exactly once to the configured
//! [`ErrorObserver`]. Observers run on the connection task and must not
//! block.

use std::{fmt, sync::Arc};

use parking_lot::Mutex;

use crate::error::ClientError;

/// Receives every error the client reports.
pub trait ErrorObserver: Send + Sync {
    fn on_error(&self, err: &ClientError);
}

impl<F> ErrorObserver for F
where
    F: Fn(&ClientError) + Send + Sync,
{
    fn on_error(&self, err: &ClientError) {
        self(err)
    }
}

/// Observer that keeps everything it's given. Handy in tests and for
/// surfacing the last few failures in a health check.
#[derive(Clone, Default)]
pub struct ErrorLog {
    errors: Arc<Mutex<Vec<ClientError>>>,
}

impl fmt::Debug for ErrorLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorLog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all errors seen so far.
    pub fn errors(&self) -> Vec<ClientError> {
        self.errors.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.errors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.lock().is_empty()
    }

    /// Number of authorization rejections seen.
    pub fn auth_errors(&self) -> usize {
        self.errors.lock().iter().filter(|e| e.is_auth()).count()
    }

    pub fn clear(&self) {
        self.errors.lock().clear();
    }
}

impl ErrorObserver for ErrorLog {
    fn on_error(&self, err: &ClientError) {
        self.errors.lock().push(err.clone());
    }
}

/// Report an error: count it, log it, hand it to the observer.
pub(crate) fn report(observer: Option<&Arc<dyn ErrorObserver>>, err: &ClientError) {
    crate::metrics::ERRORS
        .with_label_values(&[crate::metrics::error_kind(err)])
        .inc();
    if err.is_auth() {
        crate::metrics::AUTH_FAILURES.inc();
    }
    match err {
        ClientError::Auth(_) | ClientError::Credential(_) => {
            tracing::error!(error = %err, "nats client error")
        }
        _ => tracing::warn!(error = %err, "nats client error"),
    }
    if let Some(observer) = observer {
        observer.on_error(err);
    }
}
