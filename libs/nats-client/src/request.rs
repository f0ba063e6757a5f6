//! Request/reply correlation.
//!
//! Every request gets its own reply subject, `_INBOX.<token>.<n>`, where the
//! token is random per client and `n` counts up. The caller subscribes to it,
//! publishes with it as the reply-to, and parks on a oneshot until the read
//! loop resolves the entry, the timer fires, or the client closes.

use std::{
    collections::HashMap,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::{Rng, distributions::Alphanumeric};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::{
    client::Message,
    connection::Shared,
    error::{ClientError, ClientResult},
    metrics,
};

/// Prefix of every reply subject.
pub const INBOX_PREFIX: &str = "_INBOX";

const INBOX_TOKEN_LEN: usize = 22;

/// A request waiting on its reply.
pub struct PendingRequest {
    pub subject: String,
    pub created_at: Instant,
    pub timeout: Duration,
    result_slot: oneshot::Sender<ClientResult<Message>>,
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("subject", &self.subject)
            .field("created_at", &self.created_at)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Pending requests keyed by reply subject.
pub struct Correlator {
    prefix: String,
    counter: AtomicU64,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("prefix", &self.prefix)
            .field("pending", &self.len())
            .finish()
    }
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(INBOX_TOKEN_LEN)
            .map(char::from)
            .collect();
        Self {
            prefix: format!("{INBOX_PREFIX}.{token}"),
            counter: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// `_INBOX.<token>`, shared by all of this client's inboxes
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// A reply subject never handed out before by this client.
    pub fn new_inbox(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}.{n}", self.prefix)
    }

    /// Start waiting on `inbox`.
    pub fn register(
        &self,
        inbox: &str,
        subject: &str,
        timeout: Duration,
    ) -> oneshot::Receiver<ClientResult<Message>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            inbox.to_owned(),
            PendingRequest {
                subject: subject.to_owned(),
                created_at: Instant::now(),
                timeout,
                result_slot: tx,
            },
        );
        rx
    }

    /// Hand a reply to its waiter. Returns false if nobody is waiting.
    pub fn resolve(&self, inbox: &str, msg: Message) -> bool {
        let Some(req) = self.pending.lock().remove(inbox) else {
            return false;
        };
        trace!(inbox, subject = %req.subject, elapsed = ?req.created_at.elapsed(), "reply received");
        metrics::REQUEST_LATENCY.observe(req.created_at.elapsed().as_secs_f64());
        req.result_slot.send(Ok(msg)).is_ok()
    }

    /// Stop waiting on `inbox`.
    pub fn cancel(&self, inbox: &str) -> Option<PendingRequest> {
        self.pending.lock().remove(inbox)
    }

    /// Fail every pending request with `Closed`.
    pub fn close_all(&self) {
        let drained: Vec<PendingRequest> = self.pending.lock().drain().map(|(_, v)| v).collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending requests on close");
        }
        for req in drained {
            let _ = req.result_slot.send(Err(ClientError::Closed));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Park until the reply, the deadline or close.
    pub async fn wait(
        rx: oneshot::Receiver<ClientResult<Message>>,
        subject: &str,
        timeout: Duration,
    ) -> ClientResult<Message> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(res)) => res,
            // slot dropped without an answer: the client went away
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                metrics::REQUEST_TIMEOUTS.inc();
                debug!(subject, ?timeout, "request timed out");
                Err(ClientError::Timeout(format!(
                    "no reply on {subject:?} within {timeout:?}"
                )))
            }
        }
    }
}

/// Removes a request's pending entry and reply subscription however the
/// request future ends: reply, timeout, error or being dropped.
pub(crate) struct RequestGuard<'a> {
    pub(crate) shared: &'a Shared,
    pub(crate) inbox: String,
    pub(crate) sid: u64,
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.shared.correlator.cancel(&self.inbox);
        self.shared.remove_subscription(self.sid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn reply(subject: &str, payload: &'static [u8]) -> Message {
        Message {
            subject: subject.to_owned(),
            reply: None,
            payload: Bytes::from_static(payload),
            sid: 1,
        }
    }

    #[test]
    fn test_inboxes_are_unique() {
        let correlator = Correlator::new();
        let a = correlator.new_inbox();
        let b = correlator.new_inbox();
        assert_ne!(a, b);
        assert!(a.starts_with("_INBOX."));
        assert!(a.starts_with(correlator.prefix()));
        assert!(a.ends_with(".1"));
        assert!(b.ends_with(".2"));

        // a second client gets a different token
        assert_ne!(Correlator::new().prefix(), correlator.prefix());
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiter() {
        let correlator = Correlator::new();
        let inbox = correlator.new_inbox();
        let rx = correlator.register(&inbox, "svc.echo", Duration::from_secs(1));
        assert_eq!(correlator.len(), 1);

        assert!(correlator.resolve(&inbox, reply(&inbox, b"pong")));
        let msg = Correlator::wait(rx, "svc.echo", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(msg.payload, Bytes::from_static(b"pong"));
        assert!(correlator.is_empty());

        // late duplicate
        assert!(!correlator.resolve(&inbox, reply(&inbox, b"again")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let correlator = Correlator::new();
        let inbox = correlator.new_inbox();
        let rx = correlator.register(&inbox, "svc.slow", Duration::from_millis(50));
        let err = Correlator::wait(rx, "svc.slow", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(correlator.cancel(&inbox).is_some());
    }

    #[tokio::test]
    async fn test_close_all_fails_pending() {
        let correlator = Correlator::new();
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let inbox = correlator.new_inbox();
            waiters.push(correlator.register(&inbox, "svc", Duration::from_secs(60)));
        }
        correlator.close_all();
        assert!(correlator.is_empty());
        for rx in waiters {
            let err = Correlator::wait(rx, "svc", Duration::from_secs(60))
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::Closed));
        }
    }

    #[tokio::test]
    async fn test_requests_are_independent() {
        let correlator = Correlator::new();
        let first = correlator.new_inbox();
        let second = correlator.new_inbox();
        let rx1 = correlator.register(&first, "a", Duration::from_secs(1));
        let rx2 = correlator.register(&second, "a", Duration::from_secs(1));

        // answer out of order
        assert!(correlator.resolve(&second, reply(&second, b"2")));
        let msg2 = Correlator::wait(rx2, "a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(&msg2.payload[..], b"2");
        assert_eq!(correlator.len(), 1);

        assert!(correlator.resolve(&first, reply(&first, b"1")));
        let msg1 = Correlator::wait(rx1, "a", Duration::from_secs(1)).await.unwrap();
        assert_eq!(&msg1.payload[..], b"1");
    }
}
