//! The application facing client handle.

use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info_span};
use tracing_futures::Instrument;

use crate::{
    connection::{self, Command, Delivery, Shared},
    error::{ClientError, ClientResult},
    handshake::ServerInfo,
    options::ConnectOptions,
    pool::{ServerEndpoint, ServerPool},
    proto::validate_subject,
    request::{Correlator, RequestGuard},
    state::ConnectionState,
};

/// A message delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Bytes,
    /// subscription the server delivered it on
    pub sid: u64,
}

/// Traffic counters for the client's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub in_msgs: u64,
    pub out_msgs: u64,
    pub in_bytes: u64,
    pub out_bytes: u64,
    pub reconnects: u64,
}

struct ClientInner {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// A connection to a NATS cluster. Cheap to clone; the connection closes
/// when [`Client::close`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("shared", &self.inner.shared)
            .finish_non_exhaustive()
    }
}

impl Client {
    pub(crate) async fn connect(options: ConnectOptions) -> ClientResult<Client> {
        options.validate()?;
        let credentials = options.resolve_credentials()?;
        let pool = ServerPool::new(&options.servers, options.no_randomize)?;
        let name = options.handshake.name.clone().unwrap_or_default();
        let (cmd_tx, cmd_rx) = mpsc::channel(options.pending_capacity);
        let shared = Arc::new(Shared::new(options, credentials, pool, cmd_tx));

        let span = info_span!("nats_client", name = %name);
        let session = connection::connect_initial(&shared)
            .instrument(span.clone())
            .await?;
        let driver = tokio::spawn(connection::run(shared.clone(), session, cmd_rx).instrument(span));

        Ok(Client {
            inner: Arc::new(ClientInner {
                shared,
                driver: Mutex::new(Some(driver)),
            }),
        })
    }

    fn shared(&self) -> &Shared {
        &self.inner.shared
    }

    /// Close the connection. Pending requests fail with `Closed`, queued
    /// publishes are flushed best effort. Safe to call more than once and
    /// from several tasks.
    pub async fn close(&self) {
        self.shared().shutdown();
        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(err) = driver.await {
                debug!(?err, "connection driver ended abnormally");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared().state.is_closed()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared().state.current()
    }

    /// Watch state changes as they happen.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared().state.subscribe()
    }

    /// The server we're talking to, `None` unless `Ready`.
    pub fn connected_server(&self) -> Option<ServerEndpoint> {
        self.shared().connected_server()
    }

    /// The current server pool, configured and discovered.
    pub fn servers(&self) -> Vec<ServerEndpoint> {
        self.shared().pool.lock().endpoints()
    }

    /// The last `INFO` received.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared().server_info()
    }

    pub fn stats(&self) -> Statistics {
        self.shared().stats()
    }

    /// A fresh, unique reply subject.
    pub fn new_inbox(&self) -> String {
        self.shared().correlator.new_inbox()
    }

    pub async fn publish(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> ClientResult<()> {
        self.publish_inner(subject.into(), None, payload.into()).await
    }

    pub async fn publish_with_reply(
        &self,
        subject: impl Into<String>,
        reply: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> ClientResult<()> {
        let reply = reply.into();
        validate_subject(&reply)?;
        self.publish_inner(subject.into(), Some(reply), payload.into())
            .await
    }

    async fn publish_inner(
        &self,
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    ) -> ClientResult<()> {
        validate_subject(&subject)?;
        self.shared()
            .enqueue(Command::Publish {
                subject,
                reply,
                payload,
            })
            .await
    }

    pub async fn subscribe(&self, subject: impl Into<String>) -> ClientResult<Subscriber> {
        self.subscribe_inner(subject.into(), None).await
    }

    /// Subscribe as a member of a queue group; each message goes to one
    /// member.
    pub async fn queue_subscribe(
        &self,
        subject: impl Into<String>,
        queue: impl Into<String>,
    ) -> ClientResult<Subscriber> {
        self.subscribe_inner(subject.into(), Some(queue.into()))
            .await
    }

    async fn subscribe_inner(
        &self,
        subject: String,
        queue: Option<String>,
    ) -> ClientResult<Subscriber> {
        validate_subject(&subject)?;
        let shared = self.shared();
        if shared.state.is_closed() {
            return Err(ClientError::Closed);
        }
        let (tx, rx) = mpsc::channel(shared.opts.subscription_capacity);
        let sid = shared.add_subscription(subject.clone(), queue.clone(), Delivery::Channel(tx));
        if let Err(err) = shared
            .enqueue(Command::Subscribe {
                sid,
                subject: subject.clone(),
                queue,
            })
            .await
        {
            shared.subs.lock().remove(&sid);
            return Err(err);
        }
        debug!(sid, %subject, "subscribed");
        Ok(Subscriber {
            sid,
            subject,
            rx,
            shared: self.inner.shared.clone(),
            unsubscribed: false,
        })
    }

    /// Subscribe and run `handler` for every message on its own task, so a
    /// slow handler never holds up the connection. Abort the returned handle
    /// to unsubscribe.
    pub async fn subscribe_with<F>(
        &self,
        subject: impl Into<String>,
        mut handler: F,
    ) -> ClientResult<JoinHandle<()>>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let mut sub = self.subscribe(subject).await?;
        let span = info_span!("nats_subscription", sid = sub.sid, subject = %sub.subject);
        Ok(tokio::spawn(
            async move {
                while let Some(msg) = sub.next().await {
                    handler(msg);
                }
                debug!("subscription ended");
            }
            .instrument(span),
        ))
    }

    /// Send a request and wait for one reply, using the default request
    /// timeout.
    pub async fn request(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> ClientResult<Message> {
        let timeout = self.shared().opts.request_timeout;
        self.request_with_timeout(subject, payload, timeout).await
    }

    /// Send a request and wait up to `timeout` for one reply.
    ///
    /// Fails fast with `NotConnected` unless the connection is `Ready`.
    pub async fn request_with_timeout(
        &self,
        subject: impl Into<String>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> ClientResult<Message> {
        let subject = subject.into();
        validate_subject(&subject)?;
        let shared = self.shared();
        shared.ensure_ready()?;

        let inbox = shared.correlator.new_inbox();
        let rx = shared.correlator.register(&inbox, &subject, timeout);
        let sid = shared.add_subscription(inbox.clone(), None, Delivery::Reply);
        let _guard = RequestGuard {
            shared,
            inbox: inbox.clone(),
            sid,
        };
        // close may have run before we registered
        if shared.state.is_closed() {
            return Err(ClientError::Closed);
        }

        // the reply subscription goes out before the request
        shared
            .enqueue(Command::Subscribe {
                sid,
                subject: inbox.clone(),
                queue: None,
            })
            .await?;
        shared
            .enqueue(Command::Publish {
                subject: subject.clone(),
                reply: Some(inbox),
                payload: payload.into(),
            })
            .await?;
        Correlator::wait(rx, &subject, timeout).await
    }

    /// Wait until the server has processed everything sent so far.
    pub async fn flush(&self) -> ClientResult<()> {
        let shared = self.shared();
        shared.ensure_ready()?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        shared.enqueue(Command::Flush(tx)).await?;
        let timeout = shared.opts.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            // the socket went away before the PONG
            Ok(Err(_)) => Err(shared.not_ready_error()),
            Err(_) => Err(ClientError::Timeout(format!(
                "flush not acknowledged within {timeout:?}"
            ))),
        }
    }
}

/// A stream of messages for one subscription. Dropping it unsubscribes.
pub struct Subscriber {
    sid: u64,
    subject: String,
    rx: mpsc::Receiver<Message>,
    shared: Arc<Shared>,
    unsubscribed: bool,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("sid", &self.sid)
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Stop receiving. Messages already buffered are discarded.
    pub fn unsubscribe(mut self) {
        self.unsubscribed = true;
        self.shared.remove_subscription(self.sid);
    }

    /// Have the server stop after `max` messages in total; the stream ends
    /// once they've been delivered.
    pub async fn unsubscribe_after(&mut self, max: u64) -> ClientResult<()> {
        self.shared.unsubscribe_after(self.sid, max).await
    }
}

impl Stream for Subscriber {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Message>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if !self.unsubscribed {
            self.shared.remove_subscription(self.sid);
        }
    }
}
