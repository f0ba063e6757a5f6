//! The connection driver.
//!
//! One task owns the socket for the lifetime of the client. It runs the read
//! loop, writes queued commands, answers keepalives and, when the socket
//! dies, walks the server pool until a new handshake succeeds. Callers never
//! touch the socket; they hand [`Command`]s to the driver through a bounded
//! channel, which doubles as the reconnect buffer.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt, io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::{debug, info, trace, warn};

use crate::{
    client::{Message, Statistics},
    credentials::Credentials,
    error::{ClientError, ClientResult},
    handshake::{self, ServerInfo},
    metrics,
    observer,
    options::ConnectOptions,
    pool::{ServerEndpoint, ServerPool},
    proto::{ClientOp, NatsCodec, ServerOp},
    request::Correlator,
    state::{ConnectionState, StateMachine},
};

/// Commands written per wakeup before the socket is flushed.
const MAX_BATCH: usize = 64;

/// A byte stream to one server.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Opens byte streams to servers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &ServerEndpoint, timeout: Duration)
    -> io::Result<BoxStream>;
}

/// Plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(
        &self,
        endpoint: &ServerEndpoint,
        timeout: Duration,
    ) -> io::Result<BoxStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(endpoint.address()))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {endpoint} timed out after {timeout:?}"),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Work handed from callers to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Publish {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    Subscribe {
        sid: u64,
        subject: String,
        queue: Option<String>,
    },
    Unsubscribe {
        sid: u64,
        max: Option<u64>,
    },
    /// PING; the sender fires when the matching PONG arrives
    Flush(oneshot::Sender<()>),
}

/// Where messages for a subscription go.
#[derive(Debug)]
pub(crate) enum Delivery {
    Channel(mpsc::Sender<Message>),
    /// a request's reply inbox, resolved through the correlator
    Reply,
}

#[derive(Debug)]
pub(crate) struct SubEntry {
    pub(crate) subject: String,
    pub(crate) queue: Option<String>,
    pub(crate) delivery: Delivery,
    pub(crate) delivered: u64,
    pub(crate) max: Option<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) in_msgs: AtomicU64,
    pub(crate) out_msgs: AtomicU64,
    pub(crate) in_bytes: AtomicU64,
    pub(crate) out_bytes: AtomicU64,
    pub(crate) reconnects: AtomicU64,
}

/// State shared by the driver and every client handle.
pub(crate) struct Shared {
    pub(crate) state: StateMachine,
    pub(crate) opts: ConnectOptions,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) pool: Mutex<ServerPool>,
    pub(crate) subs: Mutex<HashMap<u64, SubEntry>>,
    next_sid: AtomicU64,
    pub(crate) correlator: Correlator,
    current_server: Mutex<Option<ServerEndpoint>>,
    server_info: Mutex<Option<ServerInfo>>,
    pub(crate) counters: Counters,
    pub(crate) cancel: CancellationToken,
    cmd_tx: mpsc::Sender<Command>,
}

impl fmt::Debug for Shared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state.current())
            .field("current_server", &*self.current_server.lock())
            .field("subscriptions", &self.subs.lock().len())
            .finish_non_exhaustive()
    }
}

impl Shared {
    pub(crate) fn new(
        opts: ConnectOptions,
        credentials: Option<Credentials>,
        pool: ServerPool,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            state: StateMachine::new(),
            opts,
            credentials,
            pool: Mutex::new(pool),
            subs: Mutex::new(HashMap::new()),
            next_sid: AtomicU64::new(1),
            correlator: Correlator::new(),
            current_server: Mutex::new(None),
            server_info: Mutex::new(None),
            counters: Counters::default(),
            cancel: CancellationToken::new(),
            cmd_tx,
        }
    }

    pub(crate) fn report(&self, err: &ClientError) {
        observer::report(self.opts.error_observer.as_ref(), err);
    }

    /// The error to hand a caller when the connection isn't usable.
    pub(crate) fn not_ready_error(&self) -> ClientError {
        match self.state.current() {
            ConnectionState::Closed => ClientError::Closed,
            state => ClientError::NotConnected(format!("connection is {state}")),
        }
    }

    pub(crate) fn ensure_ready(&self) -> ClientResult<()> {
        if self.state.current() == ConnectionState::Ready {
            Ok(())
        } else {
            Err(self.not_ready_error())
        }
    }

    pub(crate) fn connected_server(&self) -> Option<ServerEndpoint> {
        if self.state.current() != ConnectionState::Ready {
            return None;
        }
        self.current_server.lock().clone()
    }

    pub(crate) fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().clone()
    }

    pub(crate) fn stats(&self) -> Statistics {
        let c = &self.counters;
        Statistics {
            in_msgs: c.in_msgs.load(Ordering::Relaxed),
            out_msgs: c.out_msgs.load(Ordering::Relaxed),
            in_bytes: c.in_bytes.load(Ordering::Relaxed),
            out_bytes: c.out_bytes.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Hand a command to the driver.
    ///
    /// While connected this waits for room in the queue. While reconnecting
    /// the queue is the reconnect buffer: the command is accepted if there's
    /// room and rejected with `NotConnected` otherwise.
    pub(crate) async fn enqueue(&self, cmd: Command) -> ClientResult<()> {
        match self.state.current() {
            ConnectionState::Ready => {
                tokio::select! {
                    res = self.cmd_tx.send(cmd) => res.map_err(|_| ClientError::Closed),
                    _ = self.cancel.cancelled() => Err(ClientError::Closed),
                }
            }
            ConnectionState::Reconnecting
            | ConnectionState::Authenticating
            | ConnectionState::Connecting => self.cmd_tx.try_send(cmd).map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    ClientError::NotConnected("reconnect buffer is full".into())
                }
                mpsc::error::TrySendError::Closed(_) => ClientError::Closed,
            }),
            _ => Err(self.not_ready_error()),
        }
    }

    pub(crate) fn add_subscription(
        &self,
        subject: String,
        queue: Option<String>,
        delivery: Delivery,
    ) -> u64 {
        let sid = self.next_sid.fetch_add(1, Ordering::Relaxed);
        self.subs.lock().insert(
            sid,
            SubEntry {
                subject,
                queue,
                delivery,
                delivered: 0,
                max: None,
            },
        );
        sid
    }

    /// Forget a subscription and tell the server, best effort.
    pub(crate) fn remove_subscription(&self, sid: u64) {
        let removed = self.subs.lock().remove(&sid).is_some();
        if removed && !self.state.is_closed() {
            if let Err(err) = self.cmd_tx.try_send(Command::Unsubscribe { sid, max: None }) {
                debug!(sid, ?err, "could not queue UNSUB");
            }
        }
    }

    /// Stop delivery after `max` more messages.
    pub(crate) async fn unsubscribe_after(&self, sid: u64, max: u64) -> ClientResult<()> {
        let cmd = {
            let mut subs = self.subs.lock();
            let Some(entry) = subs.get_mut(&sid) else {
                return Ok(());
            };
            if entry.delivered >= max {
                subs.remove(&sid);
                Command::Unsubscribe { sid, max: None }
            } else {
                entry.max = Some(max);
                Command::Unsubscribe {
                    sid,
                    max: Some(max),
                }
            }
        };
        self.enqueue(cmd).await
    }

    /// Route an incoming message. Never blocks. Returns the sid when this
    /// message used up the subscription's auto-unsubscribe limit.
    fn dispatch(&self, msg: Message) -> Option<u64> {
        self.counters.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.counters
            .in_bytes
            .fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
        metrics::MSGS_IN.inc();

        let sid = msg.sid;
        let mut dropped = None;
        let finished = {
            let mut subs = self.subs.lock();
            let Some(entry) = subs.get_mut(&sid) else {
                trace!(sid, subject = %msg.subject, "message for unknown subscription");
                return None;
            };
            entry.delivered += 1;
            let done = entry.max.is_some_and(|max| entry.delivered >= max);
            match &entry.delivery {
                Delivery::Reply => {
                    if !self.correlator.resolve(&entry.subject, msg) {
                        trace!(sid, "reply for a request that already finished");
                    }
                }
                Delivery::Channel(tx) => match tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        metrics::SLOW_CONSUMER_DROPS.inc();
                        dropped = Some(ClientError::SlowConsumer {
                            sid,
                            subject: entry.subject.clone(),
                        });
                    }
                    // subscriber is gone, its drop already queued UNSUB
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                },
            }
            if done {
                subs.remove(&sid);
            }
            done
        };
        if let Some(err) = dropped {
            self.report(&err);
        }
        finished.then_some(sid)
    }

    fn update_info(&self, info: ServerInfo) {
        let added = self.pool.lock().add_discovered(&info.connect_urls);
        if added > 0 {
            info!(added, "discovered new servers");
        }
        *self.server_info.lock() = Some(info);
    }

    fn fire(&self, cb: &Option<crate::options::Callback>) {
        if let Some(cb) = cb {
            cb();
        }
    }

    /// Move to `Closed` and release everything waiting on the connection.
    /// Idempotent; only the first caller does the work.
    pub(crate) fn shutdown(&self) -> bool {
        if !self.state.close() {
            return false;
        }
        debug!("closing connection");
        self.cancel.cancel();
        self.correlator.close_all();
        // dropping the senders ends every subscriber stream
        self.subs.lock().clear();
        self.fire(&self.opts.on_close);
        true
    }

    /// One connection attempt, abandoned if the client is closed meanwhile.
    async fn attempt(&self, endpoint: &ServerEndpoint) -> ClientResult<Session> {
        tokio::select! {
            res = self.try_connect(endpoint) => res,
            _ = self.cancel.cancelled() => Err(ClientError::Closed),
        }
    }

    async fn try_connect(&self, endpoint: &ServerEndpoint) -> ClientResult<Session> {
        metrics::CONNECT_ATTEMPTS.inc();
        let timeout = self.opts.connect_timeout;
        debug!(server = %endpoint, "opening connection");
        let stream = self.opts.transport.connect(endpoint, timeout).await?;
        self.state.transition(ConnectionState::Authenticating)?;

        let mut framed = Framed::new(stream, NatsCodec::new());
        let info = handshake::read_info(&mut framed, timeout).await?;
        let info = handshake::negotiate(
            &mut framed,
            info,
            self.credentials.as_ref(),
            &self.opts.handshake,
            timeout,
        )
        .await?;
        debug!(server = %endpoint, server_id = %info.server_id, "handshake accepted");

        {
            let mut pool = self.pool.lock();
            pool.set_current(endpoint);
            pool.mark_connected();
        }
        self.update_info(info);
        *self.current_server.lock() = Some(endpoint.clone());

        let mut session = Session::new(framed, endpoint.clone());
        session.resubscribe(self).await?;
        Ok(session)
    }
}

/// Try each configured server once. Returns the first session that reaches
/// `Ready`; otherwise closes the client and returns the last error.
pub(crate) async fn connect_initial(shared: &Shared) -> ClientResult<Session> {
    let endpoints = shared.pool.lock().endpoints();
    let mut last_err = ClientError::NotConnected("no servers to connect to".into());
    for endpoint in endpoints {
        shared.state.transition(ConnectionState::Connecting)?;
        info!(server = %endpoint, "connecting");
        match shared.attempt(&endpoint).await {
            Ok(session) => {
                shared.state.transition(ConnectionState::Ready)?;
                info!(server = %endpoint, "connected");
                return Ok(session);
            }
            Err(ClientError::Closed) => return Err(ClientError::Closed),
            Err(err) => {
                shared.report(&err);
                if matches!(
                    shared.state.current(),
                    ConnectionState::Connecting | ConnectionState::Authenticating
                ) {
                    let _ = shared.state.transition(ConnectionState::Disconnected);
                }
                // every server would reject us the same way
                let fatal = err.is_local() || (err.is_auth() && shared.credentials.is_none());
                last_err = err;
                if fatal {
                    break;
                }
            }
        }
    }
    shared.shutdown();
    Err(last_err)
}

/// Drive the connection until the client closes or reconnection gives up.
pub(crate) async fn run(
    shared: Arc<Shared>,
    mut session: Session,
    mut cmd_rx: mpsc::Receiver<Command>,
) {
    loop {
        let err = match session.serve(&shared, &mut cmd_rx).await {
            Ok(()) => {
                debug!("connection driver stopped");
                return;
            }
            Err(err) => err,
        };
        if shared.state.is_closed() {
            return;
        }
        warn!(server = %session.server, error = %err, "disconnected");
        shared.report(&err);
        // waiting flushes learn the socket is gone
        drop(session);
        shared.fire(&shared.opts.on_disconnect);

        if !shared.opts.reconnect.enabled {
            info!("reconnect disabled, closing");
            shared.shutdown();
            return;
        }
        if shared.state.transition(ConnectionState::Reconnecting).is_err() {
            return;
        }
        match reconnect(&shared).await {
            Some(next) => session = next,
            None => {
                shared.shutdown();
                return;
            }
        }
    }
}

/// Walk the pool until a server accepts us. `None` when the pool is spent
/// or the client was closed.
async fn reconnect(shared: &Shared) -> Option<Session> {
    let policy = shared.opts.reconnect;
    let mut attempt: u64 = 0;
    loop {
        if !policy.wait(&shared.cancel).await {
            return None;
        }
        let Some(endpoint) = shared.pool.lock().next_server(policy.max_attempts) else {
            warn!("server pool exhausted, giving up");
            return None;
        };
        attempt += 1;
        info!(server = %endpoint, attempt, "reconnecting");
        match shared.attempt(&endpoint).await {
            Ok(session) => {
                if shared.state.transition(ConnectionState::Ready).is_err() {
                    return None;
                }
                shared.counters.reconnects.fetch_add(1, Ordering::Relaxed);
                metrics::RECONNECTS.inc();
                info!(server = %endpoint, attempt, "reconnected");
                shared.fire(&shared.opts.on_reconnect);
                return Some(session);
            }
            Err(err) => {
                if shared.state.is_closed() {
                    return None;
                }
                shared.report(&err);
                if shared.state.current() == ConnectionState::Authenticating {
                    let _ = shared.state.transition(ConnectionState::Reconnecting);
                }
            }
        }
    }
}

/// One socket's worth of protocol state.
pub(crate) struct Session {
    framed: Framed<BoxStream, NatsCodec>,
    server: ServerEndpoint,
    /// sids with a SUB on this socket
    sent_sids: HashSet<u64>,
    /// one slot per PING in flight; `Some` for flushes
    pongs: VecDeque<Option<oneshot::Sender<()>>>,
    outstanding_pings: u32,
    /// last `-ERR` the server closes the socket after
    closing_error: Option<ClientError>,
}

impl Session {
    fn new(framed: Framed<BoxStream, NatsCodec>, server: ServerEndpoint) -> Self {
        Self {
            framed,
            server,
            sent_sids: HashSet::new(),
            pongs: VecDeque::new(),
            outstanding_pings: 0,
            closing_error: None,
        }
    }

    /// Re-send every live subscription on a fresh socket.
    async fn resubscribe(&mut self, shared: &Shared) -> ClientResult<()> {
        let subs: Vec<(u64, String, Option<String>, Option<u64>)> = shared
            .subs
            .lock()
            .iter()
            .map(|(sid, e)| {
                let remaining = e.max.map(|max| max.saturating_sub(e.delivered));
                (*sid, e.subject.clone(), e.queue.clone(), remaining)
            })
            .collect();
        if subs.is_empty() {
            return Ok(());
        }
        debug!(count = subs.len(), "resubscribing");
        for (sid, subject, queue, remaining) in subs {
            self.framed
                .feed(ClientOp::Sub {
                    subject,
                    queue,
                    sid,
                })
                .await?;
            if let Some(max) = remaining {
                self.framed
                    .feed(ClientOp::Unsub {
                        sid,
                        max: Some(max),
                    })
                    .await?;
            }
            self.sent_sids.insert(sid);
        }
        self.framed.flush().await
    }

    async fn serve(
        &mut self,
        shared: &Shared,
        cmd_rx: &mut mpsc::Receiver<Command>,
    ) -> ClientResult<()> {
        let period = shared.opts.ping_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => {
                    self.drain(shared, cmd_rx).await;
                    return Ok(());
                }
                frame = self.framed.next() => match frame {
                    Some(Ok(op)) => self.handle_op(shared, op).await?,
                    Some(Err(err)) => return Err(self.closing_error.take().unwrap_or(err)),
                    None => {
                        return Err(self.closing_error.take().unwrap_or_else(|| {
                            ClientError::io(
                                io::ErrorKind::UnexpectedEof,
                                format!("{} closed the connection", self.server),
                            )
                        }));
                    }
                },
                Some(cmd) = cmd_rx.recv() => {
                    self.write_command(shared, cmd).await?;
                    for _ in 1..MAX_BATCH {
                        match cmd_rx.try_recv() {
                            Ok(cmd) => self.write_command(shared, cmd).await?,
                            Err(_) => break,
                        }
                    }
                    self.framed.flush().await?;
                }
                _ = keepalive.tick() => self.keepalive(shared).await?,
            }
        }
    }

    async fn handle_op(&mut self, shared: &Shared, op: ServerOp) -> ClientResult<()> {
        match op {
            ServerOp::Msg {
                subject,
                sid,
                reply,
                payload,
            } => {
                let finished = shared.dispatch(Message {
                    subject,
                    reply,
                    payload,
                    sid,
                });
                if let Some(sid) = finished {
                    self.sent_sids.remove(&sid);
                }
            }
            ServerOp::Ping => self.framed.send(ClientOp::Pong).await?,
            ServerOp::Pong => {
                self.outstanding_pings = 0;
                if let Some(Some(waiter)) = self.pongs.pop_front() {
                    let _ = waiter.send(());
                }
            }
            ServerOp::Ok => trace!("+OK"),
            ServerOp::Err(msg) => {
                let err = handshake::classify_server_error(&msg);
                if err.is_auth() {
                    return Err(err);
                }
                if handshake::server_error_keeps_connection(&msg) {
                    shared.report(&err);
                } else {
                    // reported once as the disconnect cause when the socket drops
                    warn!(server = %self.server, %msg, "server error, expecting close");
                    self.closing_error = Some(err);
                }
            }
            ServerOp::Info(info) => {
                self.framed.codec_mut().set_max_payload(info.max_payload);
                shared.update_info(*info);
            }
        }
        Ok(())
    }

    /// Write one command without flushing.
    async fn write_command(&mut self, shared: &Shared, cmd: Command) -> ClientResult<()> {
        match cmd {
            Command::Publish {
                subject,
                reply,
                payload,
            } => {
                shared.counters.out_msgs.fetch_add(1, Ordering::Relaxed);
                shared
                    .counters
                    .out_bytes
                    .fetch_add(payload.len() as u64, Ordering::Relaxed);
                metrics::MSGS_OUT.inc();
                self.framed
                    .feed(ClientOp::Pub {
                        subject,
                        reply,
                        payload,
                    })
                    .await
            }
            Command::Subscribe {
                sid,
                subject,
                queue,
            } => {
                // already covered by resubscribe, or gone before we got here
                if self.sent_sids.contains(&sid) || !shared.subs.lock().contains_key(&sid) {
                    return Ok(());
                }
                self.sent_sids.insert(sid);
                self.framed
                    .feed(ClientOp::Sub {
                        subject,
                        queue,
                        sid,
                    })
                    .await
            }
            Command::Unsubscribe { sid, max } => {
                let sent = match max {
                    Some(_) => self.sent_sids.contains(&sid),
                    None => self.sent_sids.remove(&sid),
                };
                if !sent {
                    return Ok(());
                }
                self.framed.feed(ClientOp::Unsub { sid, max }).await
            }
            Command::Flush(waiter) => {
                self.pongs.push_back(Some(waiter));
                self.framed.feed(ClientOp::Ping).await
            }
        }
    }

    async fn keepalive(&mut self, shared: &Shared) -> ClientResult<()> {
        if self.outstanding_pings >= shared.opts.max_outstanding_pings {
            return Err(ClientError::io(
                io::ErrorKind::TimedOut,
                format!(
                    "stale connection to {}: {} pings unanswered",
                    self.server, self.outstanding_pings
                ),
            ));
        }
        self.outstanding_pings += 1;
        self.pongs.push_back(None);
        trace!(outstanding = self.outstanding_pings, "keepalive PING");
        self.framed.send(ClientOp::Ping).await
    }

    /// Write whatever is still queued and flush, on close.
    async fn drain(&mut self, shared: &Shared, cmd_rx: &mut mpsc::Receiver<Command>) {
        while let Ok(cmd) = cmd_rx.try_recv() {
            if matches!(cmd, Command::Flush(_)) {
                continue;
            }
            if self.write_command(shared, cmd).await.is_err() {
                return;
            }
        }
        let timeout = shared.opts.connect_timeout;
        if tokio::time::timeout(timeout, self.framed.flush()).await.is_err() {
            debug!(server = %self.server, "timed out flushing on close");
        }
    }
}
