//! In-process NATS broker for integration tests.
//!
//! Speaks enough of the protocol for the client under test: INFO with a
//! nonce, CONNECT verification (open, raw NKEY or account-signed JWT),
//! PING/PONG and PUB/SUB/UNSUB routing. Servers started on the same
//! [`Router`] form a cluster: a message published on one reaches
//! subscribers on all of them.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use nkeys::KeyPair;
use parking_lot::Mutex;
use rand::{Rng, distributions::Alphanumeric};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedReadHalf},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How a server decides whether to accept a CONNECT.
#[derive(Debug, Clone)]
pub enum Auth {
    /// no authentication
    Open,
    /// the nonce must be signed by one of these user public keys
    Nkeys(HashSet<String>),
    /// a user JWT issued by one of these account public keys, and the nonce
    /// signed by the JWT's subject
    Jwt(HashSet<String>),
}

impl Auth {
    pub fn nkeys<I: IntoIterator<Item = String>>(keys: I) -> Self {
        Auth::Nkeys(keys.into_iter().collect())
    }

    pub fn accounts<I: IntoIterator<Item = String>>(accounts: I) -> Self {
        Auth::Jwt(accounts.into_iter().collect())
    }

    fn required(&self) -> bool {
        !matches!(self, Auth::Open)
    }
}

#[derive(Debug)]
struct Sub {
    conn: u64,
    sid: u64,
    subject: String,
    queue: Option<String>,
}

/// Message routing shared by the servers of one cluster.
#[derive(Debug, Default)]
pub struct Router {
    next_conn: AtomicU64,
    conns: Mutex<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
    subs: Mutex<Vec<Sub>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn register(&self, tx: mpsc::UnboundedSender<Vec<u8>>) -> u64 {
        let id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.conns.lock().insert(id, tx);
        id
    }

    fn drop_conn(&self, conn: u64) {
        self.conns.lock().remove(&conn);
        self.subs.lock().retain(|s| s.conn != conn);
    }

    fn subscribe(&self, conn: u64, sid: u64, subject: String, queue: Option<String>) {
        self.subs.lock().push(Sub {
            conn,
            sid,
            subject,
            queue,
        });
    }

    fn unsubscribe(&self, conn: u64, sid: u64) {
        self.subs.lock().retain(|s| !(s.conn == conn && s.sid == sid));
    }

    fn publish(&self, subject: &str, reply: Option<&str>, payload: &[u8]) {
        let targets: Vec<(u64, u64)> = {
            let subs = self.subs.lock();
            let mut seen_queues = HashSet::new();
            subs.iter()
                .filter(|s| subject_matches(&s.subject, subject))
                .filter(|s| match &s.queue {
                    Some(q) => seen_queues.insert(q.clone()),
                    None => true,
                })
                .map(|s| (s.conn, s.sid))
                .collect()
        };
        let conns = self.conns.lock();
        for (conn, sid) in targets {
            let Some(tx) = conns.get(&conn) else { continue };
            let mut frame = match reply {
                Some(reply) => format!("MSG {subject} {sid} {reply} {}\r\n", payload.len()),
                None => format!("MSG {subject} {sid} {}\r\n", payload.len()),
            }
            .into_bytes();
            frame.extend_from_slice(payload);
            frame.extend_from_slice(b"\r\n");
            let _ = tx.send(frame);
        }
    }
}

/// `*` matches one token, a trailing `>` matches the rest.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Connection counters for assertions.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections: AtomicUsize,
    pub accepted: AtomicUsize,
    pub rejected: AtomicUsize,
}

struct ServerCtx {
    id: String,
    auth: Auth,
    connect_urls: Vec<String>,
    router: Arc<Router>,
    stats: Arc<ServerStats>,
}

/// A running mock server.
pub struct MockServer {
    addr: SocketAddr,
    stats: Arc<ServerStats>,
    router: Arc<Router>,
    cancel: CancellationToken,
    accept: JoinHandle<()>,
}

impl MockServer {
    /// Start a standalone server on an ephemeral port.
    pub async fn start(auth: Auth) -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap(), Router::new(), auth, vec![]).await
    }

    /// Start a server joined to `router`.
    pub async fn start_in(router: &Arc<Router>, auth: Auth) -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap(), router.clone(), auth, vec![]).await
    }

    /// Start on a specific address, advertising `connect_urls` in INFO.
    pub async fn start_on(
        addr: SocketAddr,
        router: Arc<Router>,
        auth: Auth,
        connect_urls: Vec<String>,
    ) -> Self {
        let listener = TcpListener::bind(addr).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let stats = Arc::new(ServerStats::default());
        let cancel = CancellationToken::new();
        let ctx = Arc::new(ServerCtx {
            id: format!("NMOCK{}", addr.port()),
            auth,
            connect_urls,
            router: router.clone(),
            stats: stats.clone(),
        });

        let token = cancel.clone();
        let accept = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    res = listener.accept() => {
                        let Ok((stream, peer)) = res else { continue };
                        debug!(%peer, server = %ctx.id, "mock server accepted connection");
                        ctx.stats.connections.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve_conn(stream, ctx.clone(), token.child_token()));
                    }
                }
            }
        });

        Self {
            addr,
            stats,
            router,
            cancel,
            accept,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("nats://{}", self.addr)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Stop listening and drop every client connection. Returns the address
    /// so the server can be restarted in place.
    pub async fn kill(mut self) -> SocketAddr {
        self.cancel.cancel();
        let _ = (&mut self.accept).await;
        self.addr
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn nonce() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(22)
        .map(char::from)
        .collect()
}

async fn serve_conn(stream: TcpStream, ctx: Arc<ServerCtx>, cancel: CancellationToken) {
    let (rd, mut wr) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => break,
                buf = rx.recv() => match buf {
                    Some(buf) => {
                        if wr.write_all(&buf).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
        let _ = wr.shutdown().await;
    });

    let nonce = nonce();
    let info = json!({
        "server_id": ctx.id,
        "version": "2.10.0",
        "proto": 1,
        "max_payload": 1048576,
        "auth_required": ctx.auth.required(),
        "nonce": ctx.auth.required().then(|| nonce.clone()),
        "connect_urls": ctx.connect_urls,
    });
    let _ = tx.send(format!("INFO {info}\r\n").into_bytes());

    let mut conn = None;
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = read_loop(rd, tx, &ctx, &nonce, &mut conn) => {}
    }
    if let Some(conn) = conn {
        ctx.router.drop_conn(conn);
    }
    let _ = writer.await;
}

/// Stores the router id in `conn` once registered, so the caller can clean
/// up however the loop ends.
async fn read_loop(
    rd: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    ctx: &ServerCtx,
    nonce: &str,
    conn: &mut Option<u64>,
) {
    let mut reader = BufReader::new(rd);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let trimmed = line.trim_end();
        let (op, args) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        trace!(server = %ctx.id, op, "mock server read");
        match op.to_ascii_uppercase().as_str() {
            "CONNECT" => {
                let connect: Value = serde_json::from_str(args).unwrap_or(Value::Null);
                if !verify_connect(&ctx.auth, nonce, &connect) {
                    ctx.stats.rejected.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(b"-ERR 'Authorization Violation'\r\n".to_vec());
                    return;
                }
                ctx.stats.accepted.fetch_add(1, Ordering::SeqCst);
                *conn = Some(ctx.router.register(tx.clone()));
            }
            "PING" => {
                let _ = tx.send(b"PONG\r\n".to_vec());
            }
            "PONG" => {}
            "SUB" => {
                let Some(id) = *conn else { return };
                let parts: Vec<&str> = args.split_whitespace().collect();
                let (subject, queue, sid) = match parts.as_slice() {
                    [subject, sid] => (subject, None, sid),
                    [subject, queue, sid] => (subject, Some(queue.to_string()), sid),
                    _ => return,
                };
                let Ok(sid) = sid.parse() else { return };
                ctx.router.subscribe(id, sid, subject.to_string(), queue);
            }
            "UNSUB" => {
                let Some(id) = *conn else { return };
                let mut parts = args.split_whitespace();
                let Some(Ok(sid)) = parts.next().map(str::parse::<u64>) else {
                    return;
                };
                // auto-unsubscribe limits aren't tracked
                if parts.next().is_none() {
                    ctx.router.unsubscribe(id, sid);
                }
            }
            "PUB" => {
                if conn.is_none() {
                    return;
                }
                let parts: Vec<&str> = args.split_whitespace().collect();
                let (subject, reply, len) = match parts.as_slice() {
                    [subject, len] => (*subject, None, len),
                    [subject, reply, len] => (*subject, Some(*reply), len),
                    _ => return,
                };
                let Ok(len) = len.parse::<usize>() else { return };
                let mut payload = vec![0; len + 2];
                if reader.read_exact(&mut payload).await.is_err() {
                    return;
                }
                payload.truncate(len);
                ctx.router.publish(subject, reply, &payload);
            }
            _ => {
                let _ = tx.send(b"-ERR 'Unknown Protocol Operation'\r\n".to_vec());
                return;
            }
        }
    }
}

fn verify_connect(auth: &Auth, nonce: &str, connect: &Value) -> bool {
    match auth {
        Auth::Open => true,
        Auth::Nkeys(keys) => {
            let Some(nkey) = connect["nkey"].as_str() else {
                return false;
            };
            keys.contains(nkey) && verify_nonce(nkey, nonce, connect["sig"].as_str())
        }
        Auth::Jwt(accounts) => {
            let Some(user) = connect["jwt"].as_str().and_then(|jwt| jwt_subject(jwt, accounts))
            else {
                return false;
            };
            verify_nonce(&user, nonce, connect["sig"].as_str())
        }
    }
}

fn verify_nonce(public_key: &str, nonce: &str, sig: Option<&str>) -> bool {
    let Some(sig) = sig.and_then(|s| URL_SAFE_NO_PAD.decode(s).ok()) else {
        return false;
    };
    KeyPair::from_public_key(public_key)
        .and_then(|kp| kp.verify(nonce.as_bytes(), &sig))
        .is_ok()
}

/// The user key named by a JWT, if an allowed account signed it.
fn jwt_subject(jwt: &str, accounts: &HashSet<String>) -> Option<String> {
    let (signing_input, sig) = jwt.rsplit_once('.')?;
    let (_header, claims) = signing_input.split_once('.')?;
    let claims: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims).ok()?).ok()?;
    let issuer = claims["iss"].as_str()?;
    if !accounts.contains(issuer) {
        return None;
    }
    let sig = URL_SAFE_NO_PAD.decode(sig).ok()?;
    KeyPair::from_public_key(issuer)
        .ok()?
        .verify(signing_input.as_bytes(), &sig)
        .ok()?;
    claims["sub"].as_str().map(str::to_owned)
}
