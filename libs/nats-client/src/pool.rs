//! Server pool: the ordered set of endpoints to (re)connect to.

use std::{collections::VecDeque, fmt, str::FromStr, time::Instant};

use rand::seq::SliceRandom;
use tracing::debug;

use crate::error::{ClientError, ClientResult};

/// Port used when a server url doesn't name one.
pub const DEFAULT_PORT: u16 = 4222;

/// One NATS server address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    /// learned from a server's `connect_urls` rather than configured
    pub discovered: bool,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            discovered: false,
        }
    }

    /// `host:port`, suitable for `TcpStream::connect`
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn same_address(&self, other: &ServerEndpoint) -> bool {
        self.host.eq_ignore_ascii_case(&other.host) && self.port == other.port
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nats://{}", self.address())
    }
}

impl FromStr for ServerEndpoint {
    type Err = ClientError;

    /// Accepts `nats://host:port`, `tls://host`, `host:port`, `[::1]:4222`
    /// and bare hosts. Any user info is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let rest = match s.split_once("://") {
            Some((_scheme, rest)) => rest,
            None => s,
        };
        let rest = rest.split('/').next().unwrap_or_default();
        let rest = match rest.rsplit_once('@') {
            Some((_userinfo, host)) => host,
            None => rest,
        };
        if rest.is_empty() {
            return Err(ClientError::Config(format!("invalid server url {s:?}")));
        }

        let (host, port) = if let Some(v6) = rest.strip_prefix('[') {
            let (host, tail) = v6
                .split_once(']')
                .ok_or_else(|| ClientError::Config(format!("invalid server url {s:?}")))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(ClientError::Config(format!("invalid server url {s:?}"))),
            }
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };
        if host.is_empty() {
            return Err(ClientError::Config(format!("missing host in {s:?}")));
        }
        let port = match port {
            Some(p) => p
                .parse()
                .map_err(|_| ClientError::Config(format!("invalid port in {s:?}")))?,
            None => DEFAULT_PORT,
        };
        Ok(ServerEndpoint::new(host, port))
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    endpoint: ServerEndpoint,
    reconnects: u32,
    last_attempt: Option<Instant>,
}

/// Endpoints in the order they'll be tried. The front entry is the current
/// (or most recently tried) server.
#[derive(Debug, Clone)]
pub struct ServerPool {
    entries: VecDeque<PoolEntry>,
}

impl ServerPool {
    /// Build from configured urls, dropping duplicates. Shuffled once unless
    /// `no_randomize`.
    pub fn new<S: AsRef<str>>(urls: &[S], no_randomize: bool) -> ClientResult<Self> {
        let mut endpoints: Vec<ServerEndpoint> = Vec::with_capacity(urls.len());
        for url in urls {
            let ep: ServerEndpoint = url.as_ref().parse()?;
            if !endpoints.iter().any(|e| e.same_address(&ep)) {
                endpoints.push(ep);
            }
        }
        if endpoints.is_empty() {
            return Err(ClientError::Config("server list is empty".into()));
        }
        if !no_randomize {
            endpoints.shuffle(&mut rand::thread_rng());
        }
        Ok(Self {
            entries: endpoints
                .into_iter()
                .map(|endpoint| PoolEntry {
                    endpoint,
                    reconnects: 0,
                    last_attempt: None,
                })
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Endpoints in current order.
    pub fn endpoints(&self) -> Vec<ServerEndpoint> {
        self.entries.iter().map(|e| e.endpoint.clone()).collect()
    }

    /// The server at the front of the pool.
    pub fn current(&self) -> Option<&ServerEndpoint> {
        self.entries.front().map(|e| &e.endpoint)
    }

    /// Put `ep` at the front, keeping the relative order of the rest.
    pub fn set_current(&mut self, ep: &ServerEndpoint) {
        if let Some(idx) = self.entries.iter().position(|e| e.endpoint.same_address(ep)) {
            self.entries.rotate_left(idx);
        }
    }

    /// A connection to the front server succeeded.
    pub fn mark_connected(&mut self) {
        if let Some(entry) = self.entries.front_mut() {
            entry.reconnects = 0;
        }
    }

    /// Pick the next server to reconnect to.
    ///
    /// Moves the current server to the back (or drops it once it has used up
    /// `max_attempts`) and returns the new front, charging it one attempt.
    /// `None` means the pool is exhausted.
    pub fn next_server(&mut self, max_attempts: Option<u32>) -> Option<ServerEndpoint> {
        let prev = self.entries.pop_front()?;
        match max_attempts {
            Some(max) if prev.reconnects >= max => {
                debug!(server = %prev.endpoint, attempts = prev.reconnects, "removing server from pool");
            }
            _ => self.entries.push_back(prev),
        }
        let next = self.entries.front_mut()?;
        next.reconnects += 1;
        next.last_attempt = Some(Instant::now());
        Some(next.endpoint.clone())
    }

    /// Add servers a peer told us about. Configured servers are never
    /// replaced and duplicates are skipped. Returns how many were added.
    pub fn add_discovered<S: AsRef<str>>(&mut self, urls: &[S]) -> usize {
        let mut added = 0;
        for url in urls {
            let Ok(mut ep) = url.as_ref().parse::<ServerEndpoint>() else {
                debug!(url = url.as_ref(), "ignoring unparseable discovered server");
                continue;
            };
            if self.entries.iter().any(|e| e.endpoint.same_address(&ep)) {
                continue;
            }
            ep.discovered = true;
            self.entries.push_back(PoolEntry {
                endpoint: ep,
                reconnects: 0,
                last_attempt: None,
            });
            added += 1;
        }
        added
    }
}
