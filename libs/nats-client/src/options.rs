//! Connection options builder.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    client::Client,
    connection::{TcpTransport, Transport},
    credentials::{BoxError, CallbackCredentials, Credentials, SignatureFn, StringFn},
    error::{ClientError, ClientResult},
    handshake::HandshakeOptions,
    observer::ErrorObserver,
    reconnect::ReconnectPolicy,
};

/// Lifecycle notification.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_OUTSTANDING_PINGS: u32 = 2;
pub const DEFAULT_PENDING_CAPACITY: usize = 1024;
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 512;
pub const DEFAULT_SERVER: &str = "nats://127.0.0.1:4222";

/// How to connect. Built with chained setters and finished with
/// [`ConnectOptions::connect`].
///
/// ```no_run
/// # async fn run() -> nats_client::ClientResult<()> {
/// let client = nats_client::ConnectOptions::new()
///     .servers(["nats://10.0.0.1:4222", "nats://10.0.0.2:4222"])
///     .user_credentials("/etc/nats/user.creds")
///     .on_error(|err: &nats_client::ClientError| eprintln!("{err}"))
///     .connect()
///     .await?;
/// client.publish("greeting", "hello").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectOptions {
    pub(crate) servers: Vec<String>,
    pub(crate) handshake: HandshakeOptions,
    credentials: Option<Credentials>,
    signature_callback: Option<SignatureFn>,
    token_callback: Option<StringFn>,
    nkey_callback: Option<StringFn>,
    /// number of credential setters used; more than one is a config error
    credential_sources: u8,
    pub(crate) reconnect: ReconnectPolicy,
    pub(crate) no_randomize: bool,
    pub(crate) request_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) ping_interval: Duration,
    pub(crate) max_outstanding_pings: u32,
    pub(crate) pending_capacity: usize,
    pub(crate) subscription_capacity: usize,
    pub(crate) error_observer: Option<Arc<dyn ErrorObserver>>,
    pub(crate) on_reconnect: Option<Callback>,
    pub(crate) on_disconnect: Option<Callback>,
    pub(crate) on_close: Option<Callback>,
    pub(crate) transport: Arc<dyn Transport>,
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("servers", &self.servers)
            .field("handshake", &self.handshake)
            .field("credentials", &self.credentials)
            .field("signature_callback", &self.signature_callback.is_some())
            .field("reconnect", &self.reconnect)
            .field("no_randomize", &self.no_randomize)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("pending_capacity", &self.pending_capacity)
            .finish_non_exhaustive()
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_SERVER.to_owned()],
            handshake: HandshakeOptions::default(),
            credentials: None,
            signature_callback: None,
            token_callback: None,
            nkey_callback: None,
            credential_sources: 0,
            reconnect: ReconnectPolicy::default(),
            no_randomize: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_outstanding_pings: DEFAULT_MAX_OUTSTANDING_PINGS,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            error_observer: None,
            on_reconnect: None,
            on_disconnect: None,
            on_close: None,
            transport: Arc::new(TcpTransport),
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options from a parsed config file. Observers and callback credentials
    /// can still be added afterwards.
    pub fn from_config(cfg: &config::ClientConfig) -> Self {
        let mut opts = Self::new()
            .servers(cfg.servers.iter().cloned())
            .reconnect(cfg.reconnect)
            .reconnect_time_wait(cfg.reconnect_time_wait)
            .max_reconnect_attempts(cfg.max_reconnect_attempts)
            .no_randomize(cfg.no_randomize)
            .request_timeout(cfg.request_timeout)
            .connect_timeout(cfg.connect_timeout)
            .ping_interval(cfg.ping_interval)
            .max_outstanding_pings(cfg.max_outstanding_pings)
            .pending_capacity(cfg.pending_capacity)
            .subscription_capacity(cfg.subscription_capacity)
            .verbose(cfg.verbose)
            .pedantic(cfg.pedantic)
            .echo(cfg.echo);
        if let Some(name) = &cfg.name {
            opts = opts.name(name.clone());
        }
        match &cfg.credentials {
            Some(config::CredentialSource::Bundle(path)) => opts = opts.user_credentials(path),
            Some(config::CredentialSource::Seed(path)) => opts = opts.nkey_seed(path),
            None => {}
        }
        opts
    }

    /// Servers to connect to, tried in order when `no_randomize` is set.
    pub fn servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Client name reported to the server.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.handshake.name = Some(name.into());
        self
    }

    /// Authenticate with a `.creds` bundle (user JWT + seed).
    pub fn user_credentials(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials = Some(Credentials::creds_file(path));
        self.credential_sources = self.credential_sources.saturating_add(1);
        self
    }

    /// Authenticate with a bare NKEY seed file.
    pub fn nkey_seed(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials = Some(Credentials::seed_file(path));
        self.credential_sources = self.credential_sources.saturating_add(1);
        self
    }

    /// Authenticate with a prebuilt credential source.
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self.credential_sources = self.credential_sources.saturating_add(1);
        self
    }

    /// Sign the server nonce with a user function.
    pub fn signature_callback<F>(mut self, signature: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
    {
        self.signature_callback = Some(Arc::new(signature));
        self.credential_sources = self.credential_sources.saturating_add(1);
        self
    }

    /// Supply the user JWT from a function. Needs a signature callback.
    pub fn token_callback<F>(mut self, token: F) -> Self
    where
        F: Fn() -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.token_callback = Some(Arc::new(token));
        self
    }

    /// Supply the public NKEY from a function. Needs a signature callback.
    pub fn nkey_callback<F>(mut self, nkey: F) -> Self
    where
        F: Fn() -> Result<String, BoxError> + Send + Sync + 'static,
    {
        self.nkey_callback = Some(Arc::new(nkey));
        self
    }

    pub fn reconnect(mut self, enabled: bool) -> Self {
        self.reconnect.enabled = enabled;
        self
    }

    /// Pause before every reconnect attempt. May be zero.
    pub fn reconnect_time_wait(mut self, wait: Duration) -> Self {
        self.reconnect.time_wait = wait;
        self
    }

    /// Attempts per server before it's dropped from the pool; `None` retries
    /// forever.
    pub fn max_reconnect_attempts(mut self, max: Option<u32>) -> Self {
        self.reconnect.max_attempts = max;
        self
    }

    /// Keep the configured server order instead of shuffling it once.
    pub fn no_randomize(mut self, no_randomize: bool) -> Self {
        self.no_randomize = no_randomize;
        self
    }

    /// Default timeout for [`Client::request`].
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Bound on opening a socket and on each handshake step.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn max_outstanding_pings(mut self, max: u32) -> Self {
        self.max_outstanding_pings = max;
        self
    }

    /// Commands buffered while reconnecting.
    pub fn pending_capacity(mut self, capacity: usize) -> Self {
        self.pending_capacity = capacity;
        self
    }

    /// Messages buffered per subscription before they're dropped.
    pub fn subscription_capacity(mut self, capacity: usize) -> Self {
        self.subscription_capacity = capacity;
        self
    }

    /// Whether the server echoes our own publishes to our subscriptions.
    pub fn echo(mut self, echo: bool) -> Self {
        self.handshake.echo = echo;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.handshake.verbose = verbose;
        self
    }

    pub fn pedantic(mut self, pedantic: bool) -> Self {
        self.handshake.pedantic = pedantic;
        self
    }

    /// Where every connection error goes.
    pub fn error_observer<O: ErrorObserver + 'static>(mut self, observer: O) -> Self {
        self.error_observer = Some(Arc::new(observer));
        self
    }

    /// Closure form of [`ConnectOptions::error_observer`].
    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: Fn(&ClientError) + Send + Sync + 'static,
    {
        self.error_observer(handler)
    }

    /// Called after every successful reconnect.
    pub fn on_reconnect<F: Fn() + Send + Sync + 'static>(mut self, cb: F) -> Self {
        self.on_reconnect = Some(Arc::new(cb));
        self
    }

    /// Called when an established connection drops.
    pub fn on_disconnect<F: Fn() + Send + Sync + 'static>(mut self, cb: F) -> Self {
        self.on_disconnect = Some(Arc::new(cb));
        self
    }

    /// Called once when the client closes for good.
    pub fn on_close<F: Fn() + Send + Sync + 'static>(mut self, cb: F) -> Self {
        self.on_close = Some(Arc::new(cb));
        self
    }

    /// Replace how sockets are opened.
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    /// Connect and wait until the first server accepts the handshake.
    pub async fn connect(self) -> ClientResult<Client> {
        Client::connect(self).await
    }

    /// Check the options and settle on a single credential source.
    pub(crate) fn resolve_credentials(&self) -> ClientResult<Option<Credentials>> {
        if self.credential_sources > 1 {
            return Err(ClientError::Config(
                "only one of credentials file, seed file, credentials or signature callback may be configured"
                    .into(),
            ));
        }
        if let Some(signature) = &self.signature_callback {
            let mut cb = CallbackCredentials::from_arc(signature.clone());
            if let Some(token) = &self.token_callback {
                cb.set_token(token.clone());
            }
            if let Some(nkey) = &self.nkey_callback {
                cb.set_nkey(nkey.clone());
            }
            debug!("using callback credentials");
            return Ok(Some(Credentials::Callbacks(cb)));
        }
        if self.token_callback.is_some() || self.nkey_callback.is_some() {
            return Err(ClientError::Config(
                "token and nkey callbacks need a signature callback".into(),
            ));
        }
        Ok(self.credentials.clone())
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        if self.servers.is_empty() {
            return Err(ClientError::Config("server list is empty".into()));
        }
        if self.ping_interval.is_zero() {
            return Err(ClientError::Config("ping interval must be non-zero".into()));
        }
        if self.pending_capacity == 0 || self.subscription_capacity == 0 {
            return Err(ClientError::Config(
                "pending and subscription capacity must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
