use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing::debug;

pub mod wire;

/// Where the client gets its signing material from, as named in the config file.
/// Callback credentials can only be supplied programmatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// combined JWT + seed `.creds` bundle
    Bundle(PathBuf),
    /// bare NKEY seed file
    Seed(PathBuf),
}

/// client config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub servers: Vec<String>,
    pub name: Option<String>,
    pub reconnect: bool,
    pub reconnect_time_wait: Duration,
    /// `None` means unbounded
    pub max_reconnect_attempts: Option<u32>,
    pub no_randomize: bool,
    pub credentials: Option<CredentialSource>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub ping_interval: Duration,
    pub max_outstanding_pings: u32,
    pub pending_capacity: usize,
    pub subscription_capacity: usize,
    pub verbose: bool,
    pub pedantic: bool,
    pub echo: bool,
    path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec![wire::DEFAULT_SERVER.to_owned()],
            name: None,
            reconnect: wire::default_reconnect(),
            reconnect_time_wait: wire::default_reconnect_time_wait(),
            max_reconnect_attempts: u32::try_from(wire::default_max_reconnect_attempts()).ok(),
            no_randomize: false,
            credentials: None,
            request_timeout: wire::default_request_timeout(),
            connect_timeout: wire::default_connect_timeout(),
            ping_interval: wire::default_ping_interval(),
            max_outstanding_pings: wire::default_max_outstanding_pings(),
            pending_capacity: wire::default_pending_capacity(),
            subscription_capacity: wire::default_subscription_capacity(),
            verbose: false,
            pedantic: false,
            echo: wire::default_echo(),
            path: None,
        }
    }
}

impl ClientConfig {
    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::parse_str(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to find config at {}", &path.display()))?,
        )?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// attempts to decode the config first as JSON, then YAML, finally erroring if neither work
    pub fn parse_str<S: AsRef<str>>(s: S) -> Result<Self> {
        let s = s.as_ref();
        let wire: wire::Config = match serde_json::from_str(s) {
            Ok(cfg) => cfg,
            Err(_err) => serde_yaml::from_str(s).context("config is neither valid JSON nor YAML")?,
        };
        let config = Self::from_wire(wire)?;
        debug!(?config);
        Ok(config)
    }

    fn from_wire(cfg: wire::Config) -> Result<Self> {
        let credentials = match (cfg.credentials_path, cfg.nkey_seed_path) {
            (Some(_), Some(_)) => {
                bail!("only one of `credentials_path` or `nkey_seed_path` may be configured")
            }
            (Some(path), None) => Some(CredentialSource::Bundle(path)),
            (None, Some(path)) => Some(CredentialSource::Seed(path)),
            (None, None) => None,
        };
        let config = Self {
            servers: cfg.servers.into_vec(),
            name: cfg.name,
            reconnect: cfg.reconnect,
            reconnect_time_wait: cfg.reconnect_time_wait,
            max_reconnect_attempts: u32::try_from(cfg.max_reconnect_attempts).ok(),
            no_randomize: cfg.no_randomize,
            credentials,
            request_timeout: cfg.request_timeout,
            connect_timeout: cfg.connect_timeout,
            ping_interval: cfg.ping_interval,
            max_outstanding_pings: cfg.max_outstanding_pings,
            pending_capacity: cfg.pending_capacity,
            subscription_capacity: cfg.subscription_capacity,
            verbose: cfg.verbose,
            pedantic: cfg.pedantic,
            echo: cfg.echo,
            path: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// check invariants that serde can't express
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("at least one server must be configured");
        }
        if let Some(s) = self.servers.iter().find(|s| s.trim().is_empty()) {
            bail!("empty server url in server list: {s:?}");
        }
        if self.ping_interval.is_zero() {
            bail!("`ping_interval` must be greater than zero");
        }
        if self.pending_capacity == 0 || self.subscription_capacity == 0 {
            bail!("`pending_capacity` and `subscription_capacity` must be greater than zero");
        }
        Ok(())
    }

    /// path the config was loaded from, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
