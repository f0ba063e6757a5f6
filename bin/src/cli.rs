//! Parse from either cli or env var

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result};
pub use clap::Parser;
use clap::Subcommand;
use config::{ClientConfig, CredentialSource};
use nats_client::ConnectOptions;

/// default log level. Can use this argument or NATSC_LOG env var
pub const DEFAULT_NATSC_LOG: &str = "info";
/// log as "json", "pretty" or "standard" (unstructured)
pub const DEFAULT_LOG_FORMAT: &str = "standard";
/// tokio worker thread name
pub static DEFAULT_THREAD_NAME: &str = "natsc-worker";

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(author, name = "natsc", bin_name = "natsc", about, long_about = None)]
/// publish, subscribe and make requests against a NATS cluster
pub struct Config {
    /// path to a client config file (JSON or YAML)
    #[clap(short, long, value_parser, env = "NATSC_CONFIG")]
    pub config_path: Option<PathBuf>,
    /// server url, may be repeated. Overrides the config file's server list
    #[clap(short, long = "server", value_parser, env = "NATS_URL", value_delimiter = ',')]
    pub servers: Vec<String>,
    /// `.creds` file holding a user JWT and NKEY seed
    #[clap(long, value_parser, env = "NATS_CREDS", conflicts_with = "nkey")]
    pub creds: Option<PathBuf>,
    /// file holding a bare NKEY seed
    #[clap(long, value_parser, env = "NATS_NKEY")]
    pub nkey: Option<PathBuf>,
    /// client name reported to the server
    #[clap(long, value_parser, env = "NATSC_NAME")]
    pub name: Option<String>,
    /// set the log level. All valid RUST_LOG arguments are accepted
    #[clap(long, env = "NATSC_LOG", value_parser, default_value = DEFAULT_NATSC_LOG)]
    pub log: String,
    /// log format: standard, json or pretty
    #[clap(long, env = "LOG_FORMAT", value_parser, default_value = DEFAULT_LOG_FORMAT)]
    pub log_format: String,
    /// worker threads, defaults to the number of logical CPUs
    #[clap(long, env = "NATSC_THREADS", value_parser)]
    pub threads: Option<usize>,
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// publish one message
    Pub {
        subject: String,
        #[clap(default_value = "")]
        payload: String,
        /// reply subject to attach
        #[clap(long)]
        reply: Option<String>,
    },
    /// print messages as they arrive
    Sub {
        subject: String,
        /// join a queue group
        #[clap(short, long)]
        queue: Option<String>,
        /// exit after this many messages
        #[clap(short = 'n', long)]
        count: Option<u64>,
    },
    /// send a request and print the reply
    Req {
        subject: String,
        #[clap(default_value = "")]
        payload: String,
        /// how long to wait for a reply, in milliseconds
        #[clap(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
    /// answer every request on a subject with a fixed payload
    Reply {
        subject: String,
        payload: String,
        /// join a queue group
        #[clap(short, long)]
        queue: Option<String>,
    },
}

impl Config {
    /// Load the config file if one was given, then apply command line
    /// overrides on top.
    pub fn client_config(&self) -> Result<ClientConfig> {
        let mut cfg = match &self.config_path {
            Some(path) => ClientConfig::parse(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => ClientConfig::default(),
        };
        if !self.servers.is_empty() {
            cfg.servers = self.servers.clone();
        }
        if let Some(name) = &self.name {
            cfg.name = Some(name.clone());
        }
        if let Some(path) = &self.creds {
            cfg.credentials = Some(CredentialSource::Bundle(path.clone()));
        } else if let Some(path) = &self.nkey {
            cfg.credentials = Some(CredentialSource::Seed(path.clone()));
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn connect_options(&self) -> Result<ConnectOptions> {
        Ok(ConnectOptions::from_config(&self.client_config()?))
    }
}

impl Command {
    pub fn request_timeout(&self) -> Option<Duration> {
        match self {
            Command::Req { timeout_ms, .. } => Some(Duration::from_millis(*timeout_ms)),
            _ => None,
        }
    }
}
