//! # nats-client
//!
//! A NATS client core focused on the parts that have to be right for a
//! long-running service:
//!
//! - signature authentication: the server's nonce is signed locally with an
//!   NKEY seed taken from a `.creds` bundle, a bare seed file or user
//!   callbacks, and only the signature (plus JWT or public key) is sent
//! - a connection state machine that tells authorization failures apart from
//!   network failures and reports each one exactly once to an
//!   [`ErrorObserver`]
//! - reconnection over a rotating server pool with a fixed wait between
//!   attempts, resubscription and a bounded reconnect buffer
//! - request/reply correlation over unique inbox subjects
//!
//! ```no_run
//! # async fn run() -> nats_client::ClientResult<()> {
//! use nats_client::{ConnectOptions, ErrorLog};
//!
//! let errors = ErrorLog::new();
//! let client = ConnectOptions::new()
//!     .servers(["nats://127.0.0.1:4222"])
//!     .nkey_seed("/etc/nats/user.nk")
//!     .error_observer(errors.clone())
//!     .connect()
//!     .await?;
//! let reply = client.request("time.now", "").await?;
//! println!("{:?}", reply.payload);
//! client.close().await;
//! # Ok(())
//! # }
//! ```
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

pub mod client;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod handshake;
pub mod metrics;
pub mod observer;
pub mod options;
pub mod pool;
pub mod proto;
pub mod reconnect;
pub mod request;
pub mod state;

pub use client::{Client, Message, Statistics, Subscriber};
pub use connection::{BoxStream, TcpTransport, Transport};
pub use credentials::{BoxError, CallbackCredentials, Credentials};
pub use error::{ClientError, ClientResult};
pub use handshake::ServerInfo;
pub use observer::{ErrorLog, ErrorObserver};
pub use options::ConnectOptions;
pub use pool::ServerEndpoint;
pub use reconnect::ReconnectPolicy;
pub use state::ConnectionState;

/// Connect to a single server without credentials, using default options.
pub async fn connect(url: impl Into<String>) -> ClientResult<Client> {
    ConnectOptions::new().servers([url.into()]).connect().await
}
