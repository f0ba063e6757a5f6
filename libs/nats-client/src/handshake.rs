//! Connection handshake.
//!
//! The server greets with `INFO`. If it requires signature authentication it
//! includes a nonce, which we sign with the configured [`Credentials`] and
//! send back inside `CONNECT` followed by `PING`. The server's answer decides
//! the attempt: `PONG` means accepted, an authorization `-ERR` means
//! rejected.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use crate::credentials::Credentials;
use crate::error::{ClientError, ClientResult};
use crate::proto::{ClientOp, NatsCodec, ServerOp};

/// Client language reported in `CONNECT`.
pub const LANG: &str = "rust";

/// Client version reported in `CONNECT`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The server's `INFO` frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub max_payload: usize,
    #[serde(default)]
    pub proto: i8,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub nonce: Option<String>,
    /// other cluster members clients may connect to
    #[serde(default)]
    pub connect_urls: Vec<String>,
    #[serde(default)]
    pub headers: bool,
}

impl ServerInfo {
    /// Whether the server wants proof of key possession.
    pub fn requires_signature(&self) -> bool {
        self.auth_required
    }
}

/// The client's `CONNECT` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: u8,
    pub echo: bool,
    pub tls_required: bool,
    pub headers: bool,
}

/// Knobs that end up in `CONNECT` besides credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOptions {
    pub name: Option<String>,
    pub verbose: bool,
    pub pedantic: bool,
    pub echo: bool,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            name: None,
            verbose: false,
            pedantic: false,
            echo: true,
        }
    }
}

/// Build the `CONNECT` frame for `info`.
///
/// Pure apart from whatever the credential provider does (file reads or
/// user callbacks); never touches the network.
pub fn build_connect(
    info: &ServerInfo,
    credentials: Option<&Credentials>,
    opts: &HandshakeOptions,
) -> ClientResult<ConnectInfo> {
    let mut connect = ConnectInfo {
        verbose: opts.verbose,
        pedantic: opts.pedantic,
        jwt: None,
        nkey: None,
        sig: None,
        name: opts.name.clone(),
        lang: LANG.to_owned(),
        version: VERSION.to_owned(),
        protocol: 1,
        echo: opts.echo,
        tls_required: false,
        headers: false,
    };

    if !info.requires_signature() {
        return Ok(connect);
    }
    let nonce = info.nonce.as_deref().ok_or_else(|| {
        ClientError::Protocol("server requires authentication but sent no nonce".into())
    })?;
    let credentials = credentials.ok_or_else(|| {
        ClientError::Auth(
            "server requires signature authentication but no credentials are configured".into(),
        )
    })?;

    let sig = credentials.signature(nonce.as_bytes())?;
    connect.sig = Some(URL_SAFE_NO_PAD.encode(sig));
    connect.jwt = credentials.token()?;
    if connect.jwt.is_none() {
        connect.nkey = credentials.public_key()?;
    }
    Ok(connect)
}

/// Decide what a server `-ERR` means for the connection.
pub fn classify_server_error(msg: &str) -> ClientError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("authorization violation")
        || lower.contains("authentication")
        || (lower.contains("account")
            && (lower.contains("expired") || lower.contains("revoked")))
    {
        ClientError::Auth(msg.to_owned())
    } else {
        ClientError::Server(msg.to_owned())
    }
}

/// Whether the server keeps the socket open after this `-ERR`. Anything
/// other than a permission or subject error is followed by a close.
pub fn server_error_keeps_connection(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    lower.starts_with("permissions violation")
        || lower.starts_with("invalid subject")
        || lower.starts_with("invalid publish subject")
}

/// Read the server greeting.
pub async fn read_info<S>(
    framed: &mut Framed<S, NatsCodec>,
    timeout: Duration,
) -> ClientResult<ServerInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = tokio::time::timeout(timeout, framed.next())
        .await
        .map_err(|_| {
            ClientError::io(
                std::io::ErrorKind::TimedOut,
                format!("no INFO from server after {timeout:?}"),
            )
        })?;
    match frame {
        Some(Ok(ServerOp::Info(info))) => {
            framed.codec_mut().set_max_payload(info.max_payload);
            Ok(*info)
        }
        Some(Ok(other)) => Err(ClientError::Protocol(format!(
            "expected INFO as first frame, got {other:?}"
        ))),
        Some(Err(err)) => Err(err),
        None => Err(ClientError::io(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed before INFO",
        )),
    }
}

/// Send `CONNECT` + `PING` and wait for the verdict.
///
/// Returns the latest `INFO` seen (servers may re-send it while we wait).
pub async fn negotiate<S>(
    framed: &mut Framed<S, NatsCodec>,
    mut info: ServerInfo,
    credentials: Option<&Credentials>,
    opts: &HandshakeOptions,
    timeout: Duration,
) -> ClientResult<ServerInfo>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connect = build_connect(&info, credentials, opts)?;
    debug!(
        server_id = %info.server_id,
        signed = connect.sig.is_some(),
        jwt = connect.jwt.is_some(),
        "sending CONNECT"
    );
    framed.feed(ClientOp::Connect(Box::new(connect))).await?;
    framed.send(ClientOp::Ping).await?;

    let verdict = async {
        loop {
            match framed.next().await {
                Some(Ok(ServerOp::Pong)) => return Ok::<(), ClientError>(()),
                Some(Ok(ServerOp::Err(msg))) => return Err(classify_server_error(&msg)),
                Some(Ok(ServerOp::Ok)) => trace!("+OK during handshake"),
                Some(Ok(ServerOp::Ping)) => framed.send(ClientOp::Pong).await?,
                Some(Ok(ServerOp::Info(new_info))) => {
                    framed.codec_mut().set_max_payload(new_info.max_payload);
                    info = *new_info;
                }
                Some(Ok(ServerOp::Msg { sid, .. })) => {
                    return Err(ClientError::Protocol(format!(
                        "MSG for sid {sid} before handshake completed"
                    )));
                }
                Some(Err(err)) => return Err(err),
                None => {
                    return Err(ClientError::io(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed during handshake",
                    ));
                }
            }
        }
    };
    tokio::time::timeout(timeout, verdict).await.map_err(|_| {
        ClientError::io(
            std::io::ErrorKind::TimedOut,
            format!("handshake not answered after {timeout:?}"),
        )
    })??;
    Ok(info)
}
