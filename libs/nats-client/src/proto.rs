//! NATS text protocol framing.
//!
//! Only the operations this client needs are modelled. Server frames are
//! decoded into [`ServerOp`], client frames are encoded from [`ClientOp`].

use std::fmt::Write as _;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ClientError, ClientResult};
use crate::handshake::{ConnectInfo, ServerInfo};

/// Longest control line we accept before giving up on the stream.
pub const MAX_CONTROL_LINE: usize = 4096;

/// Payload limit until the server announces its own `max_payload`.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

const CRLF: &[u8] = b"\r\n";

/// A frame received from the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerOp {
    Info(Box<ServerInfo>),
    Msg {
        subject: String,
        sid: u64,
        reply: Option<String>,
        payload: Bytes,
    },
    Ping,
    Pong,
    Ok,
    Err(String),
}

/// A frame sent to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOp {
    Connect(Box<ConnectInfo>),
    Pub {
        subject: String,
        reply: Option<String>,
        payload: Bytes,
    },
    Sub {
        subject: String,
        queue: Option<String>,
        sid: u64,
    },
    Unsub {
        sid: u64,
        max: Option<u64>,
    },
    Ping,
    Pong,
}

#[derive(Debug, Clone)]
struct MsgHeader {
    subject: String,
    sid: u64,
    reply: Option<String>,
    len: usize,
}

/// Codec for a single server connection.
#[derive(Debug)]
pub struct NatsCodec {
    // MSG control line already consumed, waiting on the payload
    pending: Option<MsgHeader>,
    max_payload: usize,
}

impl Default for NatsCodec {
    fn default() -> Self {
        Self {
            pending: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl NatsCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Largest MSG payload accepted. Zero restores the default.
    pub fn set_max_payload(&mut self, max_payload: usize) {
        self.max_payload = if max_payload == 0 {
            DEFAULT_MAX_PAYLOAD
        } else {
            max_payload
        };
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }
}

/// Subjects may not be empty or contain whitespace.
pub fn validate_subject(subject: &str) -> ClientResult<()> {
    if subject.is_empty()
        || subject.chars().any(char::is_whitespace)
        || subject.starts_with('.')
        || subject.ends_with('.')
        || subject.contains("..")
    {
        return Err(ClientError::InvalidSubject(subject.to_owned()));
    }
    Ok(())
}

fn parse_msg_header(args: &str, max_payload: usize) -> ClientResult<MsgHeader> {
    let parts: Vec<&str> = args.split_ascii_whitespace().collect();
    let (subject, sid, reply, len) = match parts.as_slice() {
        [subject, sid, len] => (subject, sid, None, len),
        [subject, sid, reply, len] => (subject, sid, Some(reply.to_string()), len),
        _ => return Err(ClientError::Protocol(format!("malformed MSG: {args:?}"))),
    };
    let len: usize = len
        .parse()
        .map_err(|_| ClientError::Protocol(format!("bad size in MSG: {len:?}")))?;
    if len > max_payload {
        return Err(ClientError::Protocol(format!(
            "MSG size {len} exceeds max payload {max_payload}"
        )));
    }
    Ok(MsgHeader {
        subject: subject.to_string(),
        sid: sid
            .parse()
            .map_err(|_| ClientError::Protocol(format!("bad sid in MSG: {sid:?}")))?,
        reply,
        len,
    })
}

/// Server error text comes single-quoted: `-ERR 'Authorization Violation'`
fn unquote(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(s)
        .to_owned()
}

impl Decoder for NatsCodec {
    type Item = ServerOp;
    type Error = ClientError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>, ClientError> {
        if let Some(header) = self.pending.take() {
            return self.decode_payload(header, src);
        }

        let Some(pos) = src.windows(2).position(|w| w == CRLF) else {
            if src.len() > MAX_CONTROL_LINE {
                return Err(ClientError::Protocol(format!(
                    "control line exceeds {MAX_CONTROL_LINE} bytes"
                )));
            }
            return Ok(None);
        };
        let line = src.split_to(pos + 2);
        let line = std::str::from_utf8(&line[..pos])
            .map_err(|_| ClientError::Protocol("control line is not utf-8".into()))?;

        let (op, args) = match line.find([' ', '\t']) {
            Some(i) => (&line[..i], line[i..].trim()),
            None => (line, ""),
        };

        let op = match op.to_ascii_uppercase().as_str() {
            "MSG" => {
                let header = parse_msg_header(args, self.max_payload)?;
                return self.decode_payload(header, src);
            }
            "PING" => ServerOp::Ping,
            "PONG" => ServerOp::Pong,
            "+OK" => ServerOp::Ok,
            "-ERR" => ServerOp::Err(unquote(args)),
            "INFO" => ServerOp::Info(Box::new(serde_json::from_str(args)?)),
            other => {
                return Err(ClientError::Protocol(format!(
                    "unknown protocol operation {other:?}"
                )));
            }
        };
        Ok(Some(op))
    }
}

impl NatsCodec {
    fn decode_payload(
        &mut self,
        header: MsgHeader,
        src: &mut BytesMut,
    ) -> Result<Option<ServerOp>, ClientError> {
        let frame_len = header.len.checked_add(CRLF.len()).ok_or_else(|| {
            ClientError::Protocol(format!("MSG size {} overflows", header.len))
        })?;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }
        let payload = src.split_to(header.len).freeze();
        if &src[..CRLF.len()] != CRLF {
            return Err(ClientError::Protocol(format!(
                "MSG payload for sid {} not terminated by CRLF",
                header.sid
            )));
        }
        src.advance(CRLF.len());
        Ok(Some(ServerOp::Msg {
            subject: header.subject,
            sid: header.sid,
            reply: header.reply,
            payload,
        }))
    }
}

impl Encoder<ClientOp> for NatsCodec {
    type Error = ClientError;

    fn encode(&mut self, op: ClientOp, dst: &mut BytesMut) -> Result<(), ClientError> {
        let mut line = String::new();
        match op {
            ClientOp::Connect(info) => {
                dst.put_slice(b"CONNECT ");
                dst.put_slice(&serde_json::to_vec(&info)?);
                dst.put_slice(CRLF);
            }
            ClientOp::Pub {
                subject,
                reply,
                payload,
            } => {
                // writing to a String can't fail
                let _ = match reply {
                    Some(reply) => write!(line, "PUB {subject} {reply} {}\r\n", payload.len()),
                    None => write!(line, "PUB {subject} {}\r\n", payload.len()),
                };
                dst.reserve(line.len() + payload.len() + CRLF.len());
                dst.put_slice(line.as_bytes());
                dst.put_slice(&payload);
                dst.put_slice(CRLF);
            }
            ClientOp::Sub {
                subject,
                queue,
                sid,
            } => {
                let _ = match queue {
                    Some(queue) => write!(line, "SUB {subject} {queue} {sid}\r\n"),
                    None => write!(line, "SUB {subject} {sid}\r\n"),
                };
                dst.put_slice(line.as_bytes());
            }
            ClientOp::Unsub { sid, max } => {
                let _ = match max {
                    Some(max) => write!(line, "UNSUB {sid} {max}\r\n"),
                    None => write!(line, "UNSUB {sid}\r\n"),
                };
                dst.put_slice(line.as_bytes());
            }
            ClientOp::Ping => dst.put_slice(b"PING\r\n"),
            ClientOp::Pong => dst.put_slice(b"PONG\r\n"),
        }
        Ok(())
    }
}
