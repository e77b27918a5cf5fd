//! Tunnel frame codec.
//!
//! Every WebSocket message carries exactly one frame. The wire layout is a
//! length-delimited envelope:
//!
//! ```text
//! +------+----------------------+----+------------------+
//! | kind | UTF-8 JSON header    | \n | raw body bytes   |
//! +------+----------------------+----+------------------+
//!   1 B    compact, no newlines  1 B   Request/Response only
//! ```
//!
//! Binary payloads (screenshots) travel as raw body bytes rather than base64,
//! avoiding the 33% encoding overhead. The JSON header is always followed by
//! the `\n` separator; serde_json escapes newlines inside strings, so the
//! first `\n` after the kind byte is unambiguous.
//!
//! Decoding is strict: unknown kind bytes, malformed headers, oversized
//! bodies, and body bytes on a bodiless kind are all [`CodecError`]s, which
//! the session runtime treats as protocol faults (close with
//! `Bye{protocol_error}`).

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default cap on the body of a single frame.
pub const MAX_FRAME_BODY: usize = 64 * 1024 * 1024;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;
const KIND_PING: u8 = 3;
const KIND_PONG: u8 = 4;
const KIND_HELLO: u8 = 5;
const KIND_WELCOME: u8 = 6;
const KIND_BYE: u8 = 7;

/// An HTTP request forwarded by the cloud. The `id` is chosen by the cloud
/// and echoed on the matching [`ResponseFrame`]; agents never originate ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

/// The agent's answer to a [`RequestFrame`]. HTTP status flows through
/// unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResponseFrame {
    pub id: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

/// First frame from the agent after the socket opens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloFrame {
    pub fingerprint: String,
    pub version: String,
    pub capabilities: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_for: Option<String>,
}

/// First frame from the cloud. A populated `rejection` means the handshake
/// failed terminally (bad secret, org mismatch, keepalive self-link).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WelcomeFrame {
    pub session_id: String,
    /// Cloud wall-clock at accept time, unix milliseconds. Logged only.
    pub server_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
}

/// Graceful close notice, sent by either side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ByeFrame {
    pub reason_code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct NonceHeader {
    nonce: i64,
}

/// One tunnel frame, exactly one per WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelFrame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Ping { nonce: i64 },
    Pong { nonce: i64 },
    Hello(HelloFrame),
    Welcome(WelcomeFrame),
    Bye(ByeFrame),
}

impl TunnelFrame {
    /// Frame kind as a wire-independent label, for logging.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Hello(_) => "hello",
            Self::Welcome(_) => "welcome",
            Self::Bye(_) => "bye",
        }
    }

    /// Serialize to the wire layout.
    pub fn encode(&self) -> Vec<u8> {
        let (kind, header, body): (u8, Vec<u8>, &[u8]) = match self {
            Self::Request(req) => (KIND_REQUEST, to_header(req), &req.body),
            Self::Response(resp) => (KIND_RESPONSE, to_header(resp), &resp.body),
            Self::Ping { nonce } => (KIND_PING, to_header(&NonceHeader { nonce: *nonce }), &[]),
            Self::Pong { nonce } => (KIND_PONG, to_header(&NonceHeader { nonce: *nonce }), &[]),
            Self::Hello(hello) => (KIND_HELLO, to_header(hello), &[]),
            Self::Welcome(welcome) => (KIND_WELCOME, to_header(welcome), &[]),
            Self::Bye(bye) => (KIND_BYE, to_header(bye), &[]),
        };
        let mut out = Vec::with_capacity(2 + header.len() + body.len());
        out.push(kind);
        out.extend_from_slice(&header);
        out.push(b'\n');
        out.extend_from_slice(body);
        out
    }

    /// Parse a frame from one WebSocket message, enforcing `max_body` on
    /// Request/Response payloads.
    pub fn decode(raw: &[u8], max_body: usize) -> Result<Self, CodecError> {
        let (&kind, rest) = raw.split_first().ok_or(CodecError::Empty)?;
        if !(KIND_REQUEST..=KIND_BYE).contains(&kind) {
            return Err(CodecError::UnknownKind(kind));
        }
        let sep = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(CodecError::MissingSeparator)?;
        let (header, body) = (&rest[..sep], &rest[sep + 1..]);

        match kind {
            KIND_REQUEST => {
                check_body_len(body.len(), max_body)?;
                let mut frame: RequestFrame = from_header(header)?;
                frame.body = body.to_vec();
                Ok(Self::Request(frame))
            }
            KIND_RESPONSE => {
                check_body_len(body.len(), max_body)?;
                let mut frame: ResponseFrame = from_header(header)?;
                frame.body = body.to_vec();
                Ok(Self::Response(frame))
            }
            _ if !body.is_empty() => Err(CodecError::UnexpectedBody(kind)),
            KIND_PING => {
                let header: NonceHeader = from_header(header)?;
                Ok(Self::Ping { nonce: header.nonce })
            }
            KIND_PONG => {
                let header: NonceHeader = from_header(header)?;
                Ok(Self::Pong { nonce: header.nonce })
            }
            KIND_HELLO => Ok(Self::Hello(from_header(header)?)),
            KIND_WELCOME => Ok(Self::Welcome(from_header(header)?)),
            _ => Ok(Self::Bye(from_header(header)?)),
        }
    }
}

fn to_header<T: Serialize>(value: &T) -> Vec<u8> {
    // Frame headers are plain structs of strings and integers; serialization
    // cannot fail for them.
    serde_json::to_vec(value).expect("frame header serializes")
}

fn from_header<'a, T: Deserialize<'a>>(header: &'a [u8]) -> Result<T, CodecError> {
    serde_json::from_slice(header).map_err(|e| CodecError::BadHeader(e.to_string()))
}

fn check_body_len(len: usize, max_body: usize) -> Result<(), CodecError> {
    if len > max_body {
        return Err(CodecError::BodyTooLarge { len, max: max_body });
    }
    Ok(())
}

/// Why a frame failed to decode. Any variant is a protocol fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    Empty,
    UnknownKind(u8),
    MissingSeparator,
    BadHeader(String),
    BodyTooLarge { len: usize, max: usize },
    UnexpectedBody(u8),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty frame"),
            Self::UnknownKind(kind) => write!(f, "unknown frame kind {kind}"),
            Self::MissingSeparator => write!(f, "missing header separator"),
            Self::BadHeader(err) => write!(f, "malformed frame header: {err}"),
            Self::BodyTooLarge { len, max } => {
                write!(f, "frame body of {len} bytes exceeds cap of {max}")
            }
            Self::UnexpectedBody(kind) => {
                write!(f, "frame kind {kind} does not carry a body")
            }
        }
    }
}

impl std::error::Error for CodecError {}
