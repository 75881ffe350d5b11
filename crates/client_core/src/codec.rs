//! Text framing for Socket.IO v5 carried over an Engine.IO v4 websocket.
//!
//! One websocket text message is one Engine.IO packet: a single type digit
//! followed by its data. Engine.IO `message` packets (`4`) carry a
//! Socket.IO packet, whose own type digit follows, then an optional
//! `/namespace,`, an optional ack id and a JSON body. Binary attachments
//! are not supported.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unknown engine.io packet type {0:?}")]
    UnknownEngineType(char),
    #[error("unknown socket.io packet type {0:?}")]
    UnknownSocketType(char),
    #[error("binary socket.io packets are not supported")]
    Binary,
    #[error("event packet without a name")]
    MissingEventName,
    #[error("invalid json body: {0}")]
    Json(#[from] serde_json::Error),
}

/// Engine.IO `open` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl Handshake {
    /// How long the link may stay silent before it is considered dead.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        payload: Value,
    },
    Ack {
        namespace: String,
        ack_id: Option<u64>,
        data: Value,
    },
    ConnectError {
        namespace: String,
        data: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Open(Handshake),
    Close,
    Ping(String),
    Pong(String),
    Socket(SocketPacket),
    Upgrade,
    Noop,
}

pub const DEFAULT_NAMESPACE: &str = "/";

pub fn decode_frame(text: &str) -> Result<Frame, CodecError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let rest = chars.as_str();
    Ok(match kind {
        '0' => Frame::Open(serde_json::from_str(rest)?),
        '1' => Frame::Close,
        '2' => Frame::Ping(rest.to_string()),
        '3' => Frame::Pong(rest.to_string()),
        '4' => Frame::Socket(decode_socket_packet(rest)?),
        '5' => Frame::Upgrade,
        '6' => Frame::Noop,
        other => return Err(CodecError::UnknownEngineType(other)),
    })
}

fn decode_socket_packet(text: &str) -> Result<SocketPacket, CodecError> {
    let mut chars = text.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    let mut rest = chars.as_str();

    let namespace = if rest.starts_with('/') {
        match rest.find(',') {
            Some(idx) => {
                let namespace = rest[..idx].to_string();
                rest = &rest[idx + 1..];
                namespace
            }
            None => {
                let namespace = rest.to_string();
                rest = "";
                namespace
            }
        }
    } else {
        DEFAULT_NAMESPACE.to_string()
    };

    let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    let ack_id = if digits > 0 {
        let parsed = rest[..digits].parse().ok();
        rest = &rest[digits..];
        parsed
    } else {
        None
    };

    let body = || -> Result<Option<Value>, CodecError> {
        if rest.trim().is_empty() {
            Ok(None)
        } else {
            Ok(Some(serde_json::from_str(rest)?))
        }
    };

    Ok(match kind {
        '0' => SocketPacket::Connect {
            namespace,
            data: body()?,
        },
        '1' => SocketPacket::Disconnect { namespace },
        '2' => {
            let Some(Value::Array(mut args)) = body()? else {
                return Err(CodecError::MissingEventName);
            };
            if args.is_empty() {
                return Err(CodecError::MissingEventName);
            }
            let Value::String(name) = args.remove(0) else {
                return Err(CodecError::MissingEventName);
            };
            let payload = if args.is_empty() {
                Value::Null
            } else {
                args.swap_remove(0)
            };
            SocketPacket::Event {
                namespace,
                ack_id,
                name,
                payload,
            }
        }
        '3' => SocketPacket::Ack {
            namespace,
            ack_id,
            data: body()?.unwrap_or(Value::Null),
        },
        '4' => SocketPacket::ConnectError {
            namespace,
            data: body()?,
        },
        '5' | '6' => return Err(CodecError::Binary),
        other => return Err(CodecError::UnknownSocketType(other)),
    })
}

pub fn encode_connect() -> String {
    "40".to_string()
}

pub fn encode_disconnect() -> String {
    "41".to_string()
}

pub fn encode_pong(data: &str) -> String {
    format!("3{data}")
}

pub fn encode_event(name: &str, payload: &Value) -> String {
    let args = Value::Array(vec![Value::String(name.to_string()), payload.clone()]);
    format!("42{args}")
}
