//! Socket.IO v4 text frames carried over Engine.IO v4 WebSocket transport.

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub sid: String,
    /// milliseconds
    pub ping_interval: u64,
    /// milliseconds
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// engine `0`
    Open(Handshake),
    /// engine `1`
    Close,
    /// engine `2`, optional payload
    Ping(String),
    /// engine `3`
    Pong(String),
    /// engine `6`
    Noop,
    /// `40`, the server's reply carries `{"sid": ...}`
    Connect(Option<Value>),
    /// `41`
    Disconnect,
    /// `42["name", ...args]`
    Event { name: String, args: Vec<Value> },
    /// `44{"message": ...}`
    ConnectError(String),
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unknown engine packet type {0:?}")]
    UnknownEngineType(char),
    #[error("unsupported socket packet type {0:?}")]
    UnsupportedSocketType(char),
    #[error("malformed event: {0}")]
    MalformedEvent(&'static str),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub fn decode(frame: &str) -> Result<Packet, CodecError> {
    let mut chars = frame.chars();
    let engine_type = chars.next().ok_or(CodecError::Empty)?;
    let rest = chars.as_str();
    match engine_type {
        '0' => Ok(Packet::Open(serde_json::from_str(rest)?)),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping(rest.to_string())),
        '3' => Ok(Packet::Pong(rest.to_string())),
        '4' => decode_socket(rest),
        '6' => Ok(Packet::Noop),
        other => Err(CodecError::UnknownEngineType(other)),
    }
}

fn decode_socket(frame: &str) -> Result<Packet, CodecError> {
    let mut chars = frame.chars();
    let socket_type = chars.next().ok_or(CodecError::Empty)?;
    let body = strip_ack_id(strip_namespace(chars.as_str()));
    match socket_type {
        '0' => {
            if body.is_empty() {
                Ok(Packet::Connect(None))
            } else {
                Ok(Packet::Connect(Some(serde_json::from_str(body)?)))
            }
        }
        '1' => Ok(Packet::Disconnect),
        '2' => {
            let mut items = match serde_json::from_str::<Value>(body)? {
                Value::Array(items) => items,
                _ => return Err(CodecError::MalformedEvent("payload is not an array")),
            };
            if items.is_empty() {
                return Err(CodecError::MalformedEvent("missing event name"));
            }
            let name = match items.remove(0) {
                Value::String(name) => name,
                _ => return Err(CodecError::MalformedEvent("event name is not a string")),
            };
            Ok(Packet::Event { name, args: items })
        }
        '4' => {
            let message = match serde_json::from_str::<Value>(body)? {
                Value::Object(map) => map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("connection refused")
                    .to_string(),
                Value::String(message) => message,
                other => other.to_string(),
            };
            Ok(Packet::ConnectError(message))
        }
        other => Err(CodecError::UnsupportedSocketType(other)),
    }
}

/// Packets for a non-default namespace start with `/nsp,`.
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(index) => &body[index + 1..],
            None => "",
        }
    } else {
        body
    }
}

fn strip_ack_id(body: &str) -> &str {
    body.trim_start_matches(|c: char| c.is_ascii_digit())
}

pub fn encode(packet: &Packet) -> String {
    match packet {
        Packet::Open(_) => "0".to_string(),
        Packet::Close => "1".to_string(),
        Packet::Ping(data) => format!("2{}", data),
        Packet::Pong(data) => format!("3{}", data),
        Packet::Noop => "6".to_string(),
        Packet::Connect(None) => "40".to_string(),
        Packet::Connect(Some(auth)) => format!("40{}", auth),
        Packet::Disconnect => "41".to_string(),
        Packet::Event { name, args } => {
            let mut items = Vec::with_capacity(args.len() + 1);
            items.push(Value::String(name.clone()));
            items.extend(args.iter().cloned());
            format!("42{}", Value::Array(items))
        }
        Packet::ConnectError(message) => {
            format!("44{}", serde_json::json!({ "message": message }))
        }
    }
}
