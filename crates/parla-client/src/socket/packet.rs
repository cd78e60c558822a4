//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! Only the packets a websocket-only client needs are modelled: the open
//! handshake, ping/pong, close, and Socket.IO connect/disconnect/event
//! frames on the default namespace.

use parla_shared::ProtocolError;
use serde::Deserialize;
use serde_json::Value;

/// Handshake sent by the server in the Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect,
    Disconnect,
    Event { name: String, data: Value },
    ConnectError(Value),
    /// Acks and binary frames; the client never requests either.
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Open(OpenInfo),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Noop,
}

fn malformed(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::Malformed {
        event: "socket.io".to_string(),
        reason: reason.into(),
    }
}

pub fn decode(frame: &str) -> Result<Packet, ProtocolError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or_else(|| malformed("empty frame"))?;
    let rest = chars.as_str();
    match kind {
        '0' => serde_json::from_str(rest)
            .map(Packet::Open)
            .map_err(|e| malformed(e.to_string())),
        '1' => Ok(Packet::Close),
        '2' => Ok(Packet::Ping),
        '3' => Ok(Packet::Pong),
        '4' => decode_socket(rest).map(Packet::Message),
        '6' => Ok(Packet::Noop),
        other => Err(malformed(format!("unknown engine packet {other}"))),
    }
}

fn decode_socket(frame: &str) -> Result<SocketPacket, ProtocolError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or_else(|| malformed("empty socket packet"))?;
    let mut rest = chars.as_str();

    // Optional namespace, terminated by a comma.
    if rest.starts_with('/') {
        rest = rest.split_once(',').map_or("", |(_, tail)| tail);
    }
    // Optional ack id.
    let body = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    match kind {
        '0' => Ok(SocketPacket::Connect),
        '1' => Ok(SocketPacket::Disconnect),
        '2' => {
            let value: Value = serde_json::from_str(body).map_err(|e| malformed(e.to_string()))?;
            let Value::Array(mut items) = value else {
                return Err(malformed("event payload is not an array"));
            };
            if items.is_empty() {
                return Err(malformed("event without a name"));
            }
            let Value::String(name) = items.remove(0) else {
                return Err(malformed("event name is not a string"));
            };
            let data = if items.is_empty() {
                Value::Null
            } else {
                items.remove(0)
            };
            Ok(SocketPacket::Event { name, data })
        }
        '4' => Ok(SocketPacket::ConnectError(
            serde_json::from_str(body).unwrap_or(Value::Null),
        )),
        '3' | '5' | '6' => Ok(SocketPacket::Other),
        other => Err(malformed(format!("unknown socket packet {other}"))),
    }
}

pub const PONG: &str = "3";
pub const CONNECT: &str = "40";

pub fn encode_event(name: &str, payload: &Value) -> Result<String, serde_json::Error> {
    let frame = serde_json::to_string(&serde_json::json!([name, payload]))?;
    Ok(format!("42{frame}"))
}
