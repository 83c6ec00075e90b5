//! Wire framing shared by the relay and its clients.
//!
//! - binary frame: handshake `{"id": ...}`, exactly once, first
//! - text frame: message `{"id": target, "msg": base64, "timestamp", "from"}`
//! - ping / pong / close control frames

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Error, Result};
use crate::identity::ID_LENGTH;

pub const PING_PAYLOAD: &[u8] = b"ping";
pub const PONG_PAYLOAD: &[u8] = b"pong";

/// First frame on every connection, naming the id the connection speaks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub id: String,
}

impl Handshake {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    pub fn to_frame(&self) -> Result<Message> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::HandshakeWriteError(format!("failed to serialize: {}", e)))?;
        Ok(Message::Binary(json))
    }

    /// Parse and admit a handshake frame. Only a binary frame carrying an id
    /// of exactly [`ID_LENGTH`] characters is accepted.
    pub fn from_frame(frame: &Message) -> Result<Self> {
        let payload = match frame {
            Message::Binary(payload) => payload,
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "expected binary handshake, got {}",
                    frame_kind(other)
                )))
            }
        };

        let handshake: Handshake = serde_json::from_slice(payload)
            .map_err(|e| Error::ProtocolViolation(format!("unreadable handshake: {}", e)))?;

        let length = handshake.id.chars().count();
        if length != ID_LENGTH {
            return Err(Error::ProtocolViolation(format!(
                "handshake id has length {}, expected {}",
                length, ID_LENGTH
            )));
        }
        Ok(handshake)
    }
}

/// One routed unit: ciphertext plus routing metadata. The ciphertext is
/// opaque to everything between `encrypt_for` and `decrypt_with`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "id")]
    pub target_id: String,
    #[serde(rename = "msg", with = "crate::b64")]
    pub ciphertext: Vec<u8>,
    /// Stamped on arrival when the sender leaves it out.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// The relay overwrites this with the connection's id.
    #[serde(rename = "from", default)]
    pub from_id: String,
}

impl Envelope {
    pub fn new(
        target_id: impl Into<String>,
        ciphertext: Vec<u8>,
        from_id: impl Into<String>,
    ) -> Self {
        Self {
            target_id: target_id.into(),
            ciphertext,
            timestamp: Utc::now(),
            from_id: from_id.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::InvalidMessage(format!("failed to serialize envelope: {}", e)))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::InvalidMessage(format!("unreadable envelope: {}", e)))
    }

    pub fn to_frame(&self) -> Result<Message> {
        Ok(Message::Text(self.to_json()?))
    }
}

pub fn ping_frame() -> Message {
    Message::Ping(PING_PAYLOAD.to_vec())
}

pub fn pong_frame(payload: Vec<u8>) -> Message {
    Message::Pong(payload)
}

/// Close frame with the normal-closure code.
pub fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

/// Short name of a frame's type, for logs.
pub fn frame_kind(frame: &Message) -> &'static str {
    match frame {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw frame",
    }
}
