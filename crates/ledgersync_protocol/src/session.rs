//! Session authority wire messages.
//!
//! Messages are JSON objects tagged by `type`.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Reason shown when the authority gives none.
pub const DEFAULT_INVALIDATION_REASON: &str = "You have been logged in from another device";

/// Credentials identifying one device's session.
///
/// Validity is decided by the session authority only.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTicket {
    /// Bearer token.
    pub auth_token: String,
    /// Device token.
    pub device_token: String,
    /// Account identifier.
    pub user_id: String,
}

impl SessionTicket {
    /// Creates a ticket.
    pub fn new(
        auth_token: impl Into<String>,
        device_token: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            auth_token: auth_token.into(),
            device_token: device_token.into(),
            user_id: user_id.into(),
        }
    }

    /// Returns true if both tokens are non-empty.
    pub fn is_complete(&self) -> bool {
        !self.auth_token.is_empty() && !self.device_token.is_empty()
    }
}

impl fmt::Debug for SessionTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionTicket")
            .field("auth_token", &"<redacted>")
            .field("device_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .finish()
    }
}

/// Message pushed by the session authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// This device's session is no longer valid.
    SessionInvalidated {
        /// Reason given by the authority.
        reason: String,
    },
    /// Heartbeat acknowledged.
    HeartbeatAck,
    /// Authority confirmed the connection.
    Connected,
    /// Reply to a ping.
    Pong,
    /// A message type this client does not handle.
    Unknown(String),
}

impl InboundMessage {
    /// Parses a text frame.
    pub fn parse(text: &str) -> ProtocolResult<Self> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::invalid_structure("message has no type"))?;

        Ok(match kind {
            "SESSION_INVALIDATED" | "DEVICE_CONFLICT" => {
                let reason = ["message", "reason"]
                    .iter()
                    .filter_map(|key| value.get(*key).and_then(Value::as_str))
                    .find(|text| !text.is_empty())
                    .unwrap_or(DEFAULT_INVALIDATION_REASON)
                    .to_string();
                InboundMessage::SessionInvalidated { reason }
            }
            "HEARTBEAT_ACK" => InboundMessage::HeartbeatAck,
            "CONNECTED" => InboundMessage::Connected,
            "PONG" => InboundMessage::Pong,
            other => InboundMessage::Unknown(other.to_string()),
        })
    }

    /// Returns true for an invalidation.
    pub fn is_invalidation(&self) -> bool {
        matches!(self, InboundMessage::SessionInvalidated { .. })
    }
}

/// Message sent to the session authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    /// Keep-alive.
    Heartbeat {
        /// Send time (Unix millis).
        timestamp: u64,
    },
}

impl OutboundMessage {
    /// Encodes to a text frame.
    pub fn to_text(&self) -> String {
        // Tagged enums of plain fields always serialize.
        serde_json::to_string(self).unwrap_or_default()
    }
}
