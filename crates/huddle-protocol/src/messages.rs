//! Message types for the Huddle protocol.
//!
//! Clients talk to the server with an envelope of the form
//! `{"Type": <string>, "Data": <object>}`. The server answers with flat JSON
//! objects that carry their kind in the same `Type` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error code sent for input that is not a well-formed Huddle message.
pub const MALFORMED_MESSAGE: u16 = 300;

/// Plain-text warning sent when no glyph is left for a handshaking client.
pub const CAPACITY_WARNING: &str = "Too many connected devices. Try again later.";

/// Reason carried by the teardown notice.
pub const GOODBYE_REASON: &str = "Server is shutting down.";

/// Key of the digital signal that toggles identify mode on a client.
pub const IDENTIFY_KEY: &str = "Identify";

/// Inbound message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client introduces itself and asks for a glyph.
    Handshake,
    /// Heartbeat.
    Alive,
    /// Opaque payload relayed to every other client.
    Message,
}

impl MessageType {
    /// Wire name of this type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Handshake => "Handshake",
            MessageType::Alive => "Alive",
            MessageType::Message => "Message",
        }
    }

    /// Look up a wire name. Unrecognized names yield `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Handshake" => Some(MessageType::Handshake),
            "Alive" => Some(MessageType::Alive),
            "Message" => Some(MessageType::Message),
            _ => None,
        }
    }
}

/// Payload of a `Handshake` message. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Handshake {
    /// Display name chosen by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Glyph id issued on an earlier connection, to be reused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glyph_id: Option<String>,
    /// Free-form device type (e.g. "Tablet").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// Client options. Advisory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// A decoded client message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Identification request.
    Handshake(Handshake),
    /// Heartbeat.
    Alive,
    /// Relay request. Holds the original text, forwarded verbatim.
    Message(String),
    /// A well-formed envelope with a type the server does not handle.
    Unknown(String),
}

impl ClientMessage {
    /// The recognized message type, if any.
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        match self {
            ClientMessage::Handshake(_) => Some(MessageType::Handshake),
            ClientMessage::Alive => Some(MessageType::Alive),
            ClientMessage::Message(_) => Some(MessageType::Message),
            ClientMessage::Unknown(_) => None,
        }
    }
}

/// Position and heading of a tracked device, as seen by the sensing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Presence {
    /// Glyph id of the device.
    pub identity: String,
    /// Normalized `[x, y]` position.
    pub location: [f64; 2],
    /// Heading in degrees.
    pub orientation: f64,
}

/// Proximity update for one device, including the other devices around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Proximity {
    /// Glyph id of the device this update is addressed to.
    pub identity: String,
    /// Normalized `[x, y]` position.
    pub location: [f64; 2],
    /// Heading in degrees.
    pub orientation: f64,
    /// Other devices currently in view.
    #[serde(default)]
    pub presences: Vec<Presence>,
}

/// A message sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ServerMessage {
    /// Glyph assignment after a successful handshake.
    Glyph {
        /// Glyph id (the client's identity token).
        #[serde(rename = "Id")]
        id: String,
        /// Marker encoding the client renders so the sensors can find it.
        #[serde(rename = "GlyphData")]
        glyph_data: String,
    },

    /// Proximity push.
    Proximity(Proximity),

    /// Boolean signal, e.g. the identify-mode toggle.
    Digital {
        /// Signal name.
        #[serde(rename = "Key")]
        key: String,
        /// Signal state.
        #[serde(rename = "Value")]
        value: bool,
    },

    /// Error report addressed to the sender of a bad message.
    Error {
        /// Error code.
        #[serde(rename = "Code")]
        code: u16,
        /// Human-readable reason.
        #[serde(rename = "Reason")]
        reason: String,
    },

    /// Teardown notice sent right before the server closes the socket.
    Goodbye {
        /// Why the connection is being closed.
        #[serde(rename = "Reason")]
        reason: String,
    },
}

impl ServerMessage {
    /// Create a glyph assignment.
    #[must_use]
    pub fn glyph(id: impl Into<String>, glyph_data: impl Into<String>) -> Self {
        ServerMessage::Glyph {
            id: id.into(),
            glyph_data: glyph_data.into(),
        }
    }

    /// Create the identify-mode toggle.
    #[must_use]
    pub fn identify(value: bool) -> Self {
        ServerMessage::Digital {
            key: IDENTIFY_KEY.to_string(),
            value,
        }
    }

    /// Create an error report.
    #[must_use]
    pub fn error(code: u16, reason: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            reason: reason.into(),
        }
    }

    /// Create the malformed-input error.
    #[must_use]
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::error(MALFORMED_MESSAGE, reason)
    }

    /// Create the teardown notice.
    #[must_use]
    pub fn goodbye() -> Self {
        ServerMessage::Goodbye {
            reason: GOODBYE_REASON.to_string(),
        }
    }

    /// Wire name of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Glyph { .. } => "Glyph",
            ServerMessage::Proximity(_) => "Proximity",
            ServerMessage::Digital { .. } => "Digital",
            ServerMessage::Error { .. } => "Error",
            ServerMessage::Goodbye { .. } => "Goodbye",
        }
    }
}
