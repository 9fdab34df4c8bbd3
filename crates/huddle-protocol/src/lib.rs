//! # huddle-protocol
//!
//! Wire protocol for the Huddle presence relay.
//!
//! Clients send JSON envelopes of the form `{"Type": ..., "Data": ...}`;
//! the server answers with flat JSON objects tagged by `Type`.
//!
//! ## Message Types
//!
//! - `Handshake` - Ask for a glyph (identity token), optionally reusing one
//! - `Alive` - Heartbeat
//! - `Message` - Opaque payload relayed to every other client
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientMessage, ServerMessage};
//!
//! let message = codec::decode(r#"{"Type":"Handshake","Data":{"Name":"Tablet"}}"#).unwrap();
//! assert!(matches!(message, ClientMessage::Handshake(_)));
//!
//! let reply = codec::encode(&ServerMessage::glyph("1", "0101")).unwrap();
//! assert_eq!(reply, r#"{"Type":"Glyph","Id":"1","GlyphData":"0101"}"#);
//! ```

pub mod codec;
pub mod messages;

pub use codec::{decode, decode_bytes, encode, ProtocolError};
pub use messages::{
    ClientMessage, Handshake, MessageType, Presence, Proximity, ServerMessage, CAPACITY_WARNING,
    GOODBYE_REASON, IDENTIFY_KEY, MALFORMED_MESSAGE,
};
