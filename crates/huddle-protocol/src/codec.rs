//! JSON codec for Huddle messages.
//!
//! Decoding is two-phase: the envelope's `Type` is read first, then `Data`
//! is decoded against the schema of that type. Unknown types decode to
//! [`ClientMessage::Unknown`] so callers can ignore them.

use serde::de;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::messages::{ClientMessage, Handshake, MessageType, ServerMessage, MALFORMED_MESSAGE};

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Input is not JSON.
    #[error("Could not deserialize message. Not a valid JSON format: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// Binary input that is not UTF-8 text.
    #[error("Could not deserialize message. Binary payload is not UTF-8 text")]
    NotUtf8,

    /// Envelope without a string `Type` field.
    #[error("Could not deserialize message. Missing string field `Type`")]
    MissingType,

    /// `Data` does not match the schema of its type.
    #[error("Could not deserialize {kind} data: {source}")]
    InvalidData {
        /// Message type whose schema was violated.
        kind: &'static str,
        /// Underlying decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// Outbound message could not be serialized.
    #[error("Encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ProtocolError {
    /// Error code reported to the client.
    #[must_use]
    pub fn code(&self) -> u16 {
        MALFORMED_MESSAGE
    }
}

/// Encode a server message to JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode(message: &ServerMessage) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a client message from JSON text.
///
/// # Errors
///
/// Returns an error if the text is not JSON, has no string `Type`, or has a
/// `Data` payload that does not fit its type.
pub fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;

    let kind = envelope
        .get("Type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    match MessageType::parse(kind) {
        Some(MessageType::Handshake) => {
            let data = envelope.get("Data").unwrap_or(&Value::Null);
            Ok(ClientMessage::Handshake(Handshake::deserialize_data(data)?))
        }
        Some(MessageType::Alive) => Ok(ClientMessage::Alive),
        Some(MessageType::Message) => Ok(ClientMessage::Message(text.to_owned())),
        None => Ok(ClientMessage::Unknown(kind.to_owned())),
    }
}

/// Decode a client message from a binary frame holding UTF-8 JSON.
///
/// # Errors
///
/// Returns [`ProtocolError::NotUtf8`] for non-text payloads, otherwise the
/// same errors as [`decode`].
pub fn decode_bytes(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::NotUtf8)?;
    decode(text)
}

impl Handshake {
    fn deserialize_data(data: &Value) -> Result<Self, ProtocolError> {
        let invalid = |source: serde_json::Error| ProtocolError::InvalidData {
            kind: MessageType::Handshake.as_str(),
            source,
        };

        // Derived impls would also accept a positional array
        if !data.is_object() {
            return Err(invalid(de::Error::invalid_type(unexpected(data), &"a JSON object")));
        }
        Handshake::deserialize(data).map_err(invalid)
    }
}

fn unexpected(value: &Value) -> de::Unexpected<'_> {
    match value {
        Value::Null => de::Unexpected::Unit,
        Value::Bool(b) => de::Unexpected::Bool(*b),
        Value::Number(_) => de::Unexpected::Other("number"),
        Value::String(s) => de::Unexpected::Str(s),
        Value::Array(_) => de::Unexpected::Seq,
        Value::Object(_) => de::Unexpected::Map,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Presence, Proximity};
    use serde_json::json;

    #[test]
    fn test_decode_handshake() {
        let text = r#"{"Type":"Handshake","Data":{"Name":"Tablet","GlyphId":"12","DeviceType":"Tablet","Options":{"Debug":true}}}"#;

        match decode(text).unwrap() {
            ClientMessage::Handshake(hs) => {
                assert_eq!(hs.name.as_deref(), Some("Tablet"));
                assert_eq!(hs.glyph_id.as_deref(), Some("12"));
                assert_eq!(hs.device_type.as_deref(), Some("Tablet"));
                assert_eq!(hs.options, Some(json!({"Debug": true})));
            }
            other => panic!("Expected Handshake, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_handshake_requires_data() {
        for text in [r#"{"Type":"Handshake"}"#, r#"{"Type":"Handshake","Data":null}"#] {
            let err = decode(text).unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidData { kind: "Handshake", .. }), "{text}");
            assert_eq!(err.code(), 300);
        }
        assert_eq!(
            decode(r#"{"Type":"Handshake","Data":{}}"#).unwrap(),
            ClientMessage::Handshake(Handshake::default())
        );
    }

    #[test]
    fn test_decode_handshake_wrong_schema() {
        match decode(r#"{"Type":"Handshake","Data":{"Name":42}}"#) {
            Err(ProtocolError::InvalidData { kind, .. }) => assert_eq!(kind, "Handshake"),
            other => panic!("Expected InvalidData error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_handshake_data_must_be_object() {
        for text in [
            r#"{"Type":"Handshake","Data":[]}"#,
            r#"{"Type":"Handshake","Data":["Bob"]}"#,
            r#"{"Type":"Handshake","Data":"Bob"}"#,
            r#"{"Type":"Handshake","Data":7}"#,
        ] {
            match decode(text) {
                Err(e @ ProtocolError::InvalidData { .. }) => assert_eq!(e.code(), 300),
                other => panic!("Expected InvalidData for {}, got {:?}", text, other),
            }
        }
    }

    #[test]
    fn test_decode_alive_and_message() {
        assert_eq!(decode(r#"{"Type":"Alive"}"#).unwrap(), ClientMessage::Alive);

        let text = r#"{"Type":"Message","Data":{"Text":"hi","Nested":[1,2]}}"#;
        assert_eq!(
            decode(text).unwrap(),
            ClientMessage::Message(text.to_string())
        );
    }

    #[test]
    fn test_decode_unknown_type_is_not_an_error() {
        assert_eq!(
            decode(r#"{"Type":"Subscribe","Data":{}}"#).unwrap(),
            ClientMessage::Unknown("Subscribe".to_string())
        );
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            decode("not json at all"),
            Err(ProtocolError::InvalidJson(_))
        ));
        assert!(matches!(
            decode(r#"{"Data":{}}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            decode(r#"{"Type":7}"#),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(decode("[1,2,3]"), Err(ProtocolError::MissingType)));
    }

    #[test]
    fn test_decode_bytes() {
        assert_eq!(
            decode_bytes(br#"{"Type":"Alive"}"#).unwrap(),
            ClientMessage::Alive
        );
        assert!(matches!(
            decode_bytes(&[0xff, 0xfe, 0x00]),
            Err(ProtocolError::NotUtf8)
        ));
    }

    #[test]
    fn test_error_code() {
        let err = decode("{").unwrap_err();
        assert_eq!(err.code(), 300);
        assert_eq!(ProtocolError::MissingType.code(), 300);
    }

    #[test]
    fn test_encode_glyph_shape() {
        let text = encode(&ServerMessage::glyph("3", "0110")).unwrap();
        assert_eq!(text, r#"{"Type":"Glyph","Id":"3","GlyphData":"0110"}"#);
    }

    #[test]
    fn test_encode_error_shape() {
        let text = encode(&ServerMessage::malformed("bad input")).unwrap();
        assert_eq!(text, r#"{"Type":"Error","Code":300,"Reason":"bad input"}"#);
    }

    #[test]
    fn test_encode_identify_shape() {
        let text = encode(&ServerMessage::identify(false)).unwrap();
        assert_eq!(text, r#"{"Type":"Digital","Key":"Identify","Value":false}"#);
    }

    #[test]
    fn test_encode_proximity_is_flat() {
        let message = ServerMessage::Proximity(Proximity {
            identity: "4".into(),
            location: [0.25, 0.5],
            orientation: 90.0,
            presences: vec![Presence {
                identity: "5".into(),
                location: [0.75, 0.5],
                orientation: 270.0,
            }],
        });

        let value: Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "Type": "Proximity",
                "Identity": "4",
                "Location": [0.25, 0.5],
                "Orientation": 90.0,
                "Presences": [
                    {"Identity": "5", "Location": [0.75, 0.5], "Orientation": 270.0}
                ]
            })
        );
    }
}
