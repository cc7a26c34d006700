//! Envelope encoding/decoding.
//!
//! The wire format is JSON (camelCase properties, enums as strings, `null`
//! fields omitted — see [`crate::protocol`]). This module is the single
//! place the crate touches the encoder, so swapping the JSON library means
//! swapping this file, not the call sites.
//!
//! [`peek_type`] reads only the envelope's `type` tag, which must stay
//! readable without binding the payload; the dispatcher relies on it to pick
//! a handler before the payload type is known.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::protocol::{PacketEnvelope, PacketType};

/// Serialize an envelope to its wire bytes.
pub fn encode<T: Serialize>(envelope: &PacketEnvelope<T>) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

/// Deserialize wire bytes into a typed envelope.
///
/// A JSON `null` in a non-nullable payload field fails here with the
/// encoder's error; `null` in an `Option` field yields `None`.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<PacketEnvelope<T>, serde_json::Error> {
    serde_json::from_slice(bytes)
}

/// Header-only view of an envelope, used to peek the type tag.
#[derive(Deserialize)]
struct EnvelopeHeader {
    #[serde(rename = "type")]
    packet_type: PacketType,
}

/// Read the packet type tag without binding the payload.
///
/// Returns `None` for bytes that are not a well-formed envelope or carry an
/// unknown type tag; the dispatcher treats both as "no handler".
pub fn peek_type(bytes: &[u8]) -> Option<PacketType> {
    serde_json::from_slice::<EnvelopeHeader>(bytes)
        .ok()
        .map(|header| header.packet_type)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::{HandshakeRequest, PROTOCOL_VERSION};

    #[test]
    fn encode_then_peek_reads_the_tag() {
        let envelope = PacketEnvelope::new(
            PacketType::HandshakeRequest,
            HandshakeRequest {
                client_version: PROTOCOL_VERSION.into(),
                player_name: "Alice".into(),
                password: None,
            },
        );
        let bytes = encode(&envelope).unwrap();
        assert_eq!(peek_type(&bytes), Some(PacketType::HandshakeRequest));
    }

    #[test]
    fn peek_tolerates_garbage() {
        assert_eq!(peek_type(b"not json"), None);
        assert_eq!(peek_type(b"{\"type\":\"NoSuchPacket\"}"), None);
        assert_eq!(peek_type(b"{}"), None);
    }

    #[test]
    fn null_into_non_nullable_field_fails() {
        let bytes =
            br#"{"type":"HandshakeRequest","version":"x","payload":{"clientVersion":null,"playerName":"a"}}"#;
        assert!(decode::<HandshakeRequest>(bytes).is_err());
    }

    #[test]
    fn null_into_option_field_yields_none() {
        let bytes = format!(
            r#"{{"type":"HandshakeRequest","version":"{PROTOCOL_VERSION}","payload":{{"clientVersion":"{PROTOCOL_VERSION}","playerName":"a","password":null}}}}"#
        );
        let envelope = decode::<HandshakeRequest>(bytes.as_bytes()).unwrap();
        assert_eq!(envelope.payload.password, None);
    }
}
