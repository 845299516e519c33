//! Codec trait and implementations for turning messages into bytes.
//!
//! A "codec" (coder/decoder) converts between [`Message`] and the bytes
//! a transport carries. JSON is the fixed wire format: [`JsonCodec`] is
//! what [`Message::to_bytes`] and [`Message::from_slice`] use, and what
//! the transports decode inbound frames with. The [`Codec`] trait is the
//! encode/decode contract a codec implements.

use crate::types::WireMessage;
use crate::{Message, ProtocolError};

/// Encodes messages to bytes and decodes bytes back into messages.
///
/// `Send + Sync + 'static` because a codec is shared by the transport's
/// read loop and any number of tasks sending through a peer.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a message.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Encode`] if serialization fails.
    fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes one message.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Malformed`] if the bytes are not an
    /// envelope at all, or [`ProtocolError::InvalidMessage`] if they are
    /// an envelope that breaks a protocol rule.
    fn decode(&self, data: &[u8]) -> Result<Message, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that speaks the JSON envelope.
///
/// ```rust
/// use parley_protocol::{Codec, JsonCodec, Message, Payload};
///
/// let codec = JsonCodec;
/// let message = Message::request(42, "getRouterRtpCapabilities", Payload::empty());
///
/// let bytes = codec.encode(&message).unwrap();
/// assert_eq!(bytes, br#"{"request":true,"id":42,"method":"getRouterRtpCapabilities"}"#);
///
/// let decoded = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded, message);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        // The wire form takes ownership so the payload moves rather than
        // being re-serialized.
        serde_json::to_vec(&WireMessage::from(message.clone())).map_err(ProtocolError::Encode)
    }

    fn decode(&self, data: &[u8]) -> Result<Message, ProtocolError> {
        let wire: WireMessage = serde_json::from_slice(data).map_err(ProtocolError::Malformed)?;
        Message::try_from(wire)
    }
}

impl Message {
    /// Encodes this message with [`JsonCodec`].
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        JsonCodec.encode(self)
    }

    /// Decodes one message with [`JsonCodec`].
    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        JsonCodec.decode(data)
    }
}
