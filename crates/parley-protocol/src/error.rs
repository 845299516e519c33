//! Error types for the protocol layer.
//!
//! Each crate in Parley defines its own error enum. A `ProtocolError`
//! always means the problem is in turning messages into bytes or bytes
//! back into messages, never in networking or peer bookkeeping.

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (a payload or envelope could not become JSON).
    #[error("encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    /// The bytes are not a decodable envelope.
    ///
    /// Inbound malformed frames carry no trustworthy `id`, so they are
    /// logged and dropped by the receiver, never answered.
    #[error("malformed message: {0}")]
    Malformed(#[source] serde_json::Error),

    /// A payload could not be decoded into the requested type.
    #[error("payload decode failed: {0}")]
    Payload(#[source] serde_json::Error),

    /// The envelope decoded but breaks a protocol rule, e.g. no kind
    /// flag set, two kind flags set, or a request without an id.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
