use crate::TransportId;

/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport was closed (locally or by the remote end).
    #[error("transport {0} is closed")]
    ConnectionClosed(TransportId),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting a connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The protocol upgrade (e.g. the WebSocket handshake) was refused or
    /// broke off.
    #[error("handshake failed: {0}")]
    Handshake(#[source] Box<dyn std::error::Error + Send + Sync>),
}
