//! Unified error type for Parley.

use parley_protocol::ProtocolError;
use parley_room::{PeerError, RoomError};
use parley_transport::TransportError;

/// Top-level error that wraps every crate-specific error.
///
/// When using the `parley` meta-crate you deal with this single type;
/// `?` converts sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum ParleyError {
    /// Binding, accepting, upgrading, reading or writing a connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding or decoding an envelope.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A request, notification or response on a peer.
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// Admitting a peer into a room.
    #[error(transparent)]
    Room(#[from] RoomError),
}
