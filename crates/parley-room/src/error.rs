//! Error types for peers and rooms.

use std::time::Duration;

use parley_protocol::{ProtocolError, RemoteError};
use parley_transport::TransportError;

use crate::PeerId;

/// Errors returned by [`Peer`](crate::Peer) operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// The peer is closed, or closed while the request was waiting.
    #[error("peer closed")]
    Closed,

    /// No response arrived within the request's timeout.
    #[error("request timeout: {method} got no response within {timeout:?}")]
    Timeout {
        /// The method that timed out.
        method: String,
        /// The effective (load-scaled) timeout that elapsed.
        timeout: Duration,
    },

    /// The remote answered with an error response.
    #[error("request rejected: {0}")]
    Rejected(RemoteError),

    /// The transport refused the message.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The message or its payload could not be encoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The inbound request was already accepted or rejected.
    #[error("request already responded to")]
    AlreadyResponded,
}

/// Turns any peer failure into something a request handler can send back.
///
/// A remote rejection passes through with its own code; everything else
/// becomes a generic server error carrying the error text.
impl From<PeerError> for RemoteError {
    fn from(error: PeerError) -> Self {
        match error {
            PeerError::Rejected(remote) => remote,
            other => RemoteError::internal(other),
        }
    }
}

/// Errors returned by [`Room`](crate::Room) operations.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// A live peer is already registered under this id.
    #[error("there is already a peer with id {0}")]
    DuplicatePeerId(PeerId),

    /// The room is closed and accepts no new peers.
    #[error("room is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_converts_verbatim() {
        let remote: RemoteError = PeerError::Rejected(RemoteError::new(403, "nope")).into();
        assert_eq!(remote, RemoteError::new(403, "nope"));
    }

    #[test]
    fn test_other_errors_become_internal() {
        let remote: RemoteError = PeerError::Closed.into();
        assert_eq!(remote.code, RemoteError::INTERNAL);
        assert_eq!(remote.reason, "peer closed");
    }

    #[test]
    fn test_duplicate_peer_id_display() {
        let err = RoomError::DuplicatePeerId(PeerId::from("alice"));
        assert_eq!(err.to_string(), "there is already a peer with id alice");
    }
}
