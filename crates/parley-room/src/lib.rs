//! Peers and rooms for Parley.
//!
//! A [`Peer`] sits on top of one transport. It correlates outbound
//! requests with their responses (with a load-scaled timeout and
//! cancellation on close) and publishes inbound requests and
//! notifications as [`PeerEvent`]s. A [`Room`] is a registry of peers
//! keyed by id that cleans up after peers as they close.
//!
//! # Key types
//!
//! - [`Peer`] — request/response correlation over a transport
//! - [`Responder`] — single-use answer handle for an inbound request
//! - [`Room`] — peer registry with a shared lifecycle
//! - [`PeerConfig`] / [`RoomConfig`] — timeouts
//!
//! # Example
//!
//! ```
//! use parley_room::{PeerEvent, PeerEventKind, Room};
//! use parley_transport::MemoryTransport;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let room: Room = Room::new();
//! let (server_side, _client_side) = MemoryTransport::pair();
//!
//! let peer = room.create_peer("alice", (), server_side).unwrap();
//! peer.events().on(PeerEventKind::Request, |event| {
//!     if let PeerEvent::Request(request) = event {
//!         let _ = request.accept(&"pong");
//!     }
//! });
//!
//! assert!(room.has_peer("alice"));
//! room.close();
//! assert!(peer.is_closed());
//! # }
//! ```

mod config;
mod error;
mod peer;
mod room;

pub use config::{PeerConfig, RoomConfig};
pub use error::{PeerError, RoomError};
pub use peer::{IncomingRequest, Peer, PeerEvent, PeerEventKind, PeerId, Responder};
pub use room::{Room, RoomEvent, RoomEventKind};
