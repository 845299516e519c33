//! # Parley
//!
//! Transport-agnostic signaling engine.
//!
//! Parley speaks a small JSON protocol of requests, responses, and
//! notifications between peers. A [`Peer`](parley_room::Peer) correlates
//! its outbound requests with their responses, a
//! [`Room`](parley_room::Room) keeps track of connected peers, and
//! [`SignalingServer`] admits WebSocket connections into a room.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use parley::prelude::*;
//!
//! # async fn start() -> Result<(), ParleyError> {
//! let server = SignalingServer::builder()
//!     .bind("0.0.0.0:4443")
//!     .build(Room::<()>::new())
//!     .await?;
//!
//! server.events().on(ServerEventKind::PeerJoined, |event| {
//!     let ServerEvent::PeerJoined(peer) = event;
//!     peer.events().on(PeerEventKind::Request, |event| {
//!         if let PeerEvent::Request(request) = event {
//!             let _ = request.accept(request.data());
//!         }
//!     });
//! });
//!
//! server.run().await
//! # }
//! ```
//!
//! The sub-crates are re-exported for direct use: [`protocol`],
//! [`observer`], [`transport`], and [`room`].

mod error;
mod handler;
mod server;

pub use error::ParleyError;
pub use server::{
    DEFAULT_PEER_ID_PARAM, ServerEvent, ServerEventKind, SignalingServer, SignalingServerBuilder,
};

pub use parley_observer as observer;
pub use parley_protocol as protocol;
pub use parley_room as room;
pub use parley_transport as transport;

/// Everything needed to run a server and handle peers.
pub mod prelude {
    pub use crate::{ParleyError, ServerEvent, ServerEventKind, SignalingServer};
    pub use parley_observer::{Event, ListenerId, Observer};
    pub use parley_protocol::{Message, Payload, RemoteError};
    pub use parley_room::{
        IncomingRequest, Peer, PeerConfig, PeerError, PeerEvent, PeerEventKind, PeerId,
        Responder, Room, RoomConfig, RoomError, RoomEvent, RoomEventKind,
    };
    pub use parley_transport::{MemoryTransport, Transport, TransportError};
}
