//! `SignalingServer` builder and accept loop.
//!
//! This is the entry point for running a Parley server over WebSocket. It
//! ties the layers together: listener → transport → peer → room.

use std::net::SocketAddr;
use std::sync::Arc;

use parley_observer::{Event, Observer};
use parley_room::{Peer, PeerId, Room};
use parley_transport::WebSocketListener;

use crate::ParleyError;
use crate::handler::handle_connection;

/// Query parameter carrying the peer id unless configured otherwise.
pub const DEFAULT_PEER_ID_PARAM: &str = "peerId";

/// Builds the application data attached to each new peer.
type DataFactory<D> = dyn Fn(&PeerId, SocketAddr) -> D + Send + Sync;

/// Something the server announces.
pub enum ServerEvent<D = ()> {
    /// A connection was upgraded and its peer admitted into the room.
    ///
    /// Emitted before the connection's read loop starts, so listeners
    /// attached to the peer here see every message it receives.
    PeerJoined(Arc<Peer<D>>),
}

/// Discriminant of [`ServerEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    PeerJoined,
}

impl<D: Send + Sync + 'static> Event for ServerEvent<D> {
    type Kind = ServerEventKind;

    fn kind(&self) -> ServerEventKind {
        match self {
            Self::PeerJoined(_) => ServerEventKind::PeerJoined,
        }
    }
}

/// Shared server state passed to each connection task.
pub(crate) struct ServerState<D: Send + Sync + 'static> {
    pub(crate) room: Room<D>,
    pub(crate) peer_id_param: String,
    pub(crate) make_data: Box<DataFactory<D>>,
    pub(crate) events: Observer<ServerEvent<D>>,
}

/// Builder for configuring and starting a signaling server.
///
/// # Example
///
/// ```rust,no_run
/// use parley::prelude::*;
///
/// # async fn start() -> Result<(), ParleyError> {
/// let room: Room = Room::new();
/// let server = SignalingServer::builder()
///     .bind("0.0.0.0:4443")
///     .build(room)
///     .await?;
/// server.run().await
/// # }
/// ```
pub struct SignalingServerBuilder {
    bind_addr: String,
    peer_id_param: String,
}

impl SignalingServerBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            bind_addr: "127.0.0.1:4443".to_string(),
            peer_id_param: DEFAULT_PEER_ID_PARAM.to_string(),
        }
    }

    /// Sets the address to bind the server to.
    pub fn bind(mut self, addr: &str) -> Self {
        self.bind_addr = addr.to_string();
        self
    }

    /// Sets the query parameter the peer id is read from.
    pub fn peer_id_param(mut self, name: &str) -> Self {
        self.peer_id_param = name.to_string();
        self
    }

    /// Binds the listener. Every peer starts with `D::default()` as its data.
    pub async fn build<D>(self, room: Room<D>) -> Result<SignalingServer<D>, ParleyError>
    where
        D: Default + Send + Sync + 'static,
    {
        self.build_with(room, |_, _| D::default()).await
    }

    /// Binds the listener. `make_data` builds each peer's data from its id
    /// and remote address.
    pub async fn build_with<D, F>(
        self,
        room: Room<D>,
        make_data: F,
    ) -> Result<SignalingServer<D>, ParleyError>
    where
        D: Send + Sync + 'static,
        F: Fn(&PeerId, SocketAddr) -> D + Send + Sync + 'static,
    {
        let listener = WebSocketListener::bind(&self.bind_addr).await?;

        let state = Arc::new(ServerState {
            room,
            peer_id_param: self.peer_id_param,
            make_data: Box::new(make_data),
            events: Observer::new(),
        });

        Ok(SignalingServer { listener, state })
    }
}

impl Default for SignalingServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A bound signaling server.
///
/// Subscribe to [`events()`](Self::events), then call
/// [`run()`](Self::run) to start accepting connections.
pub struct SignalingServer<D: Send + Sync + 'static = ()> {
    listener: WebSocketListener,
    state: Arc<ServerState<D>>,
}

impl SignalingServer {
    /// Creates a new builder.
    pub fn builder() -> SignalingServerBuilder {
        SignalingServerBuilder::new()
    }
}

impl<D: Send + Sync + 'static> SignalingServer<D> {
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The room connections are admitted into.
    pub fn room(&self) -> &Room<D> {
        &self.state.room
    }

    /// Server events, such as a peer joining.
    pub fn events(&self) -> &Observer<ServerEvent<D>> {
        &self.state.events
    }

    /// Runs the accept loop.
    ///
    /// Each accepted connection gets its own task, which completes the
    /// upgrade, admits the peer and drives the read loop. Runs until the
    /// process is terminated.
    pub async fn run(self) -> Result<(), ParleyError> {
        tracing::info!(addr = ?self.local_addr().ok(), "signaling server running");

        loop {
            match self.listener.accept_pending().await {
                Ok(pending) => {
                    let state = Arc::clone(&self.state);
                    tokio::spawn(async move {
                        let remote_addr = pending.remote_addr();
                        if let Err(e) = handle_connection(pending, state).await {
                            tracing::debug!(
                                %remote_addr,
                                error = %e,
                                "connection ended with error"
                            );
                        }
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                }
            }
        }
    }
}
