//! Per-connection handler: upgrade, admission, and the read loop.
//!
//! Each accepted connection gets its own Tokio task running this handler.
//! The flow is:
//!   1. Complete the WebSocket upgrade, reading the peer id from the URL
//!   2. Admit the peer into the room
//!   3. Announce it through `ServerEvent::PeerJoined`
//!   4. Drive the transport's read loop until the connection ends

use std::sync::Arc;

use parley_room::{Peer, PeerId};
use parley_transport::PendingConnection;

use crate::ParleyError;
use crate::server::{ServerEvent, ServerState};

/// Drop guard that closes a peer when its connection task exits.
///
/// Covers the paths the read loop's own close does not: a panic in the
/// task, or the task being aborted during shutdown.
struct PeerGuard<D> {
    peer: Arc<Peer<D>>,
}

impl<D> Drop for PeerGuard<D> {
    fn drop(&mut self) {
        self.peer.close();
    }
}

/// Handles a single connection from accept to close.
pub(crate) async fn handle_connection<D>(
    pending: PendingConnection,
    state: Arc<ServerState<D>>,
) -> Result<(), ParleyError>
where
    D: Send + Sync + 'static,
{
    let remote_addr = pending.remote_addr();
    tracing::debug!(%remote_addr, "handling new connection");

    // --- Step 1: Upgrade ---
    let (transport, peer_id) = pending.upgrade_with_param(&state.peer_id_param).await?;
    let peer_id = PeerId::from(peer_id);

    // --- Step 2: Admission ---
    let data = (state.make_data)(&peer_id, remote_addr);
    let peer = match state.room.create_peer(peer_id.clone(), data, transport.clone()) {
        Ok(peer) => peer,
        Err(e) => {
            tracing::warn!(%peer_id, %remote_addr, error = %e, "peer refused");
            return Err(e.into());
        }
    };
    let _guard = PeerGuard {
        peer: Arc::clone(&peer),
    };
    tracing::info!(%peer_id, %remote_addr, transport = %peer.transport_id(), "peer connected");

    // --- Step 3: Announce ---
    state.events.safe_emit(&ServerEvent::PeerJoined(Arc::clone(&peer)));

    // --- Step 4: Read loop ---
    let result = transport.run().await;
    tracing::info!(%peer_id, "peer disconnected");
    result.map_err(ParleyError::from)
}
