//! Echo signaling server.
//!
//! Every peer connects to `ws://<addr>/?peerId=<id>`. Requests are echoed
//! back, except `broadcast`, which forwards its payload to every other
//! peer as a `chat` notification. Peers are told when someone joins or
//! leaves.
//!
//! ```text
//! PARLEY_ADDR=127.0.0.1:4443 RUST_LOG=debug cargo run -p echo-server
//! ```

use std::sync::Arc;
use std::time::Instant;

use parley::prelude::*;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

const DEFAULT_ADDR: &str = "127.0.0.1:4443";

/// Per-peer data.
#[derive(Debug)]
struct Session {
    connected_at: Instant,
}

#[derive(Serialize)]
struct PeerNotice<'a> {
    #[serde(rename = "peerId")]
    peer_id: &'a str,
}

#[tokio::main]
async fn main() -> Result<(), ParleyError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = std::env::var("PARLEY_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let room: Room<Session> = Room::new();

    let server = SignalingServer::builder()
        .bind(&addr)
        .build_with(room.clone(), |_, _| Session {
            connected_at: Instant::now(),
        })
        .await?;
    let local_addr = server.local_addr().map_err(TransportError::AcceptFailed)?;
    tracing::info!(addr = %local_addr, "echo server listening");

    server.events().on(ServerEventKind::PeerJoined, move |event| {
        let ServerEvent::PeerJoined(peer) = event;
        on_peer_joined(&room, peer);
    });

    server.run().await
}

fn on_peer_joined(room: &Room<Session>, peer: &Arc<Peer<Session>>) {
    let notice = PeerNotice {
        peer_id: peer.id().as_str(),
    };
    announce(room, "peerJoined", &notice, Some(peer.id().as_str()));

    let requests = room.clone();
    let weak = Arc::downgrade(peer);
    peer.events().on(PeerEventKind::Request, move |event| {
        let (PeerEvent::Request(request), Some(peer)) = (event, weak.upgrade()) else {
            return;
        };
        let result = match request.method() {
            "broadcast" => {
                announce(&requests, "chat", request.data(), Some(peer.id().as_str()));
                request.accept(&())
            }
            _ => request.accept(request.data()),
        };
        if let Err(e) = result {
            tracing::warn!(peer_id = %peer.id(), error = %e, "could not answer request");
        }
    });

    let leaving = room.clone();
    let peer_id = peer.id().clone();
    let weak = Arc::downgrade(peer);
    peer.events().on(PeerEventKind::Close, move |_| {
        if let Some(peer) = weak.upgrade() {
            tracing::info!(
                peer_id = %peer_id,
                session = ?peer.data().connected_at.elapsed(),
                "peer left"
            );
        }
        let notice = PeerNotice {
            peer_id: peer_id.as_str(),
        };
        announce(&leaving, "peerLeft", &notice, Some(peer_id.as_str()));
    });
}

fn announce<T: Serialize + ?Sized>(
    room: &Room<Session>,
    method: &str,
    data: &T,
    except: Option<&str>,
) {
    match room.broadcast_notification(method, data, except) {
        Ok(failures) => {
            for (peer_id, error) in failures {
                tracing::debug!(%peer_id, method, %error, "notification not delivered");
            }
        }
        Err(e) => tracing::warn!(method, error = %e, "could not encode notification"),
    }
}
