//! Room: a registry of peers with a shared lifecycle.
//!
//! Peers are admitted with [`Room::create_peer`] and leave on their own
//! when they close. Closing the room closes every peer still in it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use parley_observer::{Event, Observer};
use parley_protocol::{MessageFactory, Payload};
use parley_transport::Transport;
use serde::Serialize;

use crate::{Peer, PeerError, PeerEventKind, PeerId, RoomConfig, RoomError};

/// Something a room announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    /// The room closed. Emitted exactly once.
    Close,
}

/// Discriminant of [`RoomEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomEventKind {
    Close,
}

impl Event for RoomEvent {
    type Kind = RoomEventKind;

    fn kind(&self) -> RoomEventKind {
        match self {
            Self::Close => RoomEventKind::Close,
        }
    }
}

struct Registry<D> {
    closed: bool,
    peers: HashMap<PeerId, Arc<Peer<D>>>,
}

struct RoomInner<D> {
    registry: Mutex<Registry<D>>,
    events: Observer<RoomEvent>,
    config: RoomConfig,
    factory: MessageFactory,
}

impl<D> RoomInner<D> {
    fn registry(&self) -> MutexGuard<'_, Registry<D>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// De-registers `peer`, but only if it is still the one under its id.
    fn remove_peer(&self, peer: &Arc<Peer<D>>) {
        let mut registry = self.registry();
        let same = registry
            .peers
            .get(peer.id())
            .is_some_and(|current| Arc::ptr_eq(current, peer));
        if same {
            registry.peers.remove(peer.id());
            tracing::debug!(peer_id = %peer.id(), peers = registry.peers.len(), "peer left room");
        }
    }
}

/// A set of peers keyed by [`PeerId`].
///
/// Cheap to clone: clones share the same registry. `D` is the opaque
/// data attached to each peer.
pub struct Room<D = ()> {
    inner: Arc<RoomInner<D>>,
}

impl<D> Clone for Room<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Send + Sync + 'static> Default for Room<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Send + Sync + 'static> Room<D> {
    /// Creates an empty room with default configuration.
    pub fn new() -> Self {
        Self::with_config(RoomConfig::default(), MessageFactory::default())
    }

    /// Creates an empty room. Every peer it creates gets `config.peer` and
    /// draws request ids from `factory`.
    pub fn with_config(config: RoomConfig, factory: MessageFactory) -> Self {
        Self {
            inner: Arc::new(RoomInner {
                registry: Mutex::new(Registry {
                    closed: false,
                    peers: HashMap::new(),
                }),
                events: Observer::new(),
                config,
                factory,
            }),
        }
    }

    /// Admits a new peer talking over `transport`.
    ///
    /// # Errors
    /// - [`RoomError::DuplicatePeerId`] if a peer with this id is already
    ///   in the room. The existing peer is untouched.
    /// - [`RoomError::Closed`] if the room is closed.
    ///
    /// In both cases `transport` is closed before returning.
    pub fn create_peer(
        &self,
        peer_id: impl Into<PeerId>,
        data: D,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Peer<D>>, RoomError> {
        let peer_id = peer_id.into();
        if let Err(e) = self.check_admission(&peer_id) {
            transport.close();
            return Err(e);
        }

        let peer = Peer::with_config(
            peer_id.clone(),
            data,
            transport,
            self.inner.config.peer.clone(),
            self.inner.factory.clone(),
        );

        {
            let mut registry = self.inner.registry();
            let rejected = if registry.closed {
                Some(RoomError::Closed)
            } else if registry.peers.contains_key(&peer_id) {
                // Lost a race with a concurrent create_peer for the same id.
                Some(RoomError::DuplicatePeerId(peer_id.clone()))
            } else {
                registry.peers.insert(peer_id.clone(), Arc::clone(&peer));
                None
            };
            if let Some(e) = rejected {
                drop(registry);
                peer.close();
                return Err(e);
            }
        }

        let room = Arc::downgrade(&self.inner);
        let weak_peer = Arc::downgrade(&peer);
        peer.events().on(PeerEventKind::Close, move |_| {
            if let (Some(room), Some(peer)) = (room.upgrade(), weak_peer.upgrade()) {
                room.remove_peer(&peer);
            }
        });

        // The peer may have closed before the handler above was attached.
        if peer.is_closed() {
            self.inner.remove_peer(&peer);
        }

        tracing::info!(peer_id = %peer_id, "peer joined room");
        Ok(peer)
    }

    fn check_admission(&self, peer_id: &PeerId) -> Result<(), RoomError> {
        let registry = self.inner.registry();
        if registry.closed {
            tracing::debug!(peer_id = %peer_id, "room closed, refusing peer");
            return Err(RoomError::Closed);
        }
        if registry.peers.contains_key(peer_id) {
            tracing::warn!(peer_id = %peer_id, "there is already a peer with this id");
            return Err(RoomError::DuplicatePeerId(peer_id.clone()));
        }
        Ok(())
    }
}

impl<D> Room<D> {
    /// Returns `true` if a peer with this id is in the room.
    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.inner.registry().peers.contains_key(peer_id)
    }

    /// Looks up a peer by id.
    pub fn get_peer(&self, peer_id: &str) -> Option<Arc<Peer<D>>> {
        self.inner.registry().peers.get(peer_id).cloned()
    }

    /// A snapshot of the peers currently in the room.
    pub fn peers(&self) -> Vec<Arc<Peer<D>>> {
        self.inner.registry().peers.values().cloned().collect()
    }

    /// Number of peers in the room.
    pub fn peer_count(&self) -> usize {
        self.inner.registry().peers.len()
    }

    /// Returns `true` once the room is closed.
    pub fn is_closed(&self) -> bool {
        self.inner.registry().closed
    }

    /// Subscribe here for the room's close event.
    pub fn events(&self) -> &Observer<RoomEvent> {
        &self.inner.events
    }

    /// Sends a notification to every peer in the room except `except`.
    ///
    /// A peer that fails does not stop the others; failures are returned
    /// per peer. Only an unencodable payload fails the call as a whole.
    pub fn broadcast_notification<T: Serialize + ?Sized>(
        &self,
        method: &str,
        data: &T,
        except: Option<&str>,
    ) -> Result<Vec<(PeerId, PeerError)>, PeerError> {
        // Encode once up front so a bad payload surfaces before any send.
        let data = Payload::new(data)?;
        let mut failures = Vec::new();
        for peer in self.peers() {
            if except.is_some_and(|id| peer.id().as_str() == id) {
                continue;
            }
            if let Err(e) = peer.notify(method, &data) {
                tracing::debug!(
                    peer_id = %peer.id(),
                    method,
                    error = %e,
                    "broadcast to peer failed"
                );
                failures.push((peer.id().clone(), e));
            }
        }
        Ok(failures)
    }

    /// Closes the room and every peer in it. Idempotent.
    ///
    /// Emits [`RoomEvent::Close`] after all peers are closed.
    pub fn close(&self) {
        let peers = {
            let mut registry = self.inner.registry();
            if registry.closed {
                return;
            }
            registry.closed = true;
            std::mem::take(&mut registry.peers)
        };
        tracing::info!(peers = peers.len(), "room closed");

        for peer in peers.into_values() {
            peer.close();
        }

        self.inner.events.safe_emit(&RoomEvent::Close);
        self.inner.events.remove_all_listeners();
    }
}

impl<D> fmt::Debug for Room<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.inner.registry();
        f.debug_struct("Room")
            .field("closed", &registry.closed)
            .field("peers", &registry.peers.len())
            .finish()
    }
}
