//! Peer: one protocol endpoint wrapping a transport.
//!
//! Outbound, a peer turns [`Peer::request`] calls into wire requests and
//! parks each caller until the matching response arrives, the request
//! times out, or the peer closes. Inbound, it routes responses to those
//! parked callers and publishes requests and notifications through its
//! [`Observer`].
//!
//! # Locking
//!
//! A single mutex guards `{closed, pending}`. It is only held for map
//! operations: encoding, sending, and event handlers all run outside it,
//! so a handler may call back into the peer (or close it) freely.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use parley_observer::{Event, ListenerId, Observer};
use parley_protocol::{
    Message, MessageFactory, Notification, Payload, RemoteError, Request, Response,
};
use parley_transport::{Transport, TransportEvent, TransportEventKind, TransportId};
use serde::Serialize;
use tokio::sync::{oneshot, watch};

use crate::{PeerConfig, PeerError};

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Identifier of a peer, unique within its room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl Borrow<str> for PeerId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Something a peer announces to the application.
#[derive(Debug)]
pub enum PeerEvent {
    /// The remote sent a request. Answer it through the attached responder.
    Request(IncomingRequest),
    /// The remote sent a notification.
    Notification(Notification),
    /// The peer closed. Emitted exactly once.
    Close,
}

/// Discriminant of [`PeerEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    Request,
    Notification,
    Close,
}

impl Event for PeerEvent {
    type Kind = PeerEventKind;

    fn kind(&self) -> PeerEventKind {
        match self {
            Self::Request(_) => PeerEventKind::Request,
            Self::Notification(_) => PeerEventKind::Notification,
            Self::Close => PeerEventKind::Close,
        }
    }
}

/// An inbound request together with the means to answer it.
#[derive(Debug)]
pub struct IncomingRequest {
    request: Request,
    responder: Responder,
}

impl IncomingRequest {
    /// The requested method.
    pub fn method(&self) -> &str {
        &self.request.method
    }

    /// The request body.
    pub fn data(&self) -> &Payload {
        &self.request.data
    }

    /// A handle for answering later, e.g. from a spawned task.
    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }

    /// Answers with a success response. See [`Responder::accept`].
    pub fn accept<T: Serialize + ?Sized>(&self, data: &T) -> Result<(), PeerError> {
        self.responder.accept(data)
    }

    /// Answers with an error response. See [`Responder::reject`].
    pub fn reject(&self, error: impl Into<RemoteError>) -> Result<(), PeerError> {
        self.responder.reject(error)
    }
}

/// Single-use completion handle for an inbound request.
///
/// Every clone shares one "answered" flag: across all handlers and all
/// clones, exactly one `accept` or `reject` sends a response and the rest
/// get [`PeerError::AlreadyResponded`]. If nobody answers, no response is
/// sent and the remote's own timeout fires.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    request_id: u32,
    peer_id: PeerId,
    transport: Arc<dyn Transport>,
    responded: AtomicBool,
}

impl Responder {
    fn new(request_id: u32, peer_id: PeerId, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                request_id,
                peer_id,
                transport,
                responded: AtomicBool::new(false),
            }),
        }
    }

    /// Returns `true` once a response has been claimed.
    pub fn is_responded(&self) -> bool {
        self.inner.responded.load(Ordering::Acquire)
    }

    /// Sends a success response carrying `data`.
    ///
    /// `data` is serialized before the responder is claimed, so a payload
    /// that fails to encode leaves the request open for a `reject`.
    pub fn accept<T: Serialize + ?Sized>(&self, data: &T) -> Result<(), PeerError> {
        let payload = Payload::new(data)?;
        self.claim()?;
        self.send(Message::success_response(self.inner.request_id, payload))
    }

    /// Sends an error response.
    ///
    /// Anything convertible into [`RemoteError`] works: a `RemoteError`
    /// is sent verbatim, a string or a [`PeerError`] becomes code 500.
    pub fn reject(&self, error: impl Into<RemoteError>) -> Result<(), PeerError> {
        self.claim()?;
        self.send(Message::error_response(self.inner.request_id, error.into()))
    }

    fn claim(&self) -> Result<(), PeerError> {
        self.inner
            .responded
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| PeerError::AlreadyResponded)
    }

    fn send(&self, response: Message) -> Result<(), PeerError> {
        tracing::debug!(peer_id = %self.inner.peer_id, %response, "sending response");
        self.inner.transport.send(response.to_bytes()?)?;
        Ok(())
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("request_id", &self.inner.request_id)
            .field("responded", &self.is_responded())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// Bookkeeping for one request awaiting its response.
struct PendingRequest {
    method: String,
    sent_at: Instant,
    reply: oneshot::Sender<Result<Payload, PeerError>>,
}

#[derive(Default)]
struct PeerState {
    closed: bool,
    pending: HashMap<u32, PendingRequest>,
}

/// One protocol endpoint.
///
/// Created with its transport already attached (usually through
/// [`Room::create_peer`](crate::Room::create_peer)) and handed out as
/// `Arc<Peer<D>>`. `D` is opaque application data attached to the peer.
pub struct Peer<D = ()> {
    id: PeerId,
    data: D,
    transport: Arc<dyn Transport>,
    factory: MessageFactory,
    config: PeerConfig,
    state: Mutex<PeerState>,
    /// Flipped to `true` on close; every waiting request watches it.
    closed_gate: watch::Sender<bool>,
    /// Our subscriptions on the transport, removed on close.
    transport_listeners: Mutex<Vec<ListenerId>>,
    events: Observer<PeerEvent>,
}

impl<D: Send + Sync + 'static> Peer<D> {
    /// Creates a peer with default configuration and random request ids.
    pub fn new(id: impl Into<PeerId>, data: D, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_config(id, data, transport, PeerConfig::default(), MessageFactory::default())
    }

    /// Creates a peer and subscribes it to the transport's events.
    ///
    /// A transport that is already closed yields a peer that is closed
    /// from the start and never sends anything.
    pub fn with_config(
        id: impl Into<PeerId>,
        data: D,
        transport: Arc<dyn Transport>,
        config: PeerConfig,
        factory: MessageFactory,
    ) -> Arc<Self> {
        let peer = Arc::new(Self {
            id: id.into(),
            data,
            transport,
            factory,
            config,
            state: Mutex::new(PeerState::default()),
            closed_gate: watch::Sender::new(false),
            transport_listeners: Mutex::new(Vec::new()),
            events: Observer::new(),
        });

        if peer.transport.is_closed() {
            tracing::debug!(peer_id = %peer.id, "transport already closed");
            peer.close();
            return peer;
        }

        let weak = Arc::downgrade(&peer);
        let on_message = peer
            .transport
            .events()
            .on(TransportEventKind::Message, move |event| {
                if let (Some(peer), TransportEvent::Message(message)) = (weak.upgrade(), event) {
                    peer.handle_message(message.clone());
                }
            });
        let weak = Arc::downgrade(&peer);
        let on_close = peer
            .transport
            .events()
            .on(TransportEventKind::Close, move |_| {
                if let Some(peer) = weak.upgrade() {
                    peer.close();
                }
            });
        peer.listeners().extend([on_message, on_close]);

        // The transport may have closed while we were subscribing, in which
        // case its close event never reached us.
        if peer.transport.is_closed() {
            peer.close();
        }

        tracing::debug!(peer_id = %peer.id, transport = %peer.transport.id(), "peer created");
        peer
    }
}

impl<D> Peer<D> {
    fn state(&self) -> MutexGuard<'_, PeerState> {
        // Only map operations run under this lock; a poisoned guard still
        // holds a consistent map.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<ListenerId>> {
        self.transport_listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The peer's id.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    /// The application data attached at creation.
    pub fn data(&self) -> &D {
        &self.data
    }

    /// The underlying transport's id, for logs.
    pub fn transport_id(&self) -> TransportId {
        self.transport.id()
    }

    /// Subscribe here for requests, notifications, and close.
    pub fn events(&self) -> &Observer<PeerEvent> {
        &self.events
    }

    /// Returns `true` once the peer is closed.
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Number of requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// The timeout a request sent right now would get.
    pub fn request_timeout(&self) -> Duration {
        self.config.timeout_for(self.pending_count())
    }

    /// Sends a request and waits for its response.
    ///
    /// Resolves to the response payload, or to:
    /// - [`PeerError::Rejected`] if the remote answered with an error,
    /// - [`PeerError::Timeout`] if no answer arrived in time,
    /// - [`PeerError::Closed`] if the peer is or becomes closed,
    /// - [`PeerError::Transport`] if the send itself failed (no waiting).
    ///
    /// The request's bookkeeping is removed exactly once in every outcome,
    /// including when the returned future is dropped before completing.
    pub async fn request<T: Serialize + ?Sized>(
        &self,
        method: &str,
        data: &T,
    ) -> Result<Payload, PeerError> {
        let mut request = self.factory.request(method, data)?;
        let (reply_tx, mut reply_rx) = oneshot::channel();

        // Register before sending: a fast response must find its entry.
        let (id, timeout) = {
            let mut state = self.state();
            if state.closed {
                return Err(PeerError::Closed);
            }
            let timeout = self.config.timeout_for(state.pending.len());
            while state.pending.contains_key(&request.id) {
                request.id = self.factory.next_id();
            }
            state.pending.insert(
                request.id,
                PendingRequest {
                    method: method.to_owned(),
                    sent_at: Instant::now(),
                    reply: reply_tx,
                },
            );
            (request.id, timeout)
        };
        let _guard = PendingGuard { peer: self, id };

        self.send(Message::from(request).to_bytes()?)?;
        tracing::debug!(peer_id = %self.id, id, method, ?timeout, "request sent");

        let mut closed = self.closed_gate.subscribe();
        let wake = tokio::select! {
            biased;
            reply = &mut reply_rx => Wake::Reply(reply.unwrap_or(Err(PeerError::Closed))),
            _ = closed.wait_for(|closed| *closed) => Wake::Closed,
            _ = tokio::time::sleep(timeout) => Wake::Timeout,
        };

        match wake {
            Wake::Reply(result) => result,
            Wake::Closed => Err(PeerError::Closed),
            Wake::Timeout => {
                if self.take_pending(id).is_some() {
                    tracing::debug!(peer_id = %self.id, id, method, ?timeout, "request timed out");
                    return Err(PeerError::Timeout {
                        method: method.to_owned(),
                        timeout,
                    });
                }
                // The entry was already claimed by an inbound response or by
                // close. Its sender either sends the reply or is dropped.
                reply_rx.await.unwrap_or(Err(PeerError::Closed))
            }
        }
    }

    /// Sends a notification. No response is expected.
    pub fn notify<T: Serialize + ?Sized>(&self, method: &str, data: &T) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        let notification = self.factory.notification(method, data)?;
        self.send(notification.to_bytes()?)?;
        tracing::debug!(peer_id = %self.id, method, "notification sent");
        Ok(())
    }

    /// Closes the peer. Idempotent and safe to call from many tasks at once;
    /// the side effects run exactly once.
    ///
    /// Closes the transport, wakes every waiting request with
    /// [`PeerError::Closed`], stops inbound processing, emits
    /// [`PeerEvent::Close`], and drops all listeners.
    pub fn close(&self) {
        let pending = {
            let mut state = self.state();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.pending)
        };
        tracing::info!(peer_id = %self.id, pending = pending.len(), "peer closed");

        self.closed_gate.send_replace(true);
        // Dropping the reply senders wakes any waiter the gate raced with.
        drop(pending);

        let listeners = std::mem::take(&mut *self.listeners());
        for listener in listeners {
            self.transport.events().off(listener);
        }
        self.transport.close();

        // No lock is held here: close handlers may reenter (e.g. a room
        // de-registering this peer).
        self.events.safe_emit(&PeerEvent::Close);
        self.events.remove_all_listeners();
    }

    /// Sends a frame. A failure on a peer that closed in the meantime is
    /// reported as [`PeerError::Closed`].
    fn send(&self, frame: Vec<u8>) -> Result<(), PeerError> {
        self.transport.send(frame).map_err(|e| {
            if self.is_closed() {
                PeerError::Closed
            } else {
                PeerError::Transport(e)
            }
        })
    }

    fn take_pending(&self, id: u32) -> Option<PendingRequest> {
        self.state().pending.remove(&id)
    }

    fn handle_message(&self, message: Message) {
        if self.is_closed() {
            return;
        }
        match message {
            Message::Request(request) => self.handle_request(request),
            Message::Response(response) => self.handle_response(response),
            Message::Notification(notification) => {
                tracing::debug!(
                    peer_id = %self.id,
                    method = %notification.method,
                    "notification received"
                );
                self.events.safe_emit(&PeerEvent::Notification(notification));
            }
        }
    }

    fn handle_request(&self, request: Request) {
        tracing::debug!(
            peer_id = %self.id,
            id = request.id,
            method = %request.method,
            "request received"
        );
        if self.events.listener_count(PeerEventKind::Request) == 0 {
            // Nothing will answer; the remote's timeout decides.
            tracing::debug!(
                peer_id = %self.id,
                id = request.id,
                "no request listeners, request left unanswered"
            );
        }
        let responder = Responder::new(request.id, self.id.clone(), Arc::clone(&self.transport));
        self.events
            .safe_emit(&PeerEvent::Request(IncomingRequest { request, responder }));
    }

    fn handle_response(&self, response: Response) {
        let Some(pending) = self.take_pending(response.id) else {
            tracing::warn!(
                peer_id = %self.id,
                id = response.id,
                "received response does not match any sent request"
            );
            return;
        };
        tracing::debug!(
            peer_id = %self.id,
            id = response.id,
            method = %pending.method,
            ok = response.is_ok(),
            elapsed = ?pending.sent_at.elapsed(),
            "response received"
        );
        // The waiter may be gone (its future was dropped); nothing to do then.
        let _ = pending.reply.send(response.result.map_err(PeerError::Rejected));
    }
}

impl<D> fmt::Debug for Peer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("transport", &self.transport.id())
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// What woke a waiting request.
enum Wake {
    Reply(Result<Payload, PeerError>),
    Closed,
    Timeout,
}

/// Removes a pending entry when the waiting request ends, however it ends.
struct PendingGuard<'a, D> {
    peer: &'a Peer<D>,
    id: u32,
}

impl<D> Drop for PendingGuard<'_, D> {
    fn drop(&mut self) {
        self.peer.take_pending(self.id);
    }
}
