//! Transport capability for Parley.
//!
//! A peer needs very little from the channel underneath it: a way to send
//! one encoded message, a way to close, a closed check, and events for
//! "a message arrived" and "the channel closed". That is the [`Transport`]
//! trait. Everything else (framing, write serialization, the read loop)
//! belongs to the implementation.
//!
//! # Implementations
//!
//! - [`WebSocketTransport`] (feature `websocket`, default) — one
//!   JSON envelope per text frame, via `tokio-tungstenite`
//! - [`MemoryTransport`] — a linked in-process pair, for tests and
//!   in-process wiring
//!
//! Both drive inbound traffic from an explicit `run()` future the owner
//! spawns, and both serialize concurrent `send` calls through a queue.

mod error;
mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use memory::MemoryTransport;
#[cfg(feature = "websocket")]
pub use websocket::{PendingConnection, WebSocketListener, WebSocketTransport};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parley_observer::{Event, Observer};
use parley_protocol::{Codec, JsonCodec, Message};

/// Counter for generating unique transport IDs.
static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a transport, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(u64);

impl TransportId {
    /// Creates a `TransportId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-unique id.
    pub fn next() -> Self {
        Self(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport-{}", self.0)
    }
}

/// Something that happened on a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded inbound message.
    Message(Message),
    /// The transport closed. Emitted exactly once.
    Close,
}

/// Discriminant of [`TransportEvent`], used to subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    Message,
    Close,
}

impl Event for TransportEvent {
    type Kind = TransportEventKind;

    fn kind(&self) -> TransportEventKind {
        match self {
            Self::Message(_) => TransportEventKind::Message,
            Self::Close => TransportEventKind::Close,
        }
    }
}

/// The channel a peer talks through.
///
/// Implementations must be safe to share between tasks: `send` may be
/// called concurrently (a request on one task, a notification on
/// another) and must keep each message intact on the wire.
pub trait Transport: Send + Sync + 'static {
    /// Queues one encoded message for delivery.
    ///
    /// # Errors
    /// Returns [`TransportError::ConnectionClosed`] once the transport
    /// is closed.
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError>;

    /// Closes the transport. Idempotent; the first call emits
    /// [`TransportEvent::Close`] and drops all listeners.
    fn close(&self);

    /// Returns `true` once the transport is closed.
    fn is_closed(&self) -> bool;

    /// Inbound message and close events.
    fn events(&self) -> &Observer<TransportEvent>;

    /// Identifier for logs.
    fn id(&self) -> TransportId;
}

/// Decodes one inbound frame and emits it, logging and dropping frames
/// that cannot be delivered.
///
/// Malformed frames are never answered: without a decodable envelope
/// there is no request id to reply to.
pub(crate) fn dispatch_frame(id: TransportId, events: &Observer<TransportEvent>, data: &[u8]) {
    if events.listener_count(TransportEventKind::Message) == 0 {
        tracing::warn!(transport = %id, "no listeners for message event, ignoring frame");
        return;
    }
    match JsonCodec.decode(data) {
        Ok(message) => {
            tracing::trace!(transport = %id, %message, "received");
            events.safe_emit(&TransportEvent::Message(message));
        }
        Err(e) => {
            tracing::warn!(transport = %id, error = %e, "dropping undecodable frame");
        }
    }
}
