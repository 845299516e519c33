//! In-process transport pair.
//!
//! Two [`MemoryTransport`]s are linked back to back: bytes sent on one
//! arrive at the other. Frames go through the same decode path as a real
//! connection, so a peer cannot tell the difference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use parley_observer::Observer;
use tokio::sync::mpsc;

use crate::{Transport, TransportError, TransportEvent, TransportId, dispatch_frame};

/// One end of an in-memory transport pair. See [`MemoryTransport::pair`].
pub struct MemoryTransport {
    id: TransportId,
    closed: AtomicBool,
    /// Sender into the partner's inbound queue. Taken on close.
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Our inbound queue. Taken by `run`.
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    partner: Mutex<Weak<MemoryTransport>>,
    events: Observer<TransportEvent>,
}

impl MemoryTransport {
    /// Creates two linked transports. Closing either closes both.
    ///
    /// Nothing is delivered until each side's [`run`](Self::run) is
    /// being polled; messages sent before that are queued.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (to_a, a_inbound) = mpsc::unbounded_channel();
        let (to_b, b_inbound) = mpsc::unbounded_channel();

        let a = Arc::new(Self::new(to_b, a_inbound));
        let b = Arc::new(Self::new(to_a, b_inbound));
        *a.partner.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(&b);
        *b.partner.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(&a);

        tracing::debug!(a = %a.id, b = %b.id, "memory transport pair created");
        (a, b)
    }

    fn new(
        outbound: mpsc::UnboundedSender<Vec<u8>>,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            id: TransportId::next(),
            closed: AtomicBool::new(false),
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(Some(inbound)),
            partner: Mutex::new(Weak::new()),
            events: Observer::new(),
        }
    }

    /// Delivers inbound frames as [`TransportEvent::Message`] until the
    /// pair is closed. Returns immediately if already running or run.
    pub async fn run(&self) -> Result<(), TransportError> {
        let inbound = self.inbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(mut inbound) = inbound else {
            return Ok(());
        };

        while let Some(frame) = inbound.recv().await {
            if self.is_closed() {
                break;
            }
            dispatch_frame(self.id, &self.events, &frame);
        }

        self.close();
        Ok(())
    }
}

impl Transport for MemoryTransport {
    fn send(&self, data: Vec<u8>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed(self.id));
        }
        let outbound = self.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx
                .send(data)
                .map_err(|_| TransportError::ConnectionClosed(self.id)),
            None => Err(TransportError::ConnectionClosed(self.id)),
        }
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        tracing::debug!(transport = %self.id, "close()");

        // Dropping the sender ends the partner's run loop.
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).take();
        let partner = self.partner.lock().unwrap_or_else(|e| e.into_inner()).upgrade();
        if let Some(partner) = partner {
            partner.close();
        }

        self.events.safe_emit(&TransportEvent::Close);
        self.events.remove_all_listeners();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn events(&self) -> &Observer<TransportEvent> {
        &self.events
    }

    fn id(&self) -> TransportId {
        self.id
    }
}
