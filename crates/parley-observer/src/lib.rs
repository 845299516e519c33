//! Thread-safe event observer for Parley.
//!
//! Peers, rooms, and transports each hold an [`Observer`] and announce
//! what happens to them through it (an inbound request, a notification,
//! closure). Application code subscribes with [`Observer::on`].
//!
//! Handlers are invoked *outside* the observer's lock, so a handler may
//! subscribe, unsubscribe, or emit again without deadlocking. With
//! [`Observer::safe_emit`] a panicking handler is logged and skipped; the
//! emitter and the remaining handlers carry on.

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// An event that can be published through an [`Observer`].
///
/// `Kind` plays the role of the event name: handlers subscribe to a kind
/// and receive every event of that kind.
pub trait Event: Send + Sync + 'static {
    /// The discriminant handlers subscribe to.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Returns this event's kind.
    fn kind(&self) -> Self::Kind;
}

/// Handle returned by [`Observer::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E: Event> {
    id: ListenerId,
    kind: E::Kind,
    handler: Handler<E>,
}

/// A registry of event handlers.
pub struct Observer<E: Event> {
    /// Kept in registration order; handlers run in that order.
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

impl<E: Event> Observer<E> {
    /// Creates an observer with no listeners.
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<Listener<E>>> {
        // Handlers never run under this lock, so poisoning can only come
        // from a panic inside Vec itself; the list is still usable.
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribes `handler` to every event of `kind`.
    pub fn on<F>(&self, kind: E::Kind, handler: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners().push(Listener {
            id,
            kind,
            handler: Arc::new(handler),
        });
        id
    }

    /// Unsubscribes a handler. Returns `false` if it was already gone.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|l| l.id != id);
        listeners.len() != before
    }

    /// Drops every handler.
    pub fn remove_all_listeners(&self) {
        self.listeners().clear();
    }

    /// Number of handlers subscribed to `kind`.
    pub fn listener_count(&self, kind: E::Kind) -> usize {
        self.listeners().iter().filter(|l| l.kind == kind).count()
    }

    fn handlers_for(&self, kind: E::Kind) -> Vec<Handler<E>> {
        self.listeners()
            .iter()
            .filter(|l| l.kind == kind)
            .map(|l| Arc::clone(&l.handler))
            .collect()
    }

    /// Invokes every handler subscribed to the event's kind and returns
    /// how many ran. A panicking handler unwinds into the caller.
    pub fn emit(&self, event: &E) -> usize {
        let handlers = self.handlers_for(event.kind());
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    /// Like [`emit`](Self::emit), but a panicking handler is caught and
    /// logged. Returns how many handlers completed without panicking.
    pub fn safe_emit(&self, event: &E) -> usize {
        let kind = event.kind();
        let mut completed = 0;
        for handler in self.handlers_for(kind) {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(()) => completed += 1,
                Err(panic) => {
                    tracing::error!(
                        event = ?kind,
                        panic = panic_message(panic.as_ref()),
                        "event listener panicked"
                    );
                }
            }
        }
        completed
    }
}

impl<E: Event> Default for Observer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Event> fmt::Debug for Observer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observer")
            .field("listeners", &self.listeners().len())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic>"
    }
}
