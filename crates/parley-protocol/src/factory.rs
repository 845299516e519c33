//! Message construction with fresh request ids.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::{IdSource, Message, Payload, ProtocolError, RandomIds, Request};

/// Builds outbound requests and notifications, drawing request ids from
/// an injected [`IdSource`].
///
/// Responses need no factory: they echo the id of the request they answer
/// (see [`Message::success_response`] and [`Message::error_response`]).
///
/// Cheap to clone: clones share the same id source.
#[derive(Clone)]
pub struct MessageFactory {
    ids: Arc<dyn IdSource>,
}

impl MessageFactory {
    /// A factory drawing ids from `ids`.
    pub fn new(ids: Arc<dyn IdSource>) -> Self {
        Self { ids }
    }

    /// Draws a fresh request id.
    pub fn next_id(&self) -> u32 {
        self.ids.next_id()
    }

    /// Builds a request with a fresh id, serializing `data` as its body.
    ///
    /// Returned as a [`Request`] so the caller can read or redraw the id
    /// before sending; it converts into a [`Message`] with `into`.
    pub fn request<T: Serialize + ?Sized>(
        &self,
        method: &str,
        data: &T,
    ) -> Result<Request, ProtocolError> {
        let data = Payload::new(data)?;
        Ok(Request {
            id: self.next_id(),
            method: method.to_owned(),
            data,
        })
    }

    /// Builds a notification. No id is drawn.
    pub fn notification<T: Serialize + ?Sized>(
        &self,
        method: &str,
        data: &T,
    ) -> Result<Message, ProtocolError> {
        Ok(Message::notification(method, Payload::new(data)?))
    }
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new(Arc::new(RandomIds::new()))
    }
}

impl fmt::Debug for MessageFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageFactory").finish_non_exhaustive()
    }
}
