//! Core protocol types for Parley's wire format.
//!
//! Every message on the wire is one of three kinds: a request (expects
//! exactly one response), a response (answers a request by echoing its
//! `id`), or a notification (fire-and-forget). On the wire the kind is a
//! set of boolean flags; in Rust it is the [`Message`] enum, so a message
//! with zero or two kinds simply cannot be constructed.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::value::RawValue;

use crate::ProtocolError;

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Opaque, pre-encoded JSON carried in the `data` field of a message.
///
/// The protocol never looks inside a payload. It is kept as raw JSON text
/// (`serde_json::value::RawValue`) so that forwarding a payload does not
/// reorder keys or change number formatting: what the remote sent is
/// exactly what the application reads.
///
/// An empty payload means the `data` field is omitted on the wire.
#[derive(Clone, Default)]
pub struct Payload(Option<Box<RawValue>>);

impl Payload {
    /// A payload with no data.
    pub fn empty() -> Self {
        Self(None)
    }

    /// Serializes `value` into a payload.
    ///
    /// A value that serializes to JSON `null` (e.g. `()` or `None`)
    /// becomes the empty payload, so it is omitted on the wire.
    pub fn new<T: Serialize + ?Sized>(value: &T) -> Result<Self, ProtocolError> {
        let raw = serde_json::value::to_raw_value(value).map_err(ProtocolError::Encode)?;
        if raw.get() == "null" {
            return Ok(Self(None));
        }
        Ok(Self(Some(raw)))
    }

    /// Wraps JSON text that has already been encoded elsewhere.
    ///
    /// # Errors
    /// Returns [`ProtocolError::Payload`] if `json` is not valid JSON.
    pub fn from_json(json: impl Into<String>) -> Result<Self, ProtocolError> {
        RawValue::from_string(json.into())
            .map(|raw| Self::from_raw(Some(raw)))
            .map_err(ProtocolError::Payload)
    }

    pub(crate) fn from_raw(raw: Option<Box<RawValue>>) -> Self {
        match raw {
            Some(raw) if raw.get() == "null" => Self(None),
            other => Self(other),
        }
    }

    pub(crate) fn into_raw(self) -> Option<Box<RawValue>> {
        self.0
    }

    /// Returns `true` if there is no data.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The raw JSON text, if any.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref().map(RawValue::get)
    }

    /// Decodes the payload into `T`.
    ///
    /// An empty payload decodes as JSON `null`, which works for `()`,
    /// `Option<_>` and other types that accept null.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_str(self.as_str().unwrap_or("null")).map_err(ProtocolError::Payload)
    }
}

/// Serializes as the raw JSON it holds (`null` when empty), so a
/// received payload can be forwarded without decoding it.
impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.0 {
            Some(raw) => raw.serialize(serializer),
            None => serializer.serialize_unit(),
        }
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(json) => write!(f, "Payload({json})"),
            None => f.write_str("Payload(<empty>)"),
        }
    }
}

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// An application-level error carried by a failed response.
///
/// `code` and `reason` travel verbatim as `errorCode` / `errorReason`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {reason}")]
pub struct RemoteError {
    /// Numeric error code, chosen by the application.
    pub code: i32,
    /// Human-readable reason.
    pub reason: String,
}

impl RemoteError {
    /// Code used when an error has no `{code, reason}` shape of its own.
    pub const INTERNAL: i32 = 500;

    /// Creates an error with an explicit code.
    pub fn new(code: i32, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Wraps any displayable error with the generic server-error code.
    pub fn internal(error: impl fmt::Display) -> Self {
        Self::new(Self::INTERNAL, error.to_string())
    }
}

impl From<String> for RemoteError {
    fn from(reason: String) -> Self {
        Self::new(Self::INTERNAL, reason)
    }
}

impl From<&str> for RemoteError {
    fn from(reason: &str) -> Self {
        Self::new(Self::INTERNAL, reason)
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A correlated call that expects exactly one [`Response`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation id, never zero.
    pub id: u32,
    /// The method being invoked.
    pub method: String,
    /// Request body.
    pub data: Payload,
}

/// The answer to a [`Request`], matched to it by `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// The id of the request being answered.
    pub id: u32,
    /// `Ok` for `ok: true` responses, `Err` for failed ones.
    pub result: Result<Payload, RemoteError>,
}

impl Response {
    /// Returns `true` for a successful response.
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// A fire-and-forget message. There is no reply path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The event being announced.
    pub method: String,
    /// Notification body.
    pub data: Payload,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    /// Builds a request with an explicit id.
    ///
    /// Most callers want [`MessageFactory::request`](crate::MessageFactory::request),
    /// which draws the id for them.
    pub fn request(id: u32, method: impl Into<String>, data: Payload) -> Self {
        Self::Request(Request {
            id,
            method: method.into(),
            data,
        })
    }

    /// Builds an `ok: true` response echoing `request_id`.
    pub fn success_response(request_id: u32, data: Payload) -> Self {
        Self::Response(Response {
            id: request_id,
            result: Ok(data),
        })
    }

    /// Builds an `ok: false` response echoing `request_id`.
    pub fn error_response(request_id: u32, error: RemoteError) -> Self {
        Self::Response(Response {
            id: request_id,
            result: Err(error),
        })
    }

    /// Builds a notification.
    pub fn notification(method: impl Into<String>, data: Payload) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            data,
        })
    }

    /// The correlation id. Notifications have none.
    pub fn id(&self) -> Option<u32> {
        match self {
            Self::Request(r) => Some(r.id),
            Self::Response(r) => Some(r.id),
            Self::Notification(_) => None,
        }
    }

    /// The method name. Responses have none.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Response(_) => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request(r) => write!(f, "request#{} {}", r.id, r.method),
            Self::Response(r) => match &r.result {
                Ok(_) => write!(f, "response#{} ok", r.id),
                Err(e) => write!(f, "response#{} error {e}", r.id),
            },
            Self::Notification(n) => write!(f, "notification {}", n.method),
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

// ---------------------------------------------------------------------------
// Wire form
// ---------------------------------------------------------------------------

/// The flat, flag-based envelope exactly as it appears in JSON.
///
/// Every field is omitted when false, zero, or empty, which keeps the
/// envelope compact: a notification is just
/// `{"notification":true,"method":"...","data":...}`.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct WireMessage {
    #[serde(default, skip_serializing_if = "is_false")]
    ok: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    request: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    response: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    notification: bool,
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Box<RawValue>>,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    error_code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    error_reason: String,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

fn is_zero_i32(value: &i32) -> bool {
    *value == 0
}

impl From<Message> for WireMessage {
    fn from(message: Message) -> Self {
        match message {
            Message::Request(r) => Self {
                request: true,
                id: r.id,
                method: r.method,
                data: r.data.into_raw(),
                ..Self::default()
            },
            Message::Response(r) => match r.result {
                Ok(data) => Self {
                    response: true,
                    ok: true,
                    id: r.id,
                    data: data.into_raw(),
                    ..Self::default()
                },
                Err(error) => Self {
                    response: true,
                    id: r.id,
                    error_code: error.code,
                    error_reason: error.reason,
                    ..Self::default()
                },
            },
            Message::Notification(n) => Self {
                notification: true,
                method: n.method,
                data: n.data.into_raw(),
                ..Self::default()
            },
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = ProtocolError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let kinds = [wire.request, wire.response, wire.notification]
            .iter()
            .filter(|flag| **flag)
            .count();
        if kinds != 1 {
            return Err(ProtocolError::InvalidMessage(format!(
                "expected exactly one of request/response/notification, found {kinds}"
            )));
        }

        if wire.request {
            if wire.id == 0 {
                return Err(ProtocolError::InvalidMessage("request without id".into()));
            }
            if wire.method.is_empty() {
                return Err(ProtocolError::InvalidMessage("request without method".into()));
            }
            return Ok(Self::request(wire.id, wire.method, Payload::from_raw(wire.data)));
        }

        if wire.response {
            if wire.id == 0 {
                return Err(ProtocolError::InvalidMessage("response without id".into()));
            }
            let result = if wire.ok {
                Ok(Payload::from_raw(wire.data))
            } else {
                Err(RemoteError::new(wire.error_code, wire.error_reason))
            };
            return Ok(Self::Response(Response {
                id: wire.id,
                result,
            }));
        }

        if wire.method.is_empty() {
            return Err(ProtocolError::InvalidMessage("notification without method".into()));
        }
        Ok(Self::notification(wire.method, Payload::from_raw(wire.data)))
    }
}
