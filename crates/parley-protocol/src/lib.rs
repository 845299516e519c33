//! Wire protocol for Parley.
//!
//! This crate defines what two Parley endpoints say to each other:
//!
//! - **Types** ([`Message`], [`Request`], [`Response`], [`Notification`],
//!   [`Payload`], [`RemoteError`]) — the envelope and its three kinds.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) — how messages become
//!   bytes and back.
//! - **Construction** ([`MessageFactory`], [`IdSource`]) — building
//!   requests with fresh correlation ids.
//! - **Errors** ([`ProtocolError`]).
//!
//! The protocol layer knows nothing about connections, peers, or rooms.
//!
//! ```text
//! Transport (bytes) → Protocol (Message) → Peer (correlation)
//! ```

mod codec;
mod error;
mod factory;
mod ids;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use factory::MessageFactory;
pub use ids::{IdSource, RandomIds, SequentialIds};
pub use types::{Message, Notification, Payload, RemoteError, Request, Response};
