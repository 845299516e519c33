//! Peer and room configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`Peer`](crate::Peer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// How long a lone request waits for its response.
    pub request_timeout: Duration,

    /// Extra wait granted per request already pending when a new one is
    /// sent. A peer under heavy concurrent load answers more slowly; the
    /// extra budget keeps those slow answers from turning into timeouts.
    pub timeout_per_pending: Duration,
}

impl PeerConfig {
    /// The timeout for a request sent while `pending` others are in flight.
    pub fn timeout_for(&self, pending: usize) -> Duration {
        let pending = u32::try_from(pending).unwrap_or(u32::MAX);
        self.request_timeout
            .saturating_add(self.timeout_per_pending.saturating_mul(pending))
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(15),
            timeout_per_pending: Duration::from_millis(150),
        }
    }
}

/// Configuration for a [`Room`](crate::Room).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomConfig {
    /// Applied to every peer the room creates.
    pub peer: PeerConfig,
}
