//! Request id sources.
//!
//! A peer may have many requests in flight at once, and each response is
//! matched to its request by id alone. Ids are drawn from the full `u32`
//! space so concurrent requests practically never collide; the peer
//! still re-draws on the rare collision with a live id.
//!
//! Zero is reserved: on the wire it means "no id".

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Produces request ids.
pub trait IdSource: Send + Sync + 'static {
    /// Returns the next id. Must never be zero.
    fn next_id(&self) -> u32;
}

/// Uniformly random ids from a private generator.
///
/// Each instance owns its own RNG, so there is no process-wide state and
/// tests can pin the sequence with [`RandomIds::seeded`].
#[derive(Debug)]
pub struct RandomIds {
    rng: Mutex<StdRng>,
}

impl RandomIds {
    /// A generator seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// A generator with a fixed seed, for reproducible sequences.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for RandomIds {
    fn next_id(&self) -> u32 {
        // A poisoned RNG is still a valid RNG.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            let id: u32 = rng.random();
            if id != 0 {
                return id;
            }
        }
    }
}

/// Monotonically increasing ids, wrapping past `u32::MAX` back to 1.
///
/// Predictable, so only suitable for tests and local tooling.
#[derive(Debug)]
pub struct SequentialIds {
    next: AtomicU32,
}

impl SequentialIds {
    /// Starts the sequence at `start` (zero is bumped to one).
    pub fn starting_at(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start.max(1)),
        }
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> u32 {
        loop {
            let id = self.next.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }
}
