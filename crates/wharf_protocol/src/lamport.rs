//! Per-replica logical time.
//!
//! Encrypted updates are ordered by `(counter, clientId)` within a snapshot;
//! the clock ticks on every local action and advances past any observed peer
//! timestamp on receive.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A Lamport timestamp `(clientId, counter)`.
///
/// The total order compares counters first and breaks ties on client id, so
/// two replicas never disagree about the order of any pair of timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LamportTimestamp {
    pub client_id: u32,
    pub counter: u64,
}

impl LamportTimestamp {
    pub fn new(client_id: u32, counter: u64) -> Self {
        Self { client_id, counter }
    }
}

impl Ord for LamportTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.counter
            .cmp(&other.counter)
            .then(self.client_id.cmp(&other.client_id))
    }
}

impl PartialOrd for LamportTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for LamportTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.client_id, self.counter)
    }
}

/// Per-replica Lamport clock.
#[derive(Debug, Clone)]
pub struct LamportClock {
    client_id: u32,
    counter: u64,
}

impl LamportClock {
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            counter: 0,
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    /// Advance local time and return the new timestamp.
    pub fn tick(&mut self) -> LamportTimestamp {
        self.counter += 1;
        LamportTimestamp::new(self.client_id, self.counter)
    }

    /// Fold in an observed peer timestamp so the next local tick sorts
    /// after everything seen so far.
    pub fn receive(&mut self, observed: LamportTimestamp) {
        self.counter = self.counter.max(observed.counter);
    }

    /// Reset to zero; used when a new snapshot generation begins.
    pub fn reset(&mut self) {
        self.counter = 0;
    }
}
