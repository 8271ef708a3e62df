//! Outstanding ping bookkeeping.

use std::collections::HashMap;
use tokio::time::Instant;

use crate::wire::CorrelationId;

/// A ping awaiting its pong.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingPing {
    /// Local send time carried by the ping
    pub t0: f64,
    /// When the id is retired if no pong arrived
    pub deadline: Instant,
}

/// Ids of pings in flight towards one peer.
///
/// An id is unique among outstanding pings and becomes reusable once its
/// round trip completes or times out.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    next: CorrelationId,
    pending: HashMap<CorrelationId, PendingPing>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ping sent at `t0` and return its id.
    pub fn issue(&mut self, t0: f64, deadline: Instant) -> CorrelationId {
        let mut id = self.next;
        while self.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next = id.wrapping_add(1);
        self.pending.insert(id, PendingPing { t0, deadline });
        id
    }

    /// Retire `id` on pong arrival. `None` for unknown or already retired ids.
    pub fn complete(&mut self, id: CorrelationId) -> Option<PendingPing> {
        self.pending.remove(&id)
    }

    /// Retire `id` only if it was issued with origin time `t0`.
    pub fn complete_matching(&mut self, id: CorrelationId, t0: f64) -> Option<PendingPing> {
        match self.pending.get(&id) {
            Some(ping) if ping.t0.to_bits() == t0.to_bits() => self.pending.remove(&id),
            _ => None,
        }
    }

    /// Retire every ping whose deadline has passed; returns how many.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, ping| ping.deadline > now);
        before - self.pending.len()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|ping| ping.deadline).min()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
