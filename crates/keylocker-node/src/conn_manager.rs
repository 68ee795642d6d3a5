use std::collections::HashMap;
use std::time::{Duration, Instant};

use libp2p::PeerId;

/// Watermark connection manager.
///
/// When more than `high` peers are connected, `trim` selects the oldest
/// connections outside the grace period until `low` remain. Peers connected
/// less than `grace` ago are never selected, so a trim may stop above `low`.
pub struct ConnManager {
    low: usize,
    high: usize,
    grace: Duration,
    /// Peer to time of its first live connection.
    connected: HashMap<PeerId, Instant>,
}

impl ConnManager {
    pub fn new(low: usize, high: usize, grace: Duration) -> Self {
        Self { low, high, grace, connected: HashMap::new() }
    }

    pub fn connected(&mut self, peer: PeerId, now: Instant) {
        self.connected.entry(peer).or_insert(now);
    }

    /// Call once the peer has no live connection left.
    pub fn disconnected(&mut self, peer: &PeerId) {
        self.connected.remove(peer);
    }

    pub fn len(&self) -> usize {
        self.connected.len()
    }

    /// Peers to disconnect now. Selected peers are forgotten immediately.
    pub fn trim(&mut self, now: Instant) -> Vec<PeerId> {
        if self.connected.len() <= self.high {
            return Vec::new();
        }

        let mut candidates: Vec<(PeerId, Instant)> = self
            .connected
            .iter()
            .filter(|(_, since)| now.saturating_duration_since(**since) >= self.grace)
            .map(|(p, since)| (*p, *since))
            .collect();
        candidates.sort_by_key(|(_, since)| *since);

        let excess = self.connected.len() - self.low;
        let victims: Vec<PeerId> = candidates.into_iter().take(excess).map(|(p, _)| p).collect();
        for peer in &victims {
            self.connected.remove(peer);
        }
        victims
    }
}
