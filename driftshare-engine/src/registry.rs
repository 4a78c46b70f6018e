use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tracked state of one remote device offering the service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: String,
    pub display_name: String,
    pub service_port: u16,
    /// Set on first sighting and never changed.
    pub first_seen: Instant,
    /// Refreshed by every successful probe. Never earlier than `first_seen`.
    pub last_seen: Instant,
}

impl PeerRecord {
    /// Time since the last successful probe, as of `now`.
    #[must_use]
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// The authoritative set of known peers, keyed by address.
///
/// Every method takes the lock once and releases it before returning; no
/// invariant spans two calls.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerRecord>>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a sighting of `address` at `now`.
    ///
    /// Returns `true` when the address was not known before. For a known
    /// address the name and port are refreshed and `last_seen` moves to
    /// `now` (never backwards).
    pub fn upsert(&self, address: &str, display_name: &str, port: u16, now: Instant) -> bool {
        let mut peers = self.peers.lock();
        match peers.get_mut(address) {
            Some(record) => {
                record.display_name = display_name.to_owned();
                record.service_port = port;
                record.last_seen = record.last_seen.max(now);
                false
            }
            None => {
                peers.insert(
                    address.to_owned(),
                    PeerRecord {
                        address: address.to_owned(),
                        display_name: display_name.to_owned(),
                        service_port: port,
                        first_seen: now,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Moves `last_seen` of a known peer to `now`. Returns `false` for an
    /// unknown address.
    pub fn touch(&self, address: &str, now: Instant) -> bool {
        let mut peers = self.peers.lock();
        match peers.get_mut(address) {
            Some(record) => {
                record.last_seen = record.last_seen.max(now);
                true
            }
            None => false,
        }
    }

    /// Peers seen less than `visibility_window` before `now`, sorted by
    /// address.
    #[must_use]
    pub fn active_peers(&self, now: Instant, visibility_window: Duration) -> Vec<PeerRecord> {
        let peers = self.peers.lock();
        let mut active: Vec<PeerRecord> = peers
            .values()
            .filter(|p| p.idle(now) < visibility_window)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.address.cmp(&b.address));
        active
    }

    /// Removes and returns every peer idle for longer than `eviction_timeout`.
    pub fn evict_stale(&self, now: Instant, eviction_timeout: Duration) -> Vec<PeerRecord> {
        let mut peers = self.peers.lock();
        let stale: Vec<String> = peers
            .values()
            .filter(|p| p.idle(now) > eviction_timeout)
            .map(|p| p.address.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|address| peers.remove(&address))
            .collect()
    }

    /// Removes a single peer regardless of its age.
    pub fn remove(&self, address: &str) -> Option<PeerRecord> {
        self.peers.lock().remove(address)
    }

    #[must_use]
    pub fn get(&self, address: &str) -> Option<PeerRecord> {
        self.peers.lock().get(address).cloned()
    }

    /// Addresses of every tracked peer, visible or not.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }
}
