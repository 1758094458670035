//! The broker's process-global pairing state, modeled as an owned,
//! cloneable value (not a `static`) so the broker stays testable
//! in-process with independent registries per test.
//!
//! Holds the global peer map (`peer_id` → the two sessions it pairs)
//! and the `type → (hub_id → session)` directory, both `DashMap`-backed
//! following the reference broker's `RelayState` pattern.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use super::protocol::SessionProtocol;

/// `{service_session, user_session, peer_id}` — lives in the global map
/// keyed by `peer_id`, and is also indexed from each session's local
/// peer set (P1). Both Arcs are cheap clones of the owning sessions.
#[derive(Clone)]
pub struct PeerRecord {
    pub service: Arc<SessionProtocol>,
    pub user: Arc<SessionProtocol>,
}

#[derive(Clone)]
pub struct Registry {
    peers: Arc<DashMap<String, PeerRecord>>,
    services: Arc<DashMap<String, Arc<SessionProtocol>>>,
    users: Arc<DashMap<String, Arc<SessionProtocol>>>,
    // Guards the critical section spanning the global peer map *and* both
    // sessions' local peer sets (P1/P2), mirroring the single mutex the
    // reference broker holds across its map delete and both per-session
    // deletes. `DashMap`'s own per-shard locking isn't enough on its own:
    // it only protects `peers` from itself, not from disagreeing with the
    // local sets at a point another task can observe.
    peer_lock: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            services: Arc::new(DashMap::new()),
            users: Arc::new(DashMap::new()),
            peer_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn register_service(&self, hub_id: &str, session: Arc<SessionProtocol>) {
        self.services.insert(hub_id.to_string(), session);
    }

    pub fn register_user(&self, hub_id: &str, session: Arc<SessionProtocol>) {
        self.users.insert(hub_id.to_string(), session);
    }

    pub fn unregister_service(&self, hub_id: &str) {
        self.services.remove(hub_id);
    }

    pub fn unregister_user(&self, hub_id: &str) {
        self.users.remove(hub_id);
    }

    pub fn services(&self) -> Vec<Arc<SessionProtocol>> {
        self.services.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn users(&self) -> Vec<Arc<SessionProtocol>> {
        self.users.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Inserts the peer into the global map and both sessions' local
    /// sets as one critical section (P1). Lock order within that section
    /// is service before user, matching every other site that locks both
    /// sides of a pair.
    pub fn insert_peer(&self, peer_id: &str, record: PeerRecord) {
        let _guard = self.peer_lock.lock().unwrap();
        {
            let mut service_peers = record.service.peer_ids.lock().unwrap();
            let mut user_peers = record.user.peer_ids.lock().unwrap();
            service_peers.insert(peer_id.to_string());
            user_peers.insert(peer_id.to_string());
        }
        self.peers.insert(peer_id.to_string(), record);
    }

    pub fn get_peer(&self, peer_id: &str) -> Option<PeerRecord> {
        self.peers.get(peer_id).map(|e| e.value().clone())
    }

    /// Atomically removes the peer from the global map and both
    /// sessions' local sets as one critical section (P2) — no other
    /// operation can observe the map and the local sets disagreeing.
    pub fn remove_peer(&self, peer_id: &str) -> Option<PeerRecord> {
        let _guard = self.peer_lock.lock().unwrap();
        let record = self.peers.remove(peer_id).map(|(_, v)| v)?;
        {
            let mut service_peers = record.service.peer_ids.lock().unwrap();
            let mut user_peers = record.user.peer_ids.lock().unwrap();
            service_peers.remove(peer_id);
            user_peers.remove(peer_id);
        }
        Some(record)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_map_starts_empty() {
        let registry = Registry::new();
        assert_eq!(registry.peer_count(), 0);
        assert!(registry.get_peer("missing").is_none());
    }
}
