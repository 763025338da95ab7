//! Connection locks.
//!
//! A service that relies on a connection to a peer locks it; an idle
//! connection may be disconnected only once no lock of any kind remains.
//!
//! - local: taken by a local service, mirrored to the peer
//! - remote: taken by the peer's services
//! - weak: local only, never announced

use std::collections::{HashMap, HashSet};

use peerlink_types::NodeId;

#[derive(Debug, Default)]
pub struct ConnectionLocker {
    local: HashMap<NodeId, HashSet<String>>,
    remote: HashMap<NodeId, HashSet<String>>,
    weak: HashMap<NodeId, HashSet<String>>,
}

fn insert(map: &mut HashMap<NodeId, HashSet<String>>, peer: NodeId, lock_id: &str) -> bool {
    map.entry(peer).or_default().insert(lock_id.to_string())
}

fn remove(map: &mut HashMap<NodeId, HashSet<String>>, peer: &NodeId, lock_id: &str) -> bool {
    let Some(locks) = map.get_mut(peer) else {
        return false;
    };
    let removed = locks.remove(lock_id);
    if locks.is_empty() {
        map.remove(peer);
    }
    removed
}

fn holds(map: &HashMap<NodeId, HashSet<String>>, peer: &NodeId, lock_id: Option<&str>) -> bool {
    match (map.get(peer), lock_id) {
        (Some(locks), Some(id)) => locks.contains(id),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl ConnectionLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the lock is new.
    pub fn lock_local(&mut self, peer: NodeId, lock_id: &str) -> bool {
        insert(&mut self.local, peer, lock_id)
    }

    pub fn unlock_local(&mut self, peer: &NodeId, lock_id: &str) -> bool {
        remove(&mut self.local, peer, lock_id)
    }

    pub fn lock_remote(&mut self, peer: NodeId, lock_id: &str) -> bool {
        insert(&mut self.remote, peer, lock_id)
    }

    pub fn unlock_remote(&mut self, peer: &NodeId, lock_id: &str) -> bool {
        remove(&mut self.remote, peer, lock_id)
    }

    pub fn weak_lock(&mut self, peer: NodeId, lock_id: &str) -> bool {
        insert(&mut self.weak, peer, lock_id)
    }

    pub fn weak_unlock(&mut self, peer: &NodeId, lock_id: &str) -> bool {
        remove(&mut self.weak, peer, lock_id)
    }

    pub fn has_local_lock(&self, peer: &NodeId, lock_id: Option<&str>) -> bool {
        holds(&self.local, peer, lock_id)
    }

    pub fn has_remote_lock(&self, peer: &NodeId, lock_id: Option<&str>) -> bool {
        holds(&self.remote, peer, lock_id)
    }

    pub fn has_weak_lock(&self, peer: &NodeId, lock_id: Option<&str>) -> bool {
        holds(&self.weak, peer, lock_id)
    }

    pub fn is_locked(&self, peer: &NodeId) -> bool {
        self.local.contains_key(peer) || self.remote.contains_key(peer) || self.weak.contains_key(peer)
    }

    pub fn clear_remote(&mut self, peer: &NodeId) {
        self.remote.remove(peer);
    }

    /// Forget every lock for `peer`.
    pub fn clear(&mut self, peer: &NodeId) {
        self.local.remove(peer);
        self.remote.remove(peer);
        self.weak.remove(peer);
    }

    /// Number of peers holding at least one lock.
    pub fn locked_count(&self) -> usize {
        let mut peers: HashSet<&NodeId> = self.local.keys().collect();
        peers.extend(self.remote.keys());
        peers.extend(self.weak.keys());
        peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_stays_locked_until_every_lock_is_released() {
        let peer = NodeId::random();
        let mut locker = ConnectionLocker::new();
        assert!(locker.lock_local(peer, "dht"));
        assert!(!locker.lock_local(peer, "dht"));
        locker.lock_remote(peer, "stream");

        locker.unlock_local(&peer, "dht");
        assert!(locker.is_locked(&peer));
        assert!(locker.has_remote_lock(&peer, Some("stream")));
        assert!(!locker.has_local_lock(&peer, None));

        locker.unlock_remote(&peer, "stream");
        assert!(!locker.is_locked(&peer));
        assert_eq!(locker.locked_count(), 0);
    }

    #[test]
    fn test_weak_locks_count_and_clear() {
        let a = NodeId::random();
        let b = NodeId::random();
        let mut locker = ConnectionLocker::new();
        locker.weak_lock(a, "probe");
        locker.lock_local(a, "dht");
        locker.lock_remote(b, "dht");
        assert_eq!(locker.locked_count(), 2);

        locker.clear(&a);
        assert!(!locker.is_locked(&a));
        assert_eq!(locker.locked_count(), 1);
    }
}
