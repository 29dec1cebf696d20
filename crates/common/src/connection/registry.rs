//! One connection per (share, peer) pair.
//!
//! Discovery can learn about the same peer from several sources at once,
//! and both nodes may dial each other simultaneously. The registry is the
//! node-wide arbiter: a new attempt is admitted only if no live connection
//! (or in-flight attempt) already exists for the pair. Liveness of an
//! established connection is judged by its ping deadline, so a hung socket
//! does not block reconnection forever.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

enum Entry {
    Connecting,
    Connected { timeout_at: Arc<Mutex<Instant>> },
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<(String, String), Entry>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the (share, peer) slot for a new attempt. Returns false if a
    /// live connection or attempt already holds it.
    pub fn begin(&self, share_id: &str, peer_id: &str) -> bool {
        let key = (share_id.to_string(), peer_id.to_string());
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(Entry::Connecting) => false,
            Some(Entry::Connected { timeout_at }) => {
                if Instant::now() < *timeout_at.lock() {
                    false
                } else {
                    // Stale connection that stopped answering pings.
                    entries.insert(key, Entry::Connecting);
                    true
                }
            }
            None => {
                entries.insert(key, Entry::Connecting);
                true
            }
        }
    }

    /// Promote an attempt to an established connection. `timeout_at` is the
    /// session's live ping deadline, shared with its receive loop.
    pub fn connected(&self, share_id: &str, peer_id: &str, timeout_at: Arc<Mutex<Instant>>) {
        self.entries.lock().insert(
            (share_id.to_string(), peer_id.to_string()),
            Entry::Connected { timeout_at },
        );
    }

    /// Release the slot.
    pub fn disconnected(&self, share_id: &str, peer_id: &str) {
        self.entries
            .lock()
            .remove(&(share_id.to_string(), peer_id.to_string()));
    }

    /// Is a live connection (or attempt) holding this slot?
    pub fn is_active(&self, share_id: &str, peer_id: &str) -> bool {
        let entries = self.entries.lock();
        match entries.get(&(share_id.to_string(), peer_id.to_string())) {
            None => false,
            Some(Entry::Connecting) => true,
            Some(Entry::Connected { timeout_at }) => Instant::now() < *timeout_at.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn second_attempt_for_same_pair_is_refused() {
        let registry = ConnectionRegistry::new();
        assert!(registry.begin("s1", "p1"));
        assert!(!registry.begin("s1", "p1"));
        assert!(registry.begin("s1", "p2"));
        assert!(registry.begin("s2", "p1"));
    }

    #[test]
    fn disconnect_frees_the_slot() {
        let registry = ConnectionRegistry::new();
        assert!(registry.begin("s1", "p1"));
        registry.disconnected("s1", "p1");
        assert!(registry.begin("s1", "p1"));
    }

    #[test]
    fn expired_ping_deadline_allows_replacement() {
        let registry = ConnectionRegistry::new();
        assert!(registry.begin("s1", "p1"));
        let deadline = Arc::new(Mutex::new(Instant::now() - Duration::from_secs(1)));
        registry.connected("s1", "p1", deadline.clone());
        assert!(!registry.is_active("s1", "p1"));
        assert!(registry.begin("s1", "p1"));

        // A refreshed deadline keeps the slot held.
        let registry = ConnectionRegistry::new();
        assert!(registry.begin("s1", "p1"));
        let deadline = Arc::new(Mutex::new(Instant::now() + Duration::from_secs(60)));
        registry.connected("s1", "p1", deadline);
        assert!(registry.is_active("s1", "p1"));
        assert!(!registry.begin("s1", "p1"));
    }
}
