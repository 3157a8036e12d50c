//! Replay protection: remembers `(node, nonce)` pairs for a fixed TTL.

use std::collections::HashMap;

use parking_lot::Mutex;

/// Nonces seen per node, with the epoch at which each was first seen.
///
/// A single lock guards the whole store; check and insert happen under it,
/// so two concurrent requests carrying the same nonce cannot both pass.
#[derive(Debug)]
pub struct NonceCache {
    ttl_sec: i64,
    seen: Mutex<HashMap<String, HashMap<String, i64>>>,
}

impl NonceCache {
    pub fn new(ttl_sec: u64) -> Self {
        Self {
            ttl_sec: i64::try_from(ttl_sec).unwrap_or(i64::MAX),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `nonce` for `node_id` at `now_epoch`.
    ///
    /// Returns `false` if the pair was already recorded within the TTL.
    /// Expired entries are evicted for every node on the way, and nodes left
    /// with nothing are dropped, so ids that never return do not accumulate.
    pub fn check_and_record(&self, node_id: &str, nonce: &str, now_epoch: i64) -> bool {
        let mut seen = self.seen.lock();
        let ttl = self.ttl_sec;
        seen.retain(|_, per_node| {
            per_node.retain(|_, first_seen| now_epoch - *first_seen <= ttl);
            !per_node.is_empty()
        });
        let per_node = seen.entry(node_id.to_string()).or_default();
        if per_node.contains_key(nonce) {
            return false;
        }
        per_node.insert(nonce.to_string(), now_epoch);
        true
    }

    /// Entries currently held for `node_id`, expired or not.
    pub fn len_for(&self, node_id: &str) -> usize {
        self.seen.lock().get(node_id).map_or(0, HashMap::len)
    }

    /// Number of nodes with at least one remembered nonce.
    pub fn node_count(&self) -> usize {
        self.seen.lock().len()
    }
}
