//! Sliding-window set of recently seen packet hashes.
//!
//! One per peer. Entries expire after the configured window; the peer's
//! send task sweeps once per second.

use {
    crate::packet::HASH_LEN,
    std::{
        collections::HashMap,
        sync::Mutex,
        time::{Duration, Instant},
    },
};

/// Set of hashes keyed by insertion time.
pub struct TimestampPool {
    inner: Mutex<HashMap<[u8; HASH_LEN], Instant>>,
}

impl TimestampPool {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert (or refresh) a hash.
    pub fn put(&self, hash: [u8; HASH_LEN]) {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .insert(hash, Instant::now());
    }

    /// Whether a hash is currently in the window.
    pub fn contains(&self, hash: &[u8; HASH_LEN]) -> bool {
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .contains_key(hash)
    }

    /// Sweep entries inserted more than `secs` seconds ago.
    pub fn remove_before(&self, secs: u64) {
        let cutoff = Duration::from_secs(secs);
        let now = Instant::now();
        self.inner
            .lock()
            .expect("pool lock poisoned")
            .retain(|_, at| now.duration_since(*at) < cutoff);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TimestampPool {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_contains() {
        let pool = TimestampPool::new();
        let h = [1u8; HASH_LEN];
        assert!(!pool.contains(&h));
        pool.put(h);
        assert!(pool.contains(&h));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_remove_before_keeps_fresh_entries() {
        let pool = TimestampPool::new();
        pool.put([1u8; HASH_LEN]);
        pool.put([2u8; HASH_LEN]);
        // Everything was inserted just now; a 60s window keeps it all.
        pool.remove_before(60);
        assert_eq!(pool.len(), 2);
        // A zero-second window sweeps everything.
        pool.remove_before(0);
        assert!(pool.is_empty());
    }
}
