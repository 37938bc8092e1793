//! Bounded multi-level priority send queue.
//!
//! One per peer. Each priority level is an independent bounded FIFO;
//! `pop` drains the most urgent non-empty level first, and `wait` parks
//! the send task until something is enqueued.

use {
    crate::packet::Packet,
    std::{collections::VecDeque, sync::Mutex},
    tokio::sync::Notify,
};

/// Bounded multi-level FIFO of outgoing packets.
pub struct PriorityQueue {
    levels: Mutex<Vec<VecDeque<Packet>>>,
    capacity_per_level: usize,
    notify: Notify,
}

impl PriorityQueue {
    /// Create a queue with `max_priority` levels (priorities
    /// `0..max_priority`, 0 most urgent) of `capacity_per_level` each.
    pub fn new(capacity_per_level: usize, max_priority: usize) -> Self {
        Self {
            levels: Mutex::new((0..max_priority).map(|_| VecDeque::new()).collect()),
            capacity_per_level,
            notify: Notify::new(),
        }
    }

    /// Enqueue at the given priority. Returns false when the priority is
    /// out of range or that level is full.
    pub fn push(&self, pkt: Packet, priority: usize) -> bool {
        {
            let mut levels = self.levels.lock().expect("queue lock poisoned");
            let Some(level) = levels.get_mut(priority) else {
                return false;
            };
            if level.len() >= self.capacity_per_level {
                return false;
            }
            level.push_back(pkt);
        }
        self.notify.notify_one();
        true
    }

    /// Dequeue from the most urgent non-empty level.
    pub fn pop(&self) -> Option<Packet> {
        let mut levels = self.levels.lock().expect("queue lock poisoned");
        levels.iter_mut().find_map(|level| level.pop_front())
    }

    /// Park until at least one packet has been enqueued since the last
    /// drain. The caller drains with `pop` until `None`.
    pub async fn wait(&self) {
        self.notify.notified().await;
    }

    /// Total packets across all levels.
    pub fn len(&self) -> usize {
        let levels = self.levels.lock().expect("queue lock poisoned");
        levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
