//! Bounded cache of recently completed commands.
//!
//! Delivery is at-least-once: an agent crash mid-batch makes the broker
//! redeliver the unacked message. Tracking completed `(batch_id,
//! command_id)` pairs lets a replica skip work a previous delivery already
//! ran instead of double-executing it.

use std::collections::{HashSet, VecDeque};

pub struct CompletedCache {
    capacity: usize,
    seen: HashSet<(String, u32)>,
    order: VecDeque<(String, u32)>,
}

impl CompletedCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    pub fn contains(&self, batch_id: &str, command_id: u32) -> bool {
        self.seen.contains(&(batch_id.to_string(), command_id))
    }

    pub fn record(&mut self, batch_id: &str, command_id: u32) {
        let key = (batch_id.to_string(), command_id);
        if !self.seen.insert(key.clone()) {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }
}
