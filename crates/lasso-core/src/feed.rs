use std::collections::VecDeque;

use lasso_proto::protocol::ScrobbleEvent;

/// Bounded ring buffer of relayed scrobbles; the oldest entry is evicted
/// first once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct ActivityFeed {
    events: VecDeque<ScrobbleEvent>,
    capacity: usize,
}

impl ActivityFeed {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, event: ScrobbleEvent) {
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    /// Most recent first.
    pub fn snapshot(&self) -> Vec<ScrobbleEvent> {
        self.events.iter().rev().cloned().collect()
    }

}
