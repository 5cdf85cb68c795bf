//! Duplicate detection for certified deliveries.
//!
//! A retransmitted message whose first copy did arrive must be acknowledged
//! again but dispatched only once. The window remembers the most recent
//! certified ids with FIFO eviction, so its memory is bounded by `capacity`.

use crate::protocol::frame::MessageId;
use std::collections::{HashSet, VecDeque};
use tracing::trace;

#[derive(Debug)]
pub struct DuplicateWindow {
    seen: HashSet<MessageId>,
    order: VecDeque<MessageId>,
    capacity: usize,
}

impl DuplicateWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.seen.contains(&id)
    }

    /// Record `id`; returns `true` if it was already in the window
    pub fn check_and_insert(&mut self, id: MessageId) -> bool {
        if self.seen.contains(&id) {
            trace!(%id, "Duplicate certified id");
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id);
        self.order.push_back(id);
        false
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_sighting_is_duplicate() {
        let mut window = DuplicateWindow::new(8);
        assert!(!window.check_and_insert(MessageId(1)));
        assert!(window.check_and_insert(MessageId(1)));
        assert!(!window.check_and_insert(MessageId(2)));
    }

    #[test]
    fn test_oldest_evicted_at_capacity() {
        let mut window = DuplicateWindow::new(3);
        for id in 0..4 {
            assert!(!window.check_and_insert(MessageId(id)));
        }
        assert_eq!(window.len(), 3);
        // 0 fell out of the window and reads as new again
        assert!(!window.check_and_insert(MessageId(0)));
        assert!(window.check_and_insert(MessageId(3)));
    }
}
