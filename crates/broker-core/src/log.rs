//! The bounded event log used for observability.
//!
//! A ring buffer: when full, the oldest entry is evicted on insertion.
//! Readers get a chronological copy, so later mutation of the log never
//! affects an already-returned snapshot.

use std::collections::VecDeque;
use std::sync::RwLock;

use crate::event::Event;

/// Default log capacity.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

pub(crate) struct EventLog {
    capacity: usize,
    entries: RwLock<VecDeque<Event>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(4096))),
        }
    }

    /// Append `event`, evicting the oldest entry first if at capacity.
    pub fn push(&self, event: Event) {
        let mut guard = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if guard.len() >= self.capacity {
            guard.pop_front();
        }
        guard.push_back(event);
    }

    /// A chronological copy of the log, truncated to the most recent
    /// `limit` entries if given.
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<Event> {
        let guard = self.entries.read().unwrap_or_else(|e| e.into_inner());
        match limit {
            Some(limit) if limit < guard.len() => {
                guard.iter().skip(guard.len() - limit).cloned().collect()
            }
            _ => guard.iter().cloned().collect(),
        }
    }

    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: usize) -> Event {
        Event::new(
            "t",
            serde_json::json!(n),
            crate::event::UNKNOWN_SOURCE,
            crate::event::UNVERSIONED,
        )
    }

    #[test]
    fn evicts_oldest_on_overflow() {
        let log = EventLog::new(3);
        for i in 0..4 {
            log.push(event(i));
        }
        let snapshot = log.snapshot(None);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].detail, serde_json::json!(1));
        assert_eq!(snapshot[2].detail, serde_json::json!(3));
    }

    #[test]
    fn limit_truncates_to_most_recent() {
        let log = EventLog::new(10);
        for i in 0..5 {
            log.push(event(i));
        }
        let snapshot = log.snapshot(Some(2));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].detail, serde_json::json!(3));
        assert_eq!(snapshot[1].detail, serde_json::json!(4));
    }

    #[test]
    fn clear_empties_the_log() {
        let log = EventLog::new(10);
        log.push(event(0));
        log.clear();
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn capacity_bound_holds_at_exactly_1001_insertions() {
        let log = EventLog::new(DEFAULT_LOG_CAPACITY);
        for i in 0..(DEFAULT_LOG_CAPACITY + 1) {
            log.push(event(i));
        }
        assert_eq!(log.len(), DEFAULT_LOG_CAPACITY);
        let snapshot = log.snapshot(None);
        // oldest entry (index 0) was dropped, entry 1 is now the first
        assert_eq!(snapshot[0].detail, serde_json::json!(1));
    }
}
