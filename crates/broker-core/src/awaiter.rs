//! Pending awaiters backing [`crate::Broker::wait_for`].
//!
//! A completion slot is a one-shot channel. `emit` resolves every slot
//! registered for its event type and drains them from the table; a
//! [`SlotGuard`] removes the caller's own slot on any other exit path
//! (timeout or cancellation) so the table never grows unbounded.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use tokio::sync::oneshot;

use crate::event::Event;

struct AwaiterSlot {
    id: u64,
    tx: oneshot::Sender<Event>,
}

#[derive(Default)]
pub(crate) struct AwaiterTable {
    slots: RwLock<HashMap<String, Vec<AwaiterSlot>>>,
    next_id: AtomicU64,
}

impl AwaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, event_type: &str) -> (u64, oneshot::Receiver<Event>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type.to_string())
            .or_default()
            .push(AwaiterSlot { id, tx });
        (id, rx)
    }

    pub fn remove(&self, event_type: &str, id: u64) {
        if let Some(list) = self
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(event_type)
        {
            list.retain(|slot| slot.id != id);
        }
    }

    /// Complete and drain every slot registered for `event_type`.
    pub fn resolve(&self, event_type: &str, event: &Event) {
        let slots = self
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(event_type)
            .unwrap_or_default();
        for slot in slots {
            let _ = slot.tx.send(event.clone());
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn pending_count(&self, event_type: &str) -> usize {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn clear(&self) {
        self.slots.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Removes its slot from the table on drop, regardless of exit path
/// (return, `?`, or the enclosing future being dropped mid-`.await` by a
/// cancelling scheduler). Resolution via [`AwaiterTable::resolve`] already
/// removes the slot, so the drop here is simply a no-op in that case.
pub(crate) struct SlotGuard<'a> {
    pub awaiters: &'a AwaiterTable,
    pub event_type: &'a str,
    pub id: u64,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.awaiters.remove(self.event_type, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_drains_all_slots_for_the_type() {
        let table = AwaiterTable::new();
        let (_id1, _rx1) = table.insert("t");
        let (_id2, _rx2) = table.insert("t");
        assert_eq!(table.pending_count("t"), 2);

        let event = Event::new(
            "t",
            serde_json::json!(null),
            crate::event::UNKNOWN_SOURCE,
            crate::event::UNVERSIONED,
        );
        table.resolve("t", &event);
        assert_eq!(table.pending_count("t"), 0);
    }

    #[test]
    fn guard_removes_slot_on_drop() {
        let table = AwaiterTable::new();
        let (id, _rx) = table.insert("t");
        {
            let _guard = SlotGuard {
                awaiters: &table,
                event_type: "t",
                id,
            };
            assert_eq!(table.pending_count("t"), 1);
        }
        assert_eq!(table.pending_count("t"), 0);
    }
}
