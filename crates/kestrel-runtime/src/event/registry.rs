use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tracing::trace;

use super::Event;
use crate::sync::{lock, Handoff};

/// Generational handle to an [`Event`] in an [`EventRegistry`].
///
/// Dependency edges are stored as ids, so a stale edge to a destroyed event resolves to nothing
/// instead of keeping it alive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId {
    index: u32,
    generation: u32,
}

impl EventId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({}v{})", self.index, self.generation)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    event: Option<Arc<Event>>,
}

#[derive(Default)]
struct Slots {
    entries: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

/// Arena holding the canonical strong reference to every event of a context.
///
/// Events whose last application reference was released but whose work may still be running
/// park in the pending-destruction list until a completion poll observes them done.
#[derive(Default)]
pub struct EventRegistry {
    slots: Mutex<Slots>,
    pending_destruction: Handoff<EventId>,
}

impl fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRegistry")
            .field("live", &self.len())
            .field("pending_destruction", &self.pending_destruction.len())
            .finish()
    }
}

impl EventRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Allocate a slot and store the event `build` creates for it.
    pub(crate) fn insert_with<F>(self: &Arc<Self>, build: F) -> Arc<Event>
    where
        F: FnOnce(EventId, Weak<EventRegistry>) -> Event,
    {
        let mut slots = lock(&self.slots);
        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                slots.entries.push(Slot::default());
                (slots.entries.len() - 1) as u32
            }
        };
        let slot = &mut slots.entries[index as usize];
        let id = EventId::new(index, slot.generation);
        let event = Arc::new(build(id, Arc::downgrade(self)));
        slot.event = Some(event.clone());
        slots.live += 1;
        event
    }

    pub fn get(&self, id: EventId) -> Option<Arc<Event>> {
        let slots = lock(&self.slots);
        let slot = slots.entries.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.event.clone()
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn remove(&self, id: EventId) -> Option<Arc<Event>> {
        let mut slots = lock(&self.slots);
        let slot = slots.entries.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let event = slot.event.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(id.index);
        slots.live -= 1;
        trace!(%id, "event destroyed");
        Some(event)
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn defer_destruction(&self, id: EventId) {
        self.pending_destruction.push(id);
    }

    pub fn pending_destruction_len(&self) -> usize {
        self.pending_destruction.len()
    }

    /// Retire parked events that have reached a terminal status. Returns how many were destroyed.
    pub fn drain_pending_destruction(&self) -> usize {
        let mut keep = Vec::new();
        let mut destroyed = 0;
        for id in self.pending_destruction.take_all() {
            let Some(event) = self.get(id) else {
                continue;
            };
            event.update_execution_status();
            if event.is_destroyable() {
                drop(event);
                if self.remove(id).is_some() {
                    destroyed += 1;
                }
            } else {
                keep.push(id);
            }
        }
        self.pending_destruction.restore(keep);
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::event::{CommandType, EventInit};
    use kestrel_shared::STATUS_COMPLETE;

    fn user_event(registry: &Arc<EventRegistry>) -> Arc<Event> {
        registry.insert_with(|id, reg| Event::new(id, reg, EventInit::user()))
    }

    #[test]
    fn stale_ids_do_not_resolve_after_slot_reuse() {
        let registry = EventRegistry::new();
        let a = user_event(&registry);
        let a_id = a.id();
        assert_eq!(a.command_type(), CommandType::User);
        drop(a);

        assert!(registry.remove(a_id).is_some());
        assert!(registry.remove(a_id).is_none());

        let b = user_event(&registry);
        assert_eq!(b.id().index(), a_id.index());
        assert_ne!(b.id(), a_id);
        assert!(registry.get(a_id).is_none());
        assert!(registry.contains(b.id()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn pending_destruction_waits_for_terminal_status() {
        let registry = EventRegistry::new();
        let e = user_event(&registry);
        registry.defer_destruction(e.id());

        assert_eq!(registry.drain_pending_destruction(), 0);
        assert_eq!(registry.pending_destruction_len(), 1);

        e.set_status(STATUS_COMPLETE).unwrap();
        let id = e.id();
        drop(e);
        assert_eq!(registry.drain_pending_destruction(), 1);
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }
}
