use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its data consistent before calling out, so a
/// poisoned lock carries no torn state.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Entries waiting to be handed to exactly one consumer.
///
/// An event keeps the children it has not notified yet in one of these, and the registry keeps
/// released events whose command is still outstanding. Whoever takes an entry is the only one
/// that acts on it; [`Handoff::restore`] returns the entries a taker could not act on yet.
#[derive(Debug)]
pub(crate) struct Handoff<T> {
    entries: Mutex<Vec<T>>,
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T> Handoff<T> {
    pub(crate) fn push(&self, entry: T) {
        lock(&self.entries).push(entry);
    }

    /// Take every entry queued so far, oldest first.
    pub(crate) fn take_all(&self) -> Vec<T> {
        let mut entries = lock(&self.entries);
        if entries.is_empty() {
            return Vec::new();
        }
        std::mem::replace(&mut *entries, Vec::with_capacity(4))
    }

    /// Return entries taken earlier. They go back ahead of anything pushed since.
    pub(crate) fn restore(&self, taken: Vec<T>) {
        if taken.is_empty() {
            return;
        }
        let mut entries = lock(&self.entries);
        entries.splice(0..0, taken);
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.entries).len()
    }
}

/// Spin-then-yield backoff for the few places that poll shared state.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;

    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Handoff;
    use std::sync::Arc;

    #[test]
    fn take_all_empties_the_handoff() {
        let q = Handoff::default();
        q.push(1);
        q.push(2);
        assert_eq!(q.take_all(), vec![1, 2]);
        assert!(q.take_all().is_empty());
    }

    #[test]
    fn restore_keeps_older_items_first() {
        let q = Handoff::default();
        q.push(1);
        q.push(2);
        let drained = q.take_all();
        q.push(3);
        q.restore(drained);
        assert_eq!(q.take_all(), vec![1, 2, 3]);
    }

    #[test]
    fn concurrent_pushes_are_each_drained_once() {
        let q = Arc::new(Handoff::default());
        let mut threads = Vec::new();
        for t in 0..4u32 {
            let q = Arc::clone(&q);
            threads.push(std::thread::spawn(move || {
                let mut drained = Vec::new();
                for i in 0..100u32 {
                    q.push(t * 1000 + i);
                    if i % 10 == 0 {
                        drained.extend(q.take_all());
                    }
                }
                drained
            }));
        }

        let mut items: Vec<u32> = threads
            .into_iter()
            .flat_map(|th| th.join().expect("thread join"))
            .collect();
        items.extend(q.take_all());
        items.sort_unstable();
        items.dedup();
        assert_eq!(items.len(), 400);
    }
}
