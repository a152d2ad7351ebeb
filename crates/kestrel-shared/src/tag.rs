use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Hardware-visible completion counter.
///
/// The engine writes the task count of each retired submission here; work with task count `N`
/// is complete iff the stored value is `>= N`. Clones share the same counter.
#[derive(Clone, Debug)]
pub struct TagMemory {
    cell: Arc<AtomicU32>,
    gpu_address: u64,
}

impl TagMemory {
    pub fn new(gpu_address: u64) -> Self {
        Self {
            cell: Arc::new(AtomicU32::new(0)),
            gpu_address,
        }
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn read(&self) -> u32 {
        self.cell.load(Ordering::Acquire)
    }

    /// Engine-side write. Retirement is in order, so a stale (smaller) write never lowers the tag.
    pub fn signal(&self, task_count: u32) {
        self.cell.fetch_max(task_count, Ordering::AcqRel);
    }

    pub fn is_completed(&self, task_count: u32) -> bool {
        self.read() >= task_count
    }
}
