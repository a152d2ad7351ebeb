//! Allocations and the allocator collaborator.

mod allocation;
mod manager;

pub use allocation::{AllocationId, AllocationKind, GraphicsAllocation};
pub use manager::{HostMemoryManager, MemoryManager, PAGE_SIZE};

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0.
pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment > 0);
    match value.checked_add(alignment - 1) {
        Some(v) => v / alignment * alignment,
        None => usize::MAX / alignment * alignment,
    }
}
