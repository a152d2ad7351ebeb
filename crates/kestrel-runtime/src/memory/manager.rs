use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::{align_up, AllocationId, AllocationKind, GraphicsAllocation};
use crate::error::{Result, RuntimeError};
use crate::sync::lock;

pub const PAGE_SIZE: usize = 4096;

const GPU_VA_BASE: u64 = 0x1_0000_0000;

/// Allocator collaborator used for command buffers, heaps and the tag buffer.
pub trait MemoryManager: Send + Sync {
    fn allocate(&self, kind: AllocationKind, size: usize) -> Result<Arc<GraphicsAllocation>>;

    fn free(&self, allocation: Arc<GraphicsAllocation>);

    /// Park an allocation for later reuse instead of freeing it.
    fn store_reusable_allocation(&self, allocation: Arc<GraphicsAllocation>);

    /// Take a parked allocation of `kind` with at least `min_size` bytes that no submission newer
    /// than `completed_task_count` references.
    fn obtain_reusable_allocation(
        &self,
        kind: AllocationKind,
        min_size: usize,
        completed_task_count: u32,
    ) -> Option<Arc<GraphicsAllocation>>;
}

#[derive(Debug)]
struct HostState {
    next_id: u64,
    next_gpu_address: u64,
    live: HashMap<AllocationId, usize>,
    reusable: Vec<Arc<GraphicsAllocation>>,
    bytes_in_use: usize,
}

/// Page-granular allocator backed by host memory.
///
/// With a budget set, an allocation that would exceed it first evicts parked allocations nobody
/// else references, then fails with [`RuntimeError::OutOfResources`].
#[derive(Debug)]
pub struct HostMemoryManager {
    state: Mutex<HostState>,
    budget: Option<usize>,
}

impl Default for HostMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMemoryManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HostState {
                next_id: 1,
                next_gpu_address: GPU_VA_BASE,
                live: HashMap::new(),
                reusable: Vec::new(),
                bytes_in_use: 0,
            }),
            budget: None,
        }
    }

    pub fn with_budget(budget: usize) -> Self {
        Self {
            budget: Some(budget),
            ..Self::new()
        }
    }

    pub fn bytes_in_use(&self) -> usize {
        lock(&self.state).bytes_in_use
    }

    pub fn live_allocations(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub fn reusable_allocation_ids(&self) -> Vec<AllocationId> {
        lock(&self.state).reusable.iter().map(|a| a.id()).collect()
    }

    fn evict_idle_reusable(state: &mut HostState, needed: usize, budget: usize) {
        let mut i = 0;
        while i < state.reusable.len() && state.bytes_in_use + needed > budget {
            if Arc::strong_count(&state.reusable[i]) == 1 {
                let evicted = state.reusable.swap_remove(i);
                if let Some(size) = state.live.remove(&evicted.id()) {
                    state.bytes_in_use -= size;
                }
                trace!(id = ?evicted.id(), "evicted parked allocation");
            } else {
                i += 1;
            }
        }
    }
}

impl MemoryManager for HostMemoryManager {
    fn allocate(&self, kind: AllocationKind, size: usize) -> Result<Arc<GraphicsAllocation>> {
        let size = align_up(size.max(1), PAGE_SIZE);
        let mut state = lock(&self.state);

        if let Some(budget) = self.budget {
            if state.bytes_in_use + size > budget {
                Self::evict_idle_reusable(&mut state, size, budget);
            }
            if state.bytes_in_use + size > budget {
                debug!(?kind, size, budget, in_use = state.bytes_in_use, "allocation over budget");
                return Err(RuntimeError::OutOfResources {
                    kind,
                    requested: size,
                });
            }
        }

        let id = AllocationId(state.next_id);
        state.next_id += 1;
        let gpu_address = state.next_gpu_address;
        state.next_gpu_address += size as u64;
        state.live.insert(id, size);
        state.bytes_in_use += size;

        trace!(?id, ?kind, size, gpu_address, "allocated");
        Ok(Arc::new(GraphicsAllocation::new(id, kind, gpu_address, size)))
    }

    fn free(&self, allocation: Arc<GraphicsAllocation>) {
        let mut state = lock(&self.state);
        state.reusable.retain(|a| a.id() != allocation.id());
        if let Some(size) = state.live.remove(&allocation.id()) {
            state.bytes_in_use -= size;
        }
    }

    fn store_reusable_allocation(&self, allocation: Arc<GraphicsAllocation>) {
        let mut state = lock(&self.state);
        if state.reusable.iter().any(|a| a.id() == allocation.id()) {
            return;
        }
        trace!(id = ?allocation.id(), kind = ?allocation.kind(), "parked for reuse");
        state.reusable.push(allocation);
    }

    fn obtain_reusable_allocation(
        &self,
        kind: AllocationKind,
        min_size: usize,
        completed_task_count: u32,
    ) -> Option<Arc<GraphicsAllocation>> {
        let mut state = lock(&self.state);
        let pos = state.reusable.iter().position(|a| {
            a.kind() == kind && a.size() >= min_size && !a.is_used_by_gpu(completed_task_count)
        })?;
        Some(state.reusable.remove(pos))
    }
}
