use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};
use crate::sync::lock;
use crate::token::OBJECT_NOT_RESIDENT;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationKind {
    CommandBuffer,
    RingBuffer,
    DynamicStateHeap,
    GeneralStateHeap,
    IndirectObjectHeap,
    SurfaceStateHeap,
    Buffer,
    KernelIsa,
    TagBuffer,
}

/// A block of GPU-visible memory owned by a [`MemoryManager`](super::MemoryManager).
///
/// Besides its storage the allocation carries `residency_task_count`: the task count of the last
/// submission that referenced it. Only the flush path writes it; everyone else reads it to decide
/// whether the allocation may be reused.
pub struct GraphicsAllocation {
    id: AllocationId,
    kind: AllocationKind,
    gpu_address: u64,
    storage: Mutex<Vec<u8>>,
    residency_task_count: AtomicU32,
}

impl GraphicsAllocation {
    pub fn new(id: AllocationId, kind: AllocationKind, gpu_address: u64, size: usize) -> Self {
        Self {
            id,
            kind,
            gpu_address,
            storage: Mutex::new(vec![0; size]),
            residency_task_count: AtomicU32::new(OBJECT_NOT_RESIDENT),
        }
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn size(&self) -> usize {
        lock(&self.storage).len()
    }

    pub fn residency_task_count(&self) -> u32 {
        self.residency_task_count.load(Ordering::Acquire)
    }

    /// Record that submission `task_count` references this allocation.
    ///
    /// Stamps only move forward; a flush that lost a race to a later one leaves the later stamp.
    pub(crate) fn update_residency_task_count(&self, task_count: u32) {
        let mut current = self.residency_task_count.load(Ordering::Acquire);
        loop {
            if current != OBJECT_NOT_RESIDENT && current >= task_count {
                return;
            }
            match self.residency_task_count.compare_exchange_weak(
                current,
                task_count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether a submission newer than `completed_task_count` may still read this allocation.
    pub fn is_used_by_gpu(&self, completed_task_count: u32) -> bool {
        let stamp = self.residency_task_count();
        stamp != OBJECT_NOT_RESIDENT && stamp > completed_task_count
    }

    pub fn write(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        let mut storage = lock(&self.storage);
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= storage.len())
            .ok_or(RuntimeError::InvalidValue("write past the end of an allocation"))?;
        storage[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let storage = lock(&self.storage);
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= storage.len())
            .ok_or(RuntimeError::InvalidValue("read past the end of an allocation"))?;
        Ok(storage[offset..end].to_vec())
    }

    /// Fill `len` bytes at `offset` by repeating `pattern`.
    pub fn fill(&self, offset: usize, len: usize, pattern: &[u8]) -> Result<()> {
        if pattern.is_empty() {
            return Err(RuntimeError::InvalidValue("empty fill pattern"));
        }
        let mut storage = lock(&self.storage);
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= storage.len())
            .ok_or(RuntimeError::InvalidValue("fill past the end of an allocation"))?;
        for (dst, src) in storage[offset..end]
            .iter_mut()
            .zip(pattern.iter().cycle())
        {
            *dst = *src;
        }
        Ok(())
    }
}

impl fmt::Debug for GraphicsAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphicsAllocation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("gpu_address", &format_args!("{:#x}", self.gpu_address))
            .field("size", &self.size())
            .field("residency_task_count", &self.residency_task_count())
            .finish()
    }
}
