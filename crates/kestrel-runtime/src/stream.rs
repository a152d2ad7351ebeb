//! Linear command streams and indirect heaps layered over allocations.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, RuntimeError};
use crate::memory::{align_up, AllocationKind, GraphicsAllocation};

/// A bump-allocated view over one [`GraphicsAllocation`].
///
/// Commands are appended at the cursor; the stream never wraps. Running out of space is the
/// owner's cue to swap in a bigger allocation via [`LinearStream::replace_buffer`].
pub struct LinearStream {
    allocation: Arc<GraphicsAllocation>,
    capacity: usize,
    used: usize,
}

impl LinearStream {
    pub fn new(allocation: Arc<GraphicsAllocation>) -> Self {
        let capacity = allocation.size();
        Self {
            allocation,
            capacity,
            used: 0,
        }
    }

    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        self.capacity - self.used
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation.gpu_address()
    }

    /// GPU address of the next byte to be written.
    pub fn cursor_gpu_address(&self) -> u64 {
        self.allocation.gpu_address() + self.used as u64
    }

    /// Append `bytes`, returning their offset within the stream.
    pub fn emit(&mut self, bytes: &[u8]) -> Result<usize> {
        if bytes.len() > self.available() {
            return Err(RuntimeError::OutOfResources {
                kind: self.allocation.kind(),
                requested: bytes.len(),
            });
        }
        let offset = self.used;
        self.allocation.write(offset, bytes)?;
        self.used += bytes.len();
        Ok(offset)
    }

    /// Pad the cursor to `alignment` with zeroes.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        let aligned = align_up(self.used, alignment.max(1));
        if aligned > self.capacity {
            return Err(RuntimeError::OutOfResources {
                kind: self.allocation.kind(),
                requested: aligned - self.used,
            });
        }
        self.used = aligned;
        Ok(())
    }

    /// Move the cursor back to `used`, discarding what was written after it. Bytes stay in the
    /// allocation and are overwritten by the next emit.
    pub fn rewind(&mut self, used: usize) {
        self.used = self.used.min(used);
    }

    /// Swap in a new backing allocation, returning the old one.
    pub fn replace_buffer(&mut self, allocation: Arc<GraphicsAllocation>) -> Arc<GraphicsAllocation> {
        self.capacity = allocation.size();
        self.used = 0;
        std::mem::replace(&mut self.allocation, allocation)
    }

    pub fn into_allocation(self) -> Arc<GraphicsAllocation> {
        self.allocation
    }
}

impl fmt::Debug for LinearStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearStream")
            .field("allocation", &self.allocation.id())
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HeapKind {
    DynamicState,
    GeneralState,
    IndirectObject,
    SurfaceState,
}

impl HeapKind {
    pub const ALL: [HeapKind; 4] = [
        HeapKind::DynamicState,
        HeapKind::GeneralState,
        HeapKind::IndirectObject,
        HeapKind::SurfaceState,
    ];

    pub fn index(self) -> usize {
        match self {
            HeapKind::DynamicState => 0,
            HeapKind::GeneralState => 1,
            HeapKind::IndirectObject => 2,
            HeapKind::SurfaceState => 3,
        }
    }

    pub fn allocation_kind(self) -> AllocationKind {
        match self {
            HeapKind::DynamicState => AllocationKind::DynamicStateHeap,
            HeapKind::GeneralState => AllocationKind::GeneralStateHeap,
            HeapKind::IndirectObject => AllocationKind::IndirectObjectHeap,
            HeapKind::SurfaceState => AllocationKind::SurfaceStateHeap,
        }
    }
}

/// A [`LinearStream`] holding state referenced by dispatches rather than executed directly.
#[derive(Debug)]
pub struct IndirectHeap {
    kind: HeapKind,
    stream: LinearStream,
}

impl IndirectHeap {
    pub fn new(kind: HeapKind, allocation: Arc<GraphicsAllocation>) -> Self {
        Self {
            kind,
            stream: LinearStream::new(allocation),
        }
    }

    pub fn kind(&self) -> HeapKind {
        self.kind
    }

    pub fn stream(&self) -> &LinearStream {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut LinearStream {
        &mut self.stream
    }

    pub fn available(&self) -> usize {
        self.stream.available()
    }

    /// Append `bytes` at `alignment`, returning the GPU address they landed at.
    pub fn push(&mut self, bytes: &[u8], alignment: usize) -> Result<u64> {
        self.stream.align(alignment)?;
        let offset = self.stream.emit(bytes)?;
        Ok(self.stream.gpu_address() + offset as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::AllocationId;

    fn stream(size: usize) -> LinearStream {
        LinearStream::new(Arc::new(GraphicsAllocation::new(
            AllocationId(7),
            AllocationKind::CommandBuffer,
            0x4000,
            size,
        )))
    }

    #[test]
    fn rewind_only_moves_the_cursor_back() {
        let mut cs = stream(16);
        cs.emit(&[1, 2, 3, 4]).unwrap();
        cs.emit(&[5, 6]).unwrap();
        cs.rewind(4);
        assert_eq!(cs.used(), 4);
        cs.rewind(10);
        assert_eq!(cs.used(), 4);
        assert_eq!(cs.emit(&[7]).unwrap(), 4);
        assert_eq!(cs.allocation().read(4, 1).unwrap(), vec![7]);
    }

    #[test]
    fn emit_advances_cursor_and_writes_bytes() {
        let mut cs = stream(16);
        assert_eq!(cs.emit(&[1, 2, 3]).unwrap(), 0);
        assert_eq!(cs.emit(&[4]).unwrap(), 3);
        assert_eq!(cs.used(), 4);
        assert_eq!(cs.available(), 12);
        assert_eq!(cs.cursor_gpu_address(), 0x4004);
        assert_eq!(cs.allocation().read(0, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn overflow_leaves_stream_untouched() {
        let mut cs = stream(4);
        cs.emit(&[0; 3]).unwrap();
        assert!(cs.emit(&[0; 2]).is_err());
        assert_eq!(cs.used(), 3);
        assert!(cs.align(8).is_err());
        assert_eq!(cs.used(), 3);
    }

    #[test]
    fn replace_buffer_resets_cursor() {
        let mut cs = stream(8);
        cs.emit(&[9; 8]).unwrap();
        let bigger = Arc::new(GraphicsAllocation::new(
            AllocationId(8),
            AllocationKind::CommandBuffer,
            0x8000,
            32,
        ));
        let old = cs.replace_buffer(bigger);
        assert_eq!(old.id(), AllocationId(7));
        assert_eq!(cs.used(), 0);
        assert_eq!(cs.capacity(), 32);
    }

    #[test]
    fn heap_push_honours_alignment() {
        let alloc = Arc::new(GraphicsAllocation::new(
            AllocationId(1),
            AllocationKind::SurfaceStateHeap,
            0x10_000,
            256,
        ));
        let mut heap = IndirectHeap::new(HeapKind::SurfaceState, alloc);
        assert_eq!(heap.push(&[1], 1).unwrap(), 0x10_000);
        assert_eq!(heap.push(&[2; 4], 64).unwrap(), 0x10_040);
        assert_eq!(heap.available(), 256 - 68);
    }
}
