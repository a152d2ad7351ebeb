use std::fmt;
use std::sync::{Arc, Mutex};

use kestrel_shared::STATUS_COMPLETE;
use tracing::{trace, warn};

use crate::encoder::{MAX_DISPATCH_PAYLOAD_BYTES, MAX_FILL_PATTERN_BYTES};
use crate::event::{CommandType, EventCallback};
use crate::error::{Result, RuntimeError};
use crate::memory::{AllocationKind, GraphicsAllocation, MemoryManager};
use crate::stream::HeapKind;
use crate::sync::lock;

/// A kernel dispatch as produced by the program pipeline: an opaque encoded body, the indirect
/// state it needs in the queue's heaps and the allocations it touches.
#[derive(Clone, Debug, Default)]
pub struct KernelPayload {
    pub name: String,
    pub encoded: Vec<u8>,
    pub heap_data: Vec<(HeapKind, Vec<u8>)>,
    pub residency: Vec<Arc<GraphicsAllocation>>,
}

#[derive(Clone)]
pub enum EnqueueCommand {
    Kernel(KernelPayload),
    CopyBuffer {
        src: Arc<GraphicsAllocation>,
        src_offset: usize,
        dst: Arc<GraphicsAllocation>,
        dst_offset: usize,
        size: usize,
    },
    FillBuffer {
        dst: Arc<GraphicsAllocation>,
        offset: usize,
        size: usize,
        pattern: Vec<u8>,
    },
    /// Host data is staged at enqueue time, so `data` may be reused as soon as the call returns.
    WriteBuffer {
        dst: Arc<GraphicsAllocation>,
        offset: usize,
        data: Vec<u8>,
    },
    /// `dst` is filled when the command's event completes.
    ReadBuffer {
        src: Arc<GraphicsAllocation>,
        offset: usize,
        size: usize,
        dst: Arc<Mutex<Vec<u8>>>,
    },
    Marker,
    Barrier,
}

impl fmt::Debug for EnqueueCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel(p) => f
                .debug_struct("Kernel")
                .field("name", &p.name)
                .field("encoded", &p.encoded.len())
                .finish(),
            Self::CopyBuffer { size, .. } => f.debug_struct("CopyBuffer").field("size", size).finish(),
            Self::FillBuffer { size, pattern, .. } => f
                .debug_struct("FillBuffer")
                .field("size", size)
                .field("pattern", &pattern.len())
                .finish(),
            Self::WriteBuffer { data, .. } => {
                f.debug_struct("WriteBuffer").field("size", &data.len()).finish()
            }
            Self::ReadBuffer { size, .. } => f.debug_struct("ReadBuffer").field("size", size).finish(),
            Self::Marker => f.write_str("Marker"),
            Self::Barrier => f.write_str("Barrier"),
        }
    }
}

impl EnqueueCommand {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Kernel(_) => CommandType::NdRangeKernel,
            Self::CopyBuffer { .. } => CommandType::CopyBuffer,
            Self::FillBuffer { .. } => CommandType::FillBuffer,
            Self::WriteBuffer { .. } => CommandType::WriteBuffer,
            Self::ReadBuffer { .. } => CommandType::ReadBuffer,
            Self::Marker => CommandType::Marker,
            Self::Barrier => CommandType::Barrier,
        }
    }

    /// Markers and barriers order against everything enqueued before them, even out of order.
    pub fn is_barrier_like(&self) -> bool {
        matches!(self, Self::Marker | Self::Barrier)
    }
}

pub(crate) enum Work {
    Dispatch {
        payload: Vec<u8>,
        heap_data: Vec<(HeapKind, Vec<u8>)>,
    },
    Copy {
        src: u64,
        dst: u64,
        size: u64,
    },
    Fill {
        dst: u64,
        size: u64,
        pattern: Vec<u8>,
    },
    /// Nothing to encode; completes with whatever precedes it.
    Sync,
}

/// A validated command ready to encode, now or once its dependencies resolve.
pub(crate) struct PreparedCommand {
    pub work: Work,
    pub residency: Vec<Arc<GraphicsAllocation>>,
    pub staging: Option<Staging>,
}

/// Host-visible bounce buffer for read and write commands, released when the event finishes.
pub(crate) struct Staging {
    allocation: Arc<GraphicsAllocation>,
    readback: Option<(Arc<Mutex<Vec<u8>>>, usize)>,
}

impl Staging {
    pub(crate) fn into_callback(self, memory: Arc<dyn MemoryManager>) -> EventCallback {
        Box::new(move |id, status| {
            if let Some((dst, len)) = self.readback {
                if status == STATUS_COMPLETE {
                    match self.allocation.read(0, len) {
                        Ok(bytes) => *lock(&dst) = bytes,
                        Err(err) => warn!(%id, %err, "read-back from staging failed"),
                    }
                }
            }
            trace!(%id, staging = ?self.allocation.id(), "staging released");
            memory.free(self.allocation);
        })
    }
}

fn range_address(allocation: &GraphicsAllocation, offset: usize, size: usize) -> Result<u64> {
    if size == 0 {
        return Err(RuntimeError::InvalidValue("zero-sized transfer"));
    }
    offset
        .checked_add(size)
        .filter(|end| *end <= allocation.size())
        .ok_or(RuntimeError::InvalidValue("range outside the buffer"))?;
    Ok(allocation.gpu_address() + offset as u64)
}

/// Validate `command` and stage any host data it carries.
pub(crate) fn prepare(
    command: EnqueueCommand,
    memory: &dyn MemoryManager,
    max_fill_pattern_size: usize,
) -> Result<PreparedCommand> {
    let prepared = match command {
        EnqueueCommand::Kernel(payload) => {
            if payload.encoded.len() > MAX_DISPATCH_PAYLOAD_BYTES {
                return Err(RuntimeError::InvalidValue(
                    "kernel payload does not fit one dispatch packet",
                ));
            }
            PreparedCommand {
                work: Work::Dispatch {
                    payload: payload.encoded,
                    heap_data: payload.heap_data,
                },
                residency: payload.residency,
                staging: None,
            }
        }
        EnqueueCommand::CopyBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => PreparedCommand {
            work: Work::Copy {
                src: range_address(&src, src_offset, size)?,
                dst: range_address(&dst, dst_offset, size)?,
                size: size as u64,
            },
            residency: vec![src, dst],
            staging: None,
        },
        EnqueueCommand::FillBuffer {
            dst,
            offset,
            size,
            pattern,
        } => {
            let len = pattern.len();
            let max = max_fill_pattern_size.min(MAX_FILL_PATTERN_BYTES);
            if len == 0 || !len.is_power_of_two() || len > max {
                return Err(RuntimeError::InvalidValue("unsupported fill pattern size"));
            }
            if size % len != 0 {
                return Err(RuntimeError::InvalidValue(
                    "fill size is not a multiple of the pattern",
                ));
            }
            PreparedCommand {
                work: Work::Fill {
                    dst: range_address(&dst, offset, size)?,
                    size: size as u64,
                    pattern,
                },
                residency: vec![dst],
                staging: None,
            }
        }
        EnqueueCommand::WriteBuffer { dst, offset, data } => {
            let dst_address = range_address(&dst, offset, data.len())?;
            let staging = memory.allocate(AllocationKind::Buffer, data.len())?;
            staging.write(0, &data)?;
            PreparedCommand {
                work: Work::Copy {
                    src: staging.gpu_address(),
                    dst: dst_address,
                    size: data.len() as u64,
                },
                residency: vec![staging.clone(), dst],
                staging: Some(Staging {
                    allocation: staging,
                    readback: None,
                }),
            }
        }
        EnqueueCommand::ReadBuffer {
            src,
            offset,
            size,
            dst,
        } => {
            let src_address = range_address(&src, offset, size)?;
            let staging = memory.allocate(AllocationKind::Buffer, size)?;
            PreparedCommand {
                work: Work::Copy {
                    src: src_address,
                    dst: staging.gpu_address(),
                    size: size as u64,
                },
                residency: vec![src, staging.clone()],
                staging: Some(Staging {
                    allocation: staging,
                    readback: Some((dst, size)),
                }),
            }
        }
        EnqueueCommand::Marker | EnqueueCommand::Barrier => PreparedCommand {
            work: Work::Sync,
            residency: Vec::new(),
            staging: None,
        },
    };
    Ok(prepared)
}
