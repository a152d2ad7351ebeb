//! Command admission, dependency tracking and completion notification for GPU compute queues.
//!
//! The crate is organised leaf to root:
//!
//! - [`token`]: task counts, task levels and flush stamps shared by events and receivers.
//! - [`memory`]: allocations and the allocator collaborator ([`MemoryManager`]).
//! - [`encoder`]: per-hardware-family packet encoders ([`CommandEncoder`]).
//! - [`kmd_notify`]: the adaptive wait policy ([`KmdNotifyHelper`]).
//! - [`csr`]: the submission backend contract ([`CommandStreamReceiver`]) and its hardware,
//!   AUB and TBX variants.
//! - [`event`]: the completion state machine and dependency graph ([`Event`]).
//! - [`queue`]: the admission point ([`CommandQueue`]).
//! - [`device`] / [`context`]: the objects that tie the above together.

mod error;
mod sync;

pub mod config;
pub mod context;
pub mod csr;
pub mod device;
pub mod encoder;
pub mod event;
pub mod kmd_notify;
pub mod memory;
pub mod os;
pub mod queue;
pub mod stats;
pub mod stream;
pub mod token;

pub use config::{ConfigError, CsrKind, KmdNotifyOverrides, RuntimeConfig};
pub use context::Context;
pub use csr::{BatchBuffer, CommandStreamReceiver, OsWaitPrimitive, SubmissionBackend};
pub use device::{Device, DeviceBuilder, DeviceCapabilities};
pub use encoder::{encoder_for, CommandEncoder, HardwareFamily};
pub use error::{Result, RuntimeError};
pub use event::{CommandType, Event, EventId, EventRegistry, ProfilingInfo};
pub use kestrel_shared::{
    ExecutionStatus, TagMemory, STATUS_COMPLETE, STATUS_QUEUED, STATUS_RUNNING, STATUS_SUBMITTED,
};
pub use kmd_notify::{KmdNotifyHelper, KmdNotifyProperties, WaitParams};
pub use memory::{
    AllocationId, AllocationKind, GraphicsAllocation, HostMemoryManager, MemoryManager,
};
pub use queue::{
    BufferInfo, CommandQueue, EnqueueCommand, KernelPayload, QueueOrdering, QueueProperties,
};
pub use stats::{RuntimeStats, RuntimeStatsSnapshot};
pub use stream::{HeapKind, IndirectHeap, LinearStream};
pub use token::{CompletionStamp, TASK_COUNT_NOT_READY, TASK_LEVEL_NOT_READY};
