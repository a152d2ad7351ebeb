use thiserror::Error;

use crate::memory::AllocationKind;

pub type Result<T> = std::result::Result<T, RuntimeError>;

pub const CL_OUT_OF_RESOURCES: i32 = -5;
pub const CL_PROFILING_INFO_NOT_AVAILABLE: i32 = -7;
pub const CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST: i32 = -14;
pub const CL_INVALID_VALUE: i32 = -30;
pub const CL_INVALID_CONTEXT: i32 = -34;
pub const CL_INVALID_OPERATION: i32 = -59;

/// Unified error type for admission, submission and wait operations.
///
/// Programming errors (double completion, double payload install, task count moving backwards)
/// surface as [`RuntimeError::InvalidOperation`] and are logged at error level where detected.
/// [`RuntimeError::GpuHang`] is unrecoverable: callers must not retry the wait.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    #[error("event belongs to a different context")]
    InvalidContext,

    #[error("out of resources: {requested} bytes for {kind:?}")]
    OutOfResources {
        kind: AllocationKind,
        requested: usize,
    },

    #[error("event in wait list terminated with status {status}")]
    ExecStatusErrorForEventsInWaitList { status: i32 },

    #[error("profiling information not available")]
    ProfilingInfoNotAvailable,

    #[error("backend submission failed: {0}")]
    Backend(String),

    #[error(
        "GPU hang: task count {task_count} not observed after waiting on flush stamp {flush_stamp}"
    )]
    GpuHang { task_count: u32, flush_stamp: u64 },
}

impl RuntimeError {
    /// Numeric status code in the compute API's convention (always negative).
    ///
    /// A command aborted by one of these errors terminates its event with this value.
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidOperation(_) => CL_INVALID_OPERATION,
            Self::InvalidValue(_) => CL_INVALID_VALUE,
            Self::InvalidContext => CL_INVALID_CONTEXT,
            Self::OutOfResources { .. } | Self::Backend(_) | Self::GpuHang { .. } => {
                CL_OUT_OF_RESOURCES
            }
            Self::ExecStatusErrorForEventsInWaitList { .. } => {
                CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST
            }
            Self::ProfilingInfoNotAvailable => CL_PROFILING_INFO_NOT_AVAILABLE,
        }
    }
}
