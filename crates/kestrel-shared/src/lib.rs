//! Lock-free primitives shared by the submission runtime.
//!
//! - [`MonotonicStatus`]: an execution status that can only ever move towards completion.
//! - [`TagMemory`]: the hardware-visible completion counter a GPU engine writes.

mod status;
mod tag;

pub use status::{
    ExecutionStatus, MonotonicStatus, Transition, STATUS_COMPLETE, STATUS_QUEUED, STATUS_RUNNING,
    STATUS_SUBMITTED,
};
pub use tag::TagMemory;
