//! Execution status with a monotonic-decrease invariant.
//!
//! Status values follow the compute API convention: larger values are *earlier* in the
//! lifecycle (`Queued=3` .. `Complete=0`) and negative values are error terminations. Every
//! writer goes through [`MonotonicStatus::lower_to`], which only commits a strictly smaller
//! value, so concurrent writers (an application thread and a completion poller) can never make
//! an observer see the status move backwards.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicI32;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicI32;

use std::sync::atomic::Ordering;

pub const STATUS_QUEUED: i32 = 3;
pub const STATUS_SUBMITTED: i32 = 2;
pub const STATUS_RUNNING: i32 = 1;
pub const STATUS_COMPLETE: i32 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    /// Terminated with the contained (negative) error code.
    Terminated(i32),
}

impl ExecutionStatus {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            STATUS_COMPLETE => Self::Complete,
            STATUS_RUNNING => Self::Running,
            STATUS_SUBMITTED => Self::Submitted,
            raw if raw < 0 => Self::Terminated(raw),
            _ => Self::Queued,
        }
    }

    pub fn raw(self) -> i32 {
        match self {
            Self::Queued => STATUS_QUEUED,
            Self::Submitted => STATUS_SUBMITTED,
            Self::Running => STATUS_RUNNING,
            Self::Complete => STATUS_COMPLETE,
            Self::Terminated(code) => code,
        }
    }

    /// `Complete` or any error termination.
    pub fn is_terminal(self) -> bool {
        self.raw() <= STATUS_COMPLETE
    }

    pub fn is_terminated_by_error(self) -> bool {
        self.raw() < STATUS_COMPLETE
    }
}

/// Outcome of a [`MonotonicStatus::lower_to`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The stored value moved from `from` to the requested value.
    Lowered { from: i32 },
    /// The stored value was already at or below the requested value; nothing was written.
    Unchanged { current: i32 },
}

impl Transition {
    pub fn is_lowered(self) -> bool {
        matches!(self, Transition::Lowered { .. })
    }
}

#[derive(Debug)]
pub struct MonotonicStatus {
    value: AtomicI32,
}

impl MonotonicStatus {
    pub fn new(initial: i32) -> Self {
        Self {
            value: AtomicI32::new(initial),
        }
    }

    pub fn load(&self) -> i32 {
        self.value.load(Ordering::SeqCst)
    }

    pub fn peek(&self) -> ExecutionStatus {
        ExecutionStatus::from_raw(self.load())
    }

    /// Move the status to `new` if, and only if, `new` is strictly below the current value.
    pub fn lower_to(&self, new: i32) -> Transition {
        let mut current = self.value.load(Ordering::SeqCst);
        loop {
            if new >= current {
                return Transition::Unchanged { current };
            }
            match self.value.compare_exchange_weak(
                current,
                new,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Transition::Lowered { from: current },
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for MonotonicStatus {
    fn default() -> Self {
        Self::new(STATUS_QUEUED)
    }
}
