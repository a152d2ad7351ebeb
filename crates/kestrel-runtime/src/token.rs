//! Completion counters shared by events, queues and command stream receivers.

use std::fmt;

/// Task count of an event whose command has not been flushed yet.
pub const TASK_COUNT_NOT_READY: u32 = 0xFFFF_FFF0;

/// Task level of an event that is not yet placed in its queue's dependency order.
pub const TASK_LEVEL_NOT_READY: u32 = 0xFFFF_FFF0;

/// Value of `residency_task_count` for an allocation that was never made resident.
pub const OBJECT_NOT_RESIDENT: u32 = u32::MAX;

/// Counters recorded on an event once its command went to hardware.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionStamp {
    pub task_count: u32,
    pub task_level: u32,
    pub flush_stamp: u64,
}

impl CompletionStamp {
    pub const NOT_READY: Self = Self {
        task_count: TASK_COUNT_NOT_READY,
        task_level: TASK_LEVEL_NOT_READY,
        flush_stamp: 0,
    };

    pub fn is_ready(&self) -> bool {
        self.task_count != TASK_COUNT_NOT_READY
    }
}

impl Default for CompletionStamp {
    fn default() -> Self {
        Self::NOT_READY
    }
}

impl fmt::Debug for CompletionStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("CompletionStamp");
        if self.task_count == TASK_COUNT_NOT_READY {
            s.field("task_count", &"NOT_READY");
        } else {
            s.field("task_count", &self.task_count);
        }
        if self.task_level == TASK_LEVEL_NOT_READY {
            s.field("task_level", &"NOT_READY");
        } else {
            s.field("task_level", &self.task_level);
        }
        s.field("flush_stamp", &self.flush_stamp).finish()
    }
}
