use std::sync::OnceLock;
use std::time::Instant;

use kestrel_shared::{STATUS_COMPLETE, STATUS_RUNNING, STATUS_SUBMITTED};

fn origin() -> Instant {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    *ORIGIN.get_or_init(Instant::now)
}

/// Nanoseconds on the host profiling timeline.
pub(crate) fn host_timestamp_ns() -> u64 {
    origin().elapsed().as_nanos() as u64
}

/// Host timestamps recorded as an event moves through its lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProfilingInfo {
    pub queued_ns: u64,
    pub submitted_ns: Option<u64>,
    pub start_ns: Option<u64>,
    pub end_ns: Option<u64>,
}

impl ProfilingInfo {
    pub(crate) fn queued_now() -> Self {
        Self {
            queued_ns: host_timestamp_ns(),
            ..Self::default()
        }
    }

    /// Fill every timestamp `status` implies that is still missing. A jump straight from queued
    /// to complete stamps submitted, start and end with the same time.
    pub(crate) fn record(&mut self, status: i32) {
        if status < STATUS_COMPLETE {
            return;
        }
        let now = host_timestamp_ns();
        if status <= STATUS_SUBMITTED {
            self.submitted_ns.get_or_insert(now);
        }
        if status <= STATUS_RUNNING {
            self.start_ns.get_or_insert(now);
        }
        if status <= STATUS_COMPLETE {
            self.end_ns.get_or_insert(now);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.end_ns.is_some()
    }

    /// Time from start to end, once both are known.
    pub fn duration_ns(&self) -> Option<u64> {
        Some(self.end_ns?.saturating_sub(self.start_ns?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_to_complete_fills_all_timestamps_in_order() {
        let mut info = ProfilingInfo::queued_now();
        info.record(STATUS_SUBMITTED);
        let submitted = info.submitted_ns.unwrap();
        assert!(submitted >= info.queued_ns);
        assert!(!info.is_complete());

        info.record(STATUS_COMPLETE);
        assert_eq!(info.submitted_ns, Some(submitted));
        assert!(info.start_ns.unwrap() >= submitted);
        assert!(info.end_ns.unwrap() >= info.start_ns.unwrap());
        assert!(info.duration_ns().is_some());
    }

    #[test]
    fn termination_records_nothing() {
        let mut info = ProfilingInfo::queued_now();
        info.record(-5);
        assert_eq!(info.submitted_ns, None);
        assert_eq!(info.duration_ns(), None);
    }
}
