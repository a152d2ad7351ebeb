use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Telemetry counters for admission, submission and waiting.
///
/// Updated with relaxed atomics from whichever thread does the work; readers take a
/// [`RuntimeStats::snapshot`].
#[derive(Debug, Default)]
pub struct RuntimeStats {
    enqueues: AtomicU64,
    blocked_enqueues: AtomicU64,
    deferred_submissions: AtomicU64,
    aborted_commands: AtomicU64,
    flushes: AtomicU64,
    poll_timeouts: AtomicU64,
    os_fallback_waits: AtomicU64,
    ac_line_refreshes: AtomicU64,
    buffer_replacements: AtomicU64,
}

impl RuntimeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_enqueues(&self) {
        self.enqueues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked_enqueues(&self) {
        self.blocked_enqueues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deferred_submissions(&self) {
        self.deferred_submissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_aborted_commands(&self) {
        self.aborted_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_flushes(&self) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_timeouts(&self) {
        self.poll_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_os_fallback_waits(&self) {
        self.os_fallback_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ac_line_refreshes(&self) {
        self.ac_line_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_buffer_replacements(&self) {
        self.buffer_replacements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RuntimeStatsSnapshot {
        RuntimeStatsSnapshot {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            blocked_enqueues: self.blocked_enqueues.load(Ordering::Relaxed),
            deferred_submissions: self.deferred_submissions.load(Ordering::Relaxed),
            aborted_commands: self.aborted_commands.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            poll_timeouts: self.poll_timeouts.load(Ordering::Relaxed),
            os_fallback_waits: self.os_fallback_waits.load(Ordering::Relaxed),
            ac_line_refreshes: self.ac_line_refreshes.load(Ordering::Relaxed),
            buffer_replacements: self.buffer_replacements.load(Ordering::Relaxed),
        }
    }

    pub fn to_json(&self) -> String {
        self.snapshot().to_json()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStatsSnapshot {
    pub enqueues: u64,
    pub blocked_enqueues: u64,
    pub deferred_submissions: u64,
    pub aborted_commands: u64,
    pub flushes: u64,
    pub poll_timeouts: u64,
    pub os_fallback_waits: u64,
    pub ac_line_refreshes: u64,
    pub buffer_replacements: u64,
}

impl RuntimeStatsSnapshot {
    pub fn to_json(&self) -> String {
        // A struct of plain integers always serializes.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
