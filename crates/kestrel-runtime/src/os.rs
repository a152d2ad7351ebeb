//! Host environment queried by the wait policy: AC-line state and a microsecond clock.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::trace;

pub trait PowerSource: Send + Sync + fmt::Debug {
    /// Whether the machine currently runs on mains power.
    fn is_ac_line_connected(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysOnAc;

impl PowerSource for AlwaysOnAc {
    fn is_ac_line_connected(&self) -> bool {
        true
    }
}

/// Reads `/sys/class/power_supply/<name>/online`.
///
/// A missing or unreadable file is treated as AC power (desktops have no AC supply node).
#[derive(Debug, Clone)]
pub struct SysfsPowerSource {
    online_path: PathBuf,
}

impl Default for SysfsPowerSource {
    fn default() -> Self {
        Self::new("/sys/class/power_supply/AC/online")
    }
}

impl SysfsPowerSource {
    pub fn new(online_path: impl Into<PathBuf>) -> Self {
        Self {
            online_path: online_path.into(),
        }
    }
}

impl PowerSource for SysfsPowerSource {
    fn is_ac_line_connected(&self) -> bool {
        match std::fs::read_to_string(&self.online_path) {
            Ok(raw) => raw.trim() != "0",
            Err(err) => {
                trace!(path = %self.online_path.display(), %err, "no AC supply node");
                true
            }
        }
    }
}

/// Switchable power source for tests; also counts queries.
#[derive(Debug, Clone)]
pub struct ManualPowerSource {
    connected: Arc<AtomicBool>,
    queries: Arc<AtomicU64>,
}

impl ManualPowerSource {
    pub fn new(connected: bool) -> Self {
        Self {
            connected: Arc::new(AtomicBool::new(connected)),
            queries: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn queries(&self) -> u64 {
        self.queries.load(Ordering::SeqCst)
    }
}

impl PowerSource for ManualPowerSource {
    fn is_ac_line_connected(&self) -> bool {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.connected.load(Ordering::SeqCst)
    }
}

pub trait Clock: Send + Sync + fmt::Debug {
    fn now_us(&self) -> u64;
}

#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_us: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_us)),
        }
    }

    pub fn advance_us(&self, delta: u64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
