//! Adaptive wait policy.
//!
//! Before a receiver falls back to an OS-level wait it polls the tag for a while. How long, and
//! whether to poll at all, is decided here from the device's [`KmdNotifyProperties`], the distance
//! between the hardware tag and the awaited task count, a caller hint that the wait is expected to
//! be short, the AC-line state and the time since the previous wait.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::config::KmdNotifyOverrides;
use crate::os::{Clock, PowerSource};
use crate::stats::RuntimeStats;

/// The AC line is only re-read when at least this many submissions are outstanding.
pub const MINIMUM_TASK_COUNT_DIFF_TO_CHECK_AC_LINE: u32 = 10;

/// Poll budget used on battery when KMD notify is disabled.
pub const TIMEOUT_US_FOR_DISCONNECTED_AC_LINE: i64 = 10_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KmdNotifyProperties {
    pub enable_kmd_notify: bool,
    pub delay_kmd_notify_us: i64,
    pub enable_quick_kmd_sleep: bool,
    pub delay_quick_kmd_sleep_us: i64,
    pub enable_quick_kmd_sleep_for_sporadic_waits: bool,
    /// A wait starting more than this long after the previous one is sporadic.
    pub delay_quick_kmd_sleep_for_sporadic_waits_us: i64,
}

impl KmdNotifyProperties {
    pub fn with_overrides(mut self, overrides: &KmdNotifyOverrides) -> Self {
        if let Some(v) = overrides.override_enable_kmd_notify {
            self.enable_kmd_notify = v;
        }
        if let Some(v) = overrides.override_kmd_notify_delay_us {
            self.delay_kmd_notify_us = v;
        }
        if let Some(v) = overrides.override_enable_quick_kmd_sleep {
            self.enable_quick_kmd_sleep = v;
        }
        if let Some(v) = overrides.override_quick_kmd_sleep_delay_us {
            self.delay_quick_kmd_sleep_us = v;
        }
        if let Some(v) = overrides.override_enable_quick_kmd_sleep_for_sporadic_waits {
            self.enable_quick_kmd_sleep_for_sporadic_waits = v;
        }
        if let Some(v) = overrides.override_sporadic_wait_threshold_us {
            self.delay_quick_kmd_sleep_for_sporadic_waits_us = v;
        }
        self
    }
}

/// Result of [`KmdNotifyHelper::obtain_timeout_params`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitParams {
    /// `false` means poll the tag once and go straight to the OS wait.
    pub enable_timeout: bool,
    pub timeout_us: i64,
}

impl WaitParams {
    pub const SINGLE_POLL: Self = Self {
        enable_timeout: false,
        timeout_us: 0,
    };
}

#[derive(Debug)]
pub struct KmdNotifyHelper {
    properties: KmdNotifyProperties,
    power_saving_mode: bool,
    ac_line_connected: AtomicBool,
    last_wait_us: AtomicU64,
    power: Arc<dyn PowerSource>,
    clock: Arc<dyn Clock>,
    stats: Arc<RuntimeStats>,
}

impl KmdNotifyHelper {
    pub fn new(
        properties: KmdNotifyProperties,
        power_saving_mode: bool,
        power: Arc<dyn PowerSource>,
        clock: Arc<dyn Clock>,
        stats: Arc<RuntimeStats>,
    ) -> Self {
        let now = clock.now_us();
        Self {
            properties,
            power_saving_mode,
            ac_line_connected: AtomicBool::new(true),
            last_wait_us: AtomicU64::new(now),
            power,
            clock,
            stats,
        }
    }

    pub fn properties(&self) -> &KmdNotifyProperties {
        &self.properties
    }

    /// Cached AC-line state as of the last refresh.
    pub fn ac_line_connected(&self) -> bool {
        self.ac_line_connected.load(Ordering::Relaxed)
    }

    pub fn obtain_timeout_params(
        &self,
        quick_sleep_hint: bool,
        hw_tag: u32,
        task_count_to_wait: u32,
        flush_stamp_to_wait: u64,
    ) -> WaitParams {
        if flush_stamp_to_wait == 0 {
            return WaitParams::SINGLE_POLL;
        }
        if self.power_saving_mode {
            return WaitParams {
                enable_timeout: true,
                timeout_us: 1,
            };
        }

        let props = &self.properties;
        let outstanding = task_count_to_wait.saturating_sub(hw_tag);
        if !props.enable_kmd_notify && outstanding > MINIMUM_TASK_COUNT_DIFF_TO_CHECK_AC_LINE {
            self.refresh_ac_line();
        }
        let ac_line = self.ac_line_connected();

        let timeout_us = if !props.enable_kmd_notify && !ac_line {
            warn!(outstanding, "on battery; forcing short poll budget");
            TIMEOUT_US_FOR_DISCONNECTED_AC_LINE
        } else if quick_sleep_hint && props.enable_quick_kmd_sleep && !self.is_sporadic_wait() {
            props.delay_quick_kmd_sleep_us
        } else {
            props.delay_kmd_notify_us
        };

        let params = WaitParams {
            enable_timeout: props.enable_kmd_notify || !ac_line,
            timeout_us,
        };
        trace!(?params, hw_tag, task_count_to_wait, flush_stamp_to_wait, "wait params");
        params
    }

    /// Record that a wait just finished; the next wait's sporadic check measures from here.
    pub fn update_last_wait_timestamp(&self) {
        self.last_wait_us
            .store(self.clock.now_us(), Ordering::Relaxed);
    }

    fn is_sporadic_wait(&self) -> bool {
        if !self.properties.enable_quick_kmd_sleep_for_sporadic_waits {
            return false;
        }
        let since_last = self
            .clock
            .now_us()
            .saturating_sub(self.last_wait_us.load(Ordering::Relaxed));
        since_last as i64 > self.properties.delay_quick_kmd_sleep_for_sporadic_waits_us
    }

    fn refresh_ac_line(&self) {
        self.stats.inc_ac_line_refreshes();
        let connected = self.power.is_ac_line_connected();
        self.ac_line_connected.store(connected, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::os::{AlwaysOnAc, ManualClock, ManualPowerSource};
    use pretty_assertions::assert_eq;

    const NOTIFY: i64 = 150;
    const QUICK: i64 = 20;
    const SPORADIC_THRESHOLD: i64 = 1_000;

    fn props(enable_notify: bool) -> KmdNotifyProperties {
        KmdNotifyProperties {
            enable_kmd_notify: enable_notify,
            delay_kmd_notify_us: NOTIFY,
            enable_quick_kmd_sleep: true,
            delay_quick_kmd_sleep_us: QUICK,
            enable_quick_kmd_sleep_for_sporadic_waits: false,
            delay_quick_kmd_sleep_for_sporadic_waits_us: SPORADIC_THRESHOLD,
        }
    }

    struct Fixture {
        helper: KmdNotifyHelper,
        power: ManualPowerSource,
        clock: ManualClock,
        stats: Arc<RuntimeStats>,
    }

    fn fixture(properties: KmdNotifyProperties, ac: bool) -> Fixture {
        let power = ManualPowerSource::new(ac);
        let clock = ManualClock::new(1_000_000);
        let stats = Arc::new(RuntimeStats::new());
        let helper = KmdNotifyHelper::new(
            properties,
            false,
            Arc::new(power.clone()),
            Arc::new(clock.clone()),
            stats.clone(),
        );
        Fixture {
            helper,
            power,
            clock,
            stats,
        }
    }

    #[test]
    fn zero_flush_stamp_disables_timeout() {
        let f = fixture(props(true), true);
        assert_eq!(
            f.helper.obtain_timeout_params(true, 0, 100, 0),
            WaitParams::SINGLE_POLL
        );
    }

    #[test]
    fn power_saving_mode_forces_one_microsecond() {
        let helper = KmdNotifyHelper::new(
            props(true),
            true,
            Arc::new(AlwaysOnAc),
            Arc::new(ManualClock::new(0)),
            Arc::new(RuntimeStats::new()),
        );
        assert_eq!(
            helper.obtain_timeout_params(false, 0, 5, 1),
            WaitParams {
                enable_timeout: true,
                timeout_us: 1
            }
        );
    }

    #[test]
    fn small_task_count_diff_does_not_refresh_ac_line() {
        let f = fixture(props(false), false);
        f.helper.obtain_timeout_params(false, 9, 10, 1);
        assert_eq!(f.power.queries(), 0);
        assert_eq!(f.stats.snapshot().ac_line_refreshes, 0);
    }

    #[test]
    fn large_task_count_diff_refreshes_ac_line_once() {
        let f = fixture(props(false), false);
        let params = f.helper.obtain_timeout_params(false, 0, 11, 1);
        assert_eq!(f.power.queries(), 1);
        assert_eq!(f.stats.snapshot().ac_line_refreshes, 1);
        assert_eq!(
            params,
            WaitParams {
                enable_timeout: true,
                timeout_us: TIMEOUT_US_FOR_DISCONNECTED_AC_LINE
            }
        );
    }

    #[test]
    fn exactly_ten_outstanding_is_below_the_refresh_threshold() {
        let f = fixture(props(false), false);
        f.helper.obtain_timeout_params(false, 0, 10, 1);
        assert_eq!(f.power.queries(), 0);
    }

    #[test]
    fn notify_enabled_never_queries_the_ac_line() {
        let f = fixture(props(true), false);
        let params = f.helper.obtain_timeout_params(false, 0, 1_000, 1);
        assert_eq!(f.power.queries(), 0);
        assert_eq!(
            params,
            WaitParams {
                enable_timeout: true,
                timeout_us: NOTIFY
            }
        );
    }

    #[test]
    fn notify_disabled_on_ac_skips_polling() {
        let f = fixture(props(false), true);
        let params = f.helper.obtain_timeout_params(false, 0, 50, 1);
        assert!(!params.enable_timeout);
        assert!(f.helper.ac_line_connected());
    }

    #[test]
    fn quick_sleep_hint_uses_quick_delay() {
        let f = fixture(props(true), true);
        assert_eq!(f.helper.obtain_timeout_params(true, 0, 1, 1).timeout_us, QUICK);
        assert_eq!(f.helper.obtain_timeout_params(false, 0, 1, 1).timeout_us, NOTIFY);

        let mut no_quick = props(true);
        no_quick.enable_quick_kmd_sleep = false;
        let f = fixture(no_quick, true);
        assert_eq!(f.helper.obtain_timeout_params(true, 0, 1, 1).timeout_us, NOTIFY);
    }

    #[test]
    fn sporadic_wait_falls_back_to_notify_delay() {
        let mut p = props(true);
        p.enable_quick_kmd_sleep_for_sporadic_waits = true;
        let f = fixture(p, true);

        assert_eq!(f.helper.obtain_timeout_params(true, 0, 1, 1).timeout_us, QUICK);

        f.clock.advance_us(SPORADIC_THRESHOLD as u64 + 1);
        assert_eq!(f.helper.obtain_timeout_params(true, 0, 1, 1).timeout_us, NOTIFY);

        f.helper.update_last_wait_timestamp();
        assert_eq!(f.helper.obtain_timeout_params(true, 0, 1, 1).timeout_us, QUICK);
    }

    #[test]
    fn overrides_replace_only_what_they_name() {
        let overrides = KmdNotifyOverrides {
            override_enable_kmd_notify: Some(false),
            override_quick_kmd_sleep_delay_us: Some(5),
            ..Default::default()
        };
        let p = props(true).with_overrides(&overrides);
        assert!(!p.enable_kmd_notify);
        assert_eq!(p.delay_quick_kmd_sleep_us, 5);
        assert_eq!(p.delay_kmd_notify_us, NOTIFY);
    }
}
