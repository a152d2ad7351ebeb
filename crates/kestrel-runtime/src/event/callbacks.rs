use kestrel_shared::{ExecutionStatus, STATUS_COMPLETE};

use super::EventId;

/// Application callback, invoked once with the event and the status that triggered it.
pub type EventCallback = Box<dyn FnOnce(EventId, i32) + Send + 'static>;

/// Pending callbacks in registration order, each with the status it waits for.
#[derive(Default)]
pub(crate) struct CallbackTable {
    pending: Vec<(i32, EventCallback)>,
}

impl CallbackTable {
    /// The raw status a callback registered for `threshold` waits for, if it is a valid one.
    pub(crate) fn threshold(threshold: ExecutionStatus) -> Option<i32> {
        match threshold {
            ExecutionStatus::Submitted | ExecutionStatus::Running | ExecutionStatus::Complete => {
                Some(threshold.raw())
            }
            _ => None,
        }
    }

    pub(crate) fn push(&mut self, threshold: i32, callback: EventCallback) {
        self.pending.push((threshold, callback));
    }

    /// Remove every callback whose threshold `status` has reached, in registration order even
    /// when `status` skipped several thresholds at once.
    ///
    /// Each returned callback is paired with the status to report: its own threshold, or the
    /// error code when `status` is negative.
    pub(crate) fn take_ready(&mut self, status: i32) -> Vec<(i32, EventCallback)> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(threshold, _)| status <= *threshold);
        self.pending = waiting;
        ready
            .into_iter()
            .map(|(threshold, cb)| {
                let reported = if status < STATUS_COMPLETE {
                    status
                } else {
                    threshold
                };
                (reported, cb)
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}
