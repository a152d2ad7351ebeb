//! Events: the completion state machine of one unit of work.
//!
//! An event's status only ever decreases (`Queued=3 → Submitted=2 → Running=1 → Complete=0`, or
//! down to a negative error code). Events form a dependency graph: a child blocked on parents
//! counts its outstanding blocking parents and, once the count reaches zero, runs the deferred
//! command it was admitted with. Edges are [`EventId`]s into the owning [`EventRegistry`], and
//! notification is an explicit worklist, so deep chains never recurse and a diamond notifies
//! each edge once.
//!
//! A child on the same receiver is released as soon as its parent reaches `Submitted`, since the
//! receiver executes in submission order. A child on another receiver stays blocked until the
//! parent is `Complete`; waiters poll such parents so the release happens without a CPU wait on
//! the enqueuing thread.

mod callbacks;
mod profiling;
mod registry;

pub use callbacks::EventCallback;
pub use profiling::ProfilingInfo;
pub use registry::{EventId, EventRegistry};

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use kestrel_shared::{
    ExecutionStatus, MonotonicStatus, Transition, STATUS_COMPLETE, STATUS_SUBMITTED,
};
use tracing::{debug, error, trace, warn};

use self::callbacks::CallbackTable;
use crate::csr::CommandStreamReceiver;
use crate::error::{Result, RuntimeError};
use crate::sync::{lock, Backoff, Handoff};
use crate::token::{CompletionStamp, TASK_COUNT_NOT_READY, TASK_LEVEL_NOT_READY};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandType {
    User,
    NdRangeKernel,
    CopyBuffer,
    FillBuffer,
    ReadBuffer,
    WriteBuffer,
    Marker,
    Barrier,
}

/// Work admitted while blocked, run once the last blocking parent lets go.
pub(crate) trait DeferredCommand: Send {
    fn submit(self: Box<Self>, event: &Event) -> Result<CompletionStamp>;

    /// The event was terminated before the command could run.
    fn abort(self: Box<Self>, event: &Event, status: i32);
}

enum CommandSlot {
    Empty,
    Installed(Box<dyn DeferredCommand>),
    Consumed,
}

pub(crate) struct EventInit {
    pub command_type: CommandType,
    pub csr: Option<Arc<CommandStreamReceiver>>,
    pub task_level: u32,
    pub profiling: bool,
}

impl EventInit {
    pub fn user() -> Self {
        Self {
            command_type: CommandType::User,
            csr: None,
            task_level: 0,
            profiling: false,
        }
    }
}

type Edge = (Option<EventId>, EventId, i32);

pub struct Event {
    id: EventId,
    registry: Weak<EventRegistry>,
    command_type: CommandType,
    csr: Option<Arc<CommandStreamReceiver>>,
    status: MonotonicStatus,
    task_level: AtomicU32,
    task_count: AtomicU32,
    flush_stamp: AtomicU64,
    blocking_parents: AtomicU32,
    parents: Mutex<Vec<EventId>>,
    children: Handoff<EventId>,
    callbacks: Mutex<CallbackTable>,
    // Installed before any parent edge exists and before the admission guard is released, so the
    // thread that unblocks the event always finds it; the mutex orders install against take.
    command: Mutex<CommandSlot>,
    profiling: Option<Mutex<ProfilingInfo>>,
    api_refs: AtomicU32,
    current_virtual: AtomicBool,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("command_type", &self.command_type)
            .field("status", &self.execution_status())
            .field("stamp", &self.completion_stamp())
            .field("blocking_parents", &self.blocking_parent_count())
            .finish()
    }
}

impl Event {
    pub(crate) fn new(id: EventId, registry: Weak<EventRegistry>, init: EventInit) -> Self {
        Self {
            id,
            registry,
            command_type: init.command_type,
            csr: init.csr,
            status: MonotonicStatus::default(),
            task_level: AtomicU32::new(init.task_level),
            task_count: AtomicU32::new(TASK_COUNT_NOT_READY),
            flush_stamp: AtomicU64::new(0),
            blocking_parents: AtomicU32::new(0),
            parents: Mutex::new(Vec::new()),
            children: Handoff::default(),
            callbacks: Mutex::new(CallbackTable::default()),
            command: Mutex::new(CommandSlot::Empty),
            profiling: init
                .profiling
                .then(|| Mutex::new(ProfilingInfo::queued_now())),
            api_refs: AtomicU32::new(1),
            current_virtual: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    pub fn is_user_event(&self) -> bool {
        self.command_type == CommandType::User
    }

    pub fn csr(&self) -> Option<&Arc<CommandStreamReceiver>> {
        self.csr.as_ref()
    }

    pub(crate) fn belongs_to(&self, registry: &Arc<EventRegistry>) -> bool {
        std::ptr::eq(self.registry.as_ptr(), Arc::as_ptr(registry))
    }

    /// Current status without polling the hardware.
    pub fn execution_status(&self) -> ExecutionStatus {
        self.status.peek()
    }

    pub fn raw_status(&self) -> i32 {
        self.status.load()
    }

    pub fn task_level(&self) -> u32 {
        self.task_level.load(Ordering::Acquire)
    }

    pub fn task_count(&self) -> u32 {
        self.task_count.load(Ordering::Acquire)
    }

    pub fn flush_stamp(&self) -> u64 {
        self.flush_stamp.load(Ordering::Acquire)
    }

    pub fn completion_stamp(&self) -> CompletionStamp {
        CompletionStamp {
            task_count: self.task_count(),
            task_level: self.task_level(),
            flush_stamp: self.flush_stamp(),
        }
    }

    pub fn blocking_parent_count(&self) -> u32 {
        self.blocking_parents.load(Ordering::SeqCst)
    }

    /// Whether the event still waits on a parent. A terminated event is never blocked.
    pub fn is_blocked(&self) -> bool {
        self.blocking_parent_count() > 0 && self.status.load() > STATUS_COMPLETE
    }

    pub fn parents(&self) -> Vec<EventId> {
        lock(&self.parents).clone()
    }

    /// Children not yet notified.
    pub fn pending_child_count(&self) -> usize {
        self.children.len()
    }

    pub fn reference_count(&self) -> u32 {
        self.api_refs.load(Ordering::Acquire)
    }

    pub fn is_current_virtual_event(&self) -> bool {
        self.current_virtual.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_virtual(&self, current: bool) {
        self.current_virtual.store(current, Ordering::Release);
    }

    /// Record the task count of the submission carrying this event's work.
    ///
    /// The first real value is always accepted; afterwards the count may only stay or grow.
    pub fn update_task_count(&self, task_count: u32) -> Result<()> {
        if task_count == TASK_COUNT_NOT_READY {
            return Err(RuntimeError::InvalidValue("task count sentinel"));
        }
        let mut current = self.task_count.load(Ordering::Acquire);
        loop {
            if current != TASK_COUNT_NOT_READY && task_count < current {
                error!(id = %self.id, current, task_count, "task count moved backwards");
                return Err(RuntimeError::InvalidOperation("task count moved backwards"));
            }
            match self.task_count.compare_exchange_weak(
                current,
                task_count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn record_submission(&self, stamp: CompletionStamp) -> Result<()> {
        self.update_task_count(stamp.task_count)?;
        self.flush_stamp
            .fetch_max(stamp.flush_stamp, Ordering::AcqRel);
        let _ = self.task_level.compare_exchange(
            TASK_LEVEL_NOT_READY,
            stamp.task_level,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Ok(())
    }

    /// Record `stamp` and move to `Submitted`, releasing children.
    pub(crate) fn mark_submitted(&self, stamp: CompletionStamp) -> Result<()> {
        self.record_submission(stamp)?;
        if self.transition(STATUS_SUBMITTED) {
            self.unblock_events_blocked_by_this(STATUS_SUBMITTED);
        }
        Ok(())
    }

    /// Lower the status to `status`.
    ///
    /// A call that would not lower the status is a no-op, except on an event that already reached
    /// `Complete` or an error, where it is rejected. A command event whose command has not been
    /// submitted yet may only be terminated: its command has to run before it can complete.
    pub fn set_status(&self, status: i32) -> Result<()> {
        if status >= STATUS_COMPLETE && self.has_pending_command() {
            error!(id = %self.id, requested = status, "command not submitted yet");
            return Err(RuntimeError::InvalidOperation(
                "event command has not been submitted",
            ));
        }
        match self.status.lower_to(status) {
            Transition::Lowered { from } => {
                debug!(id = %self.id, from, to = status, "status lowered");
                if status < STATUS_COMPLETE {
                    self.abort_command(status);
                }
                self.after_transition(status);
                if status <= STATUS_SUBMITTED {
                    self.unblock_events_blocked_by_this(status);
                }
                Ok(())
            }
            Transition::Unchanged { current } if current <= STATUS_COMPLETE => {
                error!(id = %self.id, current, requested = status, "status already terminal");
                Err(RuntimeError::InvalidOperation(
                    "event already reached a terminal status",
                ))
            }
            Transition::Unchanged { .. } => Ok(()),
        }
    }

    /// Lower the status without validation; returns whether this call moved it.
    pub(crate) fn transition(&self, status: i32) -> bool {
        if self.status.lower_to(status).is_lowered() {
            self.after_transition(status);
            true
        } else {
            false
        }
    }

    fn after_transition(&self, status: i32) {
        if let Some(profiling) = &self.profiling {
            lock(profiling).record(status);
        }
        self.execute_callbacks(status);
    }

    fn terminate(&self, status: i32) -> bool {
        if !self.status.lower_to(status).is_lowered() {
            return false;
        }
        warn!(id = %self.id, status, "event terminated");
        self.abort_command(status);
        self.after_transition(status);
        true
    }

    /// Register a callback for when the status reaches `threshold` (`Submitted`, `Running` or
    /// `Complete`). Fires immediately if it already has. Callbacks made ready by the same
    /// transition run in registration order.
    pub fn add_callback(&self, threshold: ExecutionStatus, callback: EventCallback) -> Result<()> {
        let raw = CallbackTable::threshold(threshold).ok_or(RuntimeError::InvalidValue(
            "callback threshold must be submitted, running or complete",
        ))?;
        lock(&self.callbacks).push(raw, callback);
        let status = self.status.load();
        if status <= threshold.raw() {
            self.execute_callbacks(status);
        }
        Ok(())
    }

    fn execute_callbacks(&self, status: i32) {
        let ready = lock(&self.callbacks).take_ready(status);
        for (reported, callback) in ready {
            trace!(id = %self.id, reported, "callback");
            callback(self.id, reported);
        }
    }

    pub(crate) fn install_command(&self, command: Box<dyn DeferredCommand>) -> Result<()> {
        let mut slot = lock(&self.command);
        match *slot {
            CommandSlot::Empty => {
                *slot = CommandSlot::Installed(command);
                Ok(())
            }
            _ => {
                error!(id = %self.id, "command payload installed twice");
                Err(RuntimeError::InvalidOperation(
                    "command payload already installed",
                ))
            }
        }
    }

    fn take_command(&self) -> Option<Box<dyn DeferredCommand>> {
        let mut slot = lock(&self.command);
        match std::mem::replace(&mut *slot, CommandSlot::Consumed) {
            CommandSlot::Installed(command) => Some(command),
            other => {
                *slot = other;
                None
            }
        }
    }

    pub fn has_pending_command(&self) -> bool {
        matches!(*lock(&self.command), CommandSlot::Installed(_))
    }

    fn abort_command(&self, status: i32) {
        if let Some(command) = self.take_command() {
            command.abort(self, status);
        }
    }

    /// Run the deferred command. Returns the status to propagate to this event's children.
    fn submit_command(&self) -> Option<i32> {
        let command = self.take_command()?;
        let submitted = command
            .submit(self)
            .and_then(|stamp| self.record_submission(stamp));
        match submitted {
            Ok(()) => {
                self.transition(STATUS_SUBMITTED);
                let status = self.status.load();
                (status <= STATUS_SUBMITTED).then_some(status)
            }
            Err(err) => {
                warn!(id = %self.id, %err, "deferred submission failed");
                let code = err.code();
                self.terminate(code).then_some(code)
            }
        }
    }

    /// Hold the event blocked while its admission is still adding parent edges.
    pub(crate) fn begin_admission(&self) {
        self.blocking_parents.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop the admission hold; submits the command if no parent is still blocking.
    pub(crate) fn release_admission_guard(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        propagate(
            &registry,
            VecDeque::from([(None, self.id, STATUS_COMPLETE)]),
        );
    }

    /// Make `child` wait for this event.
    ///
    /// If this event has already been submitted or finished, the child is notified right away.
    pub(crate) fn add_child(&self, child: &Event) {
        child.blocking_parents.fetch_add(1, Ordering::SeqCst);
        lock(&child.parents).push(self.id);
        self.children.push(child.id);

        let status = self.status.load();
        if status <= STATUS_SUBMITTED {
            self.unblock_events_blocked_by_this(status);
        }
    }

    /// Notify every queued child that may observe this event at `status`.
    pub(crate) fn unblock_events_blocked_by_this(&self, status: i32) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let edges = self.take_children(&registry, status);
        if edges.is_empty() {
            return;
        }
        propagate(&registry, edges.into());
    }

    /// Drain the children to notify at `status`.
    ///
    /// Before `Complete`, children on another receiver stay queued. If this event completes while
    /// they are being put back, they are taken again at the completed status, so no child is left
    /// behind by a concurrent completion.
    fn take_children(&self, registry: &EventRegistry, status: i32) -> Vec<Edge> {
        let children = self.children.take_all();
        if status <= STATUS_COMPLETE {
            return children
                .into_iter()
                .map(|child| (Some(self.id), child, status))
                .collect();
        }

        let (ready, held): (Vec<EventId>, Vec<EventId>) = children
            .into_iter()
            .partition(|child| registry.get(*child).map_or(true, |c| self.shares_csr(&c)));
        let mut edges: Vec<Edge> = ready
            .into_iter()
            .map(|child| (Some(self.id), child, status))
            .collect();
        if !held.is_empty() {
            trace!(id = %self.id, held = held.len(), "cross-receiver children wait for completion");
            self.children.restore(held);
            let now = self.status.load();
            if now <= STATUS_COMPLETE {
                edges.extend(
                    self.children
                        .take_all()
                        .into_iter()
                        .map(|child| (Some(self.id), child, now)),
                );
            }
        }
        edges
    }

    fn shares_csr(&self, other: &Event) -> bool {
        match (&self.csr, &other.csr) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => true,
        }
    }

    fn release_blocking_parent(&self) -> u32 {
        let mut current = self.blocking_parents.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return 0;
            }
            match self.blocking_parents.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return current - 1,
                Err(actual) => current = actual,
            }
        }
    }

    /// One blocking parent reached `parent_status`. Returns the status to pass on to this
    /// event's own children, if it changed.
    fn on_parent_signalled(&self, parent_status: i32) -> Option<i32> {
        let remaining = self.release_blocking_parent();
        if parent_status < STATUS_COMPLETE {
            return self.terminate(parent_status).then_some(parent_status);
        }
        if remaining > 0 || self.status.load() < STATUS_COMPLETE {
            return None;
        }
        self.submit_command()
    }

    /// Poll the hardware tag and complete the event if its task count has retired.
    pub fn update_execution_status(&self) {
        if self.status.load() <= STATUS_COMPLETE {
            return;
        }
        let task_count = self.task_count();
        if task_count == TASK_COUNT_NOT_READY {
            return;
        }
        if let Some(csr) = &self.csr {
            if csr.tag().is_completed(task_count) && self.transition(STATUS_COMPLETE) {
                self.unblock_events_blocked_by_this(STATUS_COMPLETE);
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        self.update_execution_status();
        self.status.load() <= STATUS_COMPLETE
    }

    fn wait_until_submitted(&self) {
        let mut backoff = Backoff::new();
        loop {
            let status = self.status.load();
            if status <= STATUS_COMPLETE {
                return;
            }
            if status <= STATUS_SUBMITTED && self.task_count() != TASK_COUNT_NOT_READY {
                return;
            }
            if self.is_blocked() {
                self.poll_ancestors();
            }
            backoff.snooze();
        }
    }

    /// Poll every unfinished ancestor, completing those whose work has retired. This is what
    /// releases children held on a parent from another receiver.
    pub(crate) fn poll_ancestors(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut visited = HashSet::new();
        let mut work: VecDeque<EventId> = self.parents().into();
        while let Some(id) = work.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(ancestor) = registry.get(id) else {
                continue;
            };
            ancestor.update_execution_status();
            if ancestor.status.load() > STATUS_COMPLETE {
                work.extend(ancestor.parents());
            }
        }
    }

    /// Wait for completion.
    ///
    /// Non-blocking calls only poll. Blocking calls first wait for a deferred command to be
    /// submitted (or for a user event to be set), then use the receiver's two-tier wait.
    /// Returns `Ok(true)` once the event is complete or terminated.
    pub fn wait(&self, blocking: bool, quick_sleep_hint: bool) -> Result<bool> {
        self.update_execution_status();
        if self.status.load() <= STATUS_COMPLETE {
            return Ok(true);
        }
        if !blocking {
            return Ok(false);
        }

        self.wait_until_submitted();
        if self.status.load() > STATUS_COMPLETE {
            if let Some(csr) = &self.csr {
                csr.wait_for_task_count_with_kmd_notify_fallback(
                    self.task_count(),
                    self.flush_stamp(),
                    quick_sleep_hint,
                )?;
                if self.transition(STATUS_COMPLETE) {
                    self.unblock_events_blocked_by_this(STATUS_COMPLETE);
                }
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            registry.drain_pending_destruction();
        }
        Ok(true)
    }

    /// Wait for every event in `events`, with one receiver wait per distinct receiver on the
    /// highest task count among its events.
    pub fn wait_for_events(events: &[Arc<Event>], quick_sleep_hint: bool) -> Result<()> {
        if events.is_empty() {
            return Err(RuntimeError::InvalidValue("empty event wait list"));
        }

        let mut targets: Vec<(Arc<CommandStreamReceiver>, u32, u64)> = Vec::new();
        for event in events {
            event.update_execution_status();
            event.wait_until_submitted();
            if event.status.load() <= STATUS_COMPLETE {
                continue;
            }
            let Some(csr) = &event.csr else {
                continue;
            };
            let (task_count, flush_stamp) = (event.task_count(), event.flush_stamp());
            match targets.iter_mut().find(|(c, _, _)| Arc::ptr_eq(c, csr)) {
                Some(target) => {
                    target.1 = target.1.max(task_count);
                    target.2 = target.2.max(flush_stamp);
                }
                None => targets.push((csr.clone(), task_count, flush_stamp)),
            }
        }

        for (csr, task_count, flush_stamp) in &targets {
            csr.wait_for_task_count_with_kmd_notify_fallback(
                *task_count,
                *flush_stamp,
                quick_sleep_hint,
            )?;
        }

        let mut failed = None;
        let mut registries: Vec<Arc<EventRegistry>> = Vec::new();
        for event in events {
            event.update_execution_status();
            let status = event.status.load();
            if status < STATUS_COMPLETE && failed.is_none() {
                failed = Some(status);
            }
            if let Some(registry) = event.registry.upgrade() {
                if !registries.iter().any(|r| Arc::ptr_eq(r, &registry)) {
                    registries.push(registry);
                }
            }
        }
        for registry in registries {
            registry.drain_pending_destruction();
        }

        match failed {
            Some(status) => Err(RuntimeError::ExecStatusErrorForEventsInWaitList { status }),
            None => Ok(()),
        }
    }

    pub(crate) fn retain(&self) {
        self.api_refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one application reference. Returns whether it was the last.
    pub(crate) fn release(&self) -> Result<bool> {
        let mut current = self.api_refs.load(Ordering::Acquire);
        loop {
            if current == 0 {
                error!(id = %self.id, "event released more often than retained");
                return Err(RuntimeError::InvalidOperation(
                    "event released more often than retained",
                ));
            }
            match self.api_refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current == 1),
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn is_destroyable(&self) -> bool {
        self.status.load() <= STATUS_COMPLETE && !self.has_pending_command()
    }

    pub fn profiling_info(&self) -> Result<ProfilingInfo> {
        let profiling = self
            .profiling
            .as_ref()
            .ok_or(RuntimeError::ProfilingInfoNotAvailable)?;
        let info = *lock(profiling);
        if !info.is_complete() {
            return Err(RuntimeError::ProfilingInfoNotAvailable);
        }
        Ok(info)
    }
}

/// Deliver parent notifications breadth-first. `(parent, child)` edges are visited once; the
/// admission guard release uses `None` as its parent.
fn propagate(registry: &EventRegistry, mut work: VecDeque<Edge>) {
    let mut visited: HashSet<(Option<EventId>, EventId)> = HashSet::new();
    while let Some((parent, child_id, parent_status)) = work.pop_front() {
        if !visited.insert((parent, child_id)) {
            continue;
        }
        let Some(child) = registry.get(child_id) else {
            continue;
        };
        trace!(?parent, child = %child_id, parent_status, "notify child");
        let Some(child_status) = child.on_parent_signalled(parent_status) else {
            continue;
        };
        work.extend(child.take_children(registry, child_status));
    }
}

#[cfg(test)]
mod tests;
