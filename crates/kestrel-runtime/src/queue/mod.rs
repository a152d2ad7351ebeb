//! Command queues: the single admission point for work.
//!
//! Every enqueue goes through [`CommandQueue::enqueue`], which decides whether the command can be
//! encoded and flushed right away or has to wait behind dependencies that have not been submitted
//! yet. A deferred command leaves the command stream untouched; it is installed on its event and
//! encoded later by whichever thread releases its last blocking parent.
//!
//! In-order queues chain deferred commands through the queue's *virtual event*, the most recent
//! blocked command. Out-of-order queues only do that for markers and barriers.

mod command;

pub use command::{EnqueueCommand, KernelPayload};

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bitflags::bitflags;
use kestrel_shared::{ExecutionStatus, STATUS_COMPLETE, STATUS_SUBMITTED};
use tracing::{debug, warn};

use self::command::{PreparedCommand, Work};
use crate::context::Context;
use crate::csr::{BatchBuffer, CommandStreamReceiver};
use crate::device::Device;
use crate::encoder::HeapBases;
use crate::error::{Result, RuntimeError};
use crate::event::{CommandType, DeferredCommand, Event, EventInit};
use crate::memory::{AllocationId, AllocationKind, GraphicsAllocation};
use crate::stream::{HeapKind, IndirectHeap, LinearStream};
use crate::sync::{lock, Backoff};
use crate::token::{CompletionStamp, TASK_COUNT_NOT_READY, TASK_LEVEL_NOT_READY};

bitflags! {
    #[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
    pub struct QueueProperties: u32 {
        const OUT_OF_ORDER_EXEC_MODE_ENABLE = 1 << 0;
        const PROFILING_ENABLE = 1 << 1;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueOrdering {
    InOrder,
    OutOfOrder,
}

/// Where a queue-owned buffer currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    pub allocation: AllocationId,
    pub gpu_address: u64,
    pub capacity: usize,
    pub used: usize,
}

impl BufferInfo {
    fn of(stream: &LinearStream) -> Self {
        Self {
            allocation: stream.allocation().id(),
            gpu_address: stream.gpu_address(),
            capacity: stream.capacity(),
            used: stream.used(),
        }
    }
}

struct QueueState {
    task_level: u32,
    task_count: u32,
    flush_stamp: u64,
    virtual_event: Option<Weak<Event>>,
    /// Deferred commands not yet submitted; consulted by out-of-order barriers.
    blocked: Vec<Weak<Event>>,
    command_stream: Option<LinearStream>,
    heaps: [Option<IndirectHeap>; 4],
}

impl QueueState {
    fn prune_blocked(&mut self) {
        self.blocked.retain(|weak| {
            weak.upgrade()
                .is_some_and(|event| event.raw_status() > STATUS_SUBMITTED)
        });
    }

    fn clear_virtual_event(&mut self, event: &Event) {
        let is_current = self
            .virtual_event
            .as_ref()
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), event));
        if is_current {
            self.virtual_event = None;
        }
        event.set_current_virtual(false);
    }
}

struct Admission {
    task_level: u32,
    parents: Vec<Arc<Event>>,
}

pub(crate) struct QueueInner {
    context: Arc<Context>,
    device: Arc<Device>,
    csr: Arc<CommandStreamReceiver>,
    ordering: QueueOrdering,
    profiling: bool,
    state: Mutex<QueueState>,
    deferred_commands: AtomicU32,
}

#[derive(Clone)]
pub struct CommandQueue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("ordering", &self.inner.ordering)
            .field("task_level", &self.task_level())
            .field("task_count", &self.task_count())
            .field("deferred", &self.deferred_command_count())
            .finish()
    }
}

impl CommandQueue {
    pub(crate) fn new(
        context: Arc<Context>,
        device: Arc<Device>,
        properties: QueueProperties,
    ) -> Self {
        let csr = device.csr().clone();
        let ordering = if properties.contains(QueueProperties::OUT_OF_ORDER_EXEC_MODE_ENABLE) {
            QueueOrdering::OutOfOrder
        } else {
            QueueOrdering::InOrder
        };
        Self {
            inner: Arc::new(QueueInner {
                context,
                device,
                csr,
                ordering,
                profiling: properties.contains(QueueProperties::PROFILING_ENABLE),
                state: Mutex::new(QueueState {
                    task_level: 0,
                    task_count: 0,
                    flush_stamp: 0,
                    virtual_event: None,
                    blocked: Vec::new(),
                    command_stream: None,
                    heaps: Default::default(),
                }),
                deferred_commands: AtomicU32::new(0),
            }),
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.inner.context
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    pub fn csr(&self) -> &Arc<CommandStreamReceiver> {
        &self.inner.csr
    }

    pub fn ordering(&self) -> QueueOrdering {
        self.inner.ordering
    }

    pub fn is_profiling_enabled(&self) -> bool {
        self.inner.profiling
    }

    pub fn task_level(&self) -> u32 {
        lock(&self.inner.state).task_level
    }

    /// Task count of the last flush issued for this queue.
    pub fn task_count(&self) -> u32 {
        lock(&self.inner.state).task_count
    }

    pub fn flush_stamp(&self) -> u64 {
        lock(&self.inner.state).flush_stamp
    }

    pub fn deferred_command_count(&self) -> u32 {
        self.inner.deferred_commands.load(Ordering::Acquire)
    }

    /// The most recent deferred command, while it is still blocked.
    pub fn virtual_event(&self) -> Option<Arc<Event>> {
        lock(&self.inner.state)
            .virtual_event
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Whether any deferred command of this queue is still waiting on a dependency.
    pub fn is_blocked(&self) -> bool {
        let mut state = lock(&self.inner.state);
        state.prune_blocked();
        !state.blocked.is_empty()
    }

    pub fn command_stream(&self) -> Option<BufferInfo> {
        lock(&self.inner.state)
            .command_stream
            .as_ref()
            .map(BufferInfo::of)
    }

    pub fn indirect_heap(&self, kind: HeapKind) -> Option<BufferInfo> {
        lock(&self.inner.state).heaps[kind.index()]
            .as_ref()
            .map(|heap| BufferInfo::of(heap.stream()))
    }

    /// Reserve `min_size` bytes in the command stream, replacing the buffer if it is too full.
    pub fn get_cs(&self, min_size: usize) -> Result<BufferInfo> {
        let mut state = lock(&self.inner.state);
        let stream = self.inner.ensure_command_stream(&mut state, min_size)?;
        Ok(BufferInfo::of(stream))
    }

    /// Reserve `min_size` bytes in the heap of `kind`, replacing the buffer if it is too full.
    pub fn get_indirect_heap(&self, kind: HeapKind, min_size: usize) -> Result<BufferInfo> {
        let mut state = lock(&self.inner.state);
        let heap = self.inner.ensure_heap(&mut state, kind, min_size)?;
        Ok(BufferInfo::of(heap.stream()))
    }

    /// The task level a regular command waiting on `wait_list` would get, and whether it would
    /// be deferred.
    pub fn obtain_task_level_and_blocked_status(&self, wait_list: &[Arc<Event>]) -> (u32, bool) {
        for dep in wait_list {
            dep.update_execution_status();
        }
        let mut state = lock(&self.inner.state);
        let barrier_like = self.inner.ordering == QueueOrdering::InOrder;
        let admission = self.inner.admit(&mut state, wait_list, barrier_like);
        (admission.task_level, !admission.parents.is_empty())
    }

    /// Admit `command` behind `wait_list`.
    ///
    /// The returned event carries one application reference; hand it back with
    /// [`Context::release_event`]. Blocking enqueues return only after the command has completed
    /// and fail with [`RuntimeError::ExecStatusErrorForEventsInWaitList`] if it was terminated.
    pub fn enqueue(
        &self,
        command: EnqueueCommand,
        wait_list: &[Arc<Event>],
        blocking: bool,
    ) -> Result<Arc<Event>> {
        let inner = &self.inner;
        let registry = inner.context.registry();
        if wait_list.iter().any(|dep| !dep.belongs_to(registry)) {
            return Err(RuntimeError::InvalidContext);
        }

        let command_type = command.command_type();
        let barrier_like =
            inner.ordering == QueueOrdering::InOrder || command.is_barrier_like();
        let mut prepared = command::prepare(
            command,
            inner.device.memory().as_ref(),
            inner.device.capabilities().max_fill_pattern_size,
        )?;
        inner.device.stats().inc_enqueues();

        for dep in wait_list {
            dep.update_execution_status();
        }
        if let Some(status) = wait_list
            .iter()
            .map(|dep| dep.raw_status())
            .find(|status| *status < STATUS_COMPLETE)
        {
            let event = inner.create_event(command_type, self.task_level());
            inner.attach_staging(&event, &mut prepared);
            event.transition(status);
            warn!(id = %event.id(), ?command_type, status, "dependency terminated, command dropped");
            return inner.finish_enqueue(event, blocking);
        }

        let mut state = lock(&inner.state);
        let Admission {
            task_level,
            parents,
        } = inner.admit(&mut state, wait_list, barrier_like);
        let previous_level = state.task_level;
        state.task_level = state.task_level.max(task_level);

        let event = inner.create_event(command_type, task_level);
        inner.attach_staging(&event, &mut prepared);

        if !parents.is_empty() {
            event.begin_admission();
            event.install_command(Box::new(BlockedCommand {
                queue: inner.clone(),
                prepared,
                wait_list: wait_list.to_vec(),
                _guard: DeferredGuard::new(inner),
            }))?;
            if barrier_like {
                if let Some(previous) = state.virtual_event.take().and_then(|w| w.upgrade()) {
                    previous.set_current_virtual(false);
                }
                event.set_current_virtual(true);
                state.virtual_event = Some(Arc::downgrade(&event));
            }
            state.prune_blocked();
            state.blocked.push(Arc::downgrade(&event));
            drop(state);

            for parent in &parents {
                parent.add_child(&event);
            }
            inner.device.stats().inc_blocked_enqueues();
            debug!(
                id = %event.id(),
                ?command_type,
                task_level,
                parents = parents.len(),
                "enqueue blocked"
            );
            event.release_admission_guard();
            return inner.finish_enqueue(event, blocking);
        }

        let submitted = inner.submit_locked(&mut state, &prepared, task_level, wait_list);
        if submitted.is_err() {
            state.task_level = previous_level;
        }
        drop(state);
        match submitted {
            Ok(stamp) => {
                debug!(
                    id = %event.id(),
                    ?command_type,
                    task_level,
                    task_count = stamp.task_count,
                    "enqueue submitted"
                );
                event.mark_submitted(stamp)?;
                inner.finish_enqueue(event, blocking)
            }
            Err(err) => {
                warn!(id = %event.id(), ?command_type, %err, "enqueue failed");
                event.transition(err.code());
                registry.remove(event.id());
                Err(err)
            }
        }
    }

    /// [`CommandQueue::enqueue`] for callers that do not keep the event.
    pub fn enqueue_without_event(
        &self,
        command: EnqueueCommand,
        wait_list: &[Arc<Event>],
        blocking: bool,
    ) -> Result<()> {
        let event = self.enqueue(command, wait_list, blocking)?;
        self.inner.context.release_event(&event)
    }

    pub fn enqueue_kernel(
        &self,
        payload: KernelPayload,
        wait_list: &[Arc<Event>],
    ) -> Result<Arc<Event>> {
        self.enqueue(EnqueueCommand::Kernel(payload), wait_list, false)
    }

    pub fn enqueue_marker(&self, wait_list: &[Arc<Event>]) -> Result<Arc<Event>> {
        self.enqueue(EnqueueCommand::Marker, wait_list, false)
    }

    pub fn enqueue_barrier(&self, wait_list: &[Arc<Event>]) -> Result<Arc<Event>> {
        self.enqueue(EnqueueCommand::Barrier, wait_list, false)
    }

    pub fn enqueue_write_buffer(
        &self,
        dst: &Arc<GraphicsAllocation>,
        offset: usize,
        data: &[u8],
        wait_list: &[Arc<Event>],
        blocking: bool,
    ) -> Result<Arc<Event>> {
        self.enqueue(
            EnqueueCommand::WriteBuffer {
                dst: dst.clone(),
                offset,
                data: data.to_vec(),
            },
            wait_list,
            blocking,
        )
    }

    pub fn enqueue_read_buffer(
        &self,
        src: &Arc<GraphicsAllocation>,
        offset: usize,
        size: usize,
        dst: Arc<Mutex<Vec<u8>>>,
        wait_list: &[Arc<Event>],
        blocking: bool,
    ) -> Result<Arc<Event>> {
        self.enqueue(
            EnqueueCommand::ReadBuffer {
                src: src.clone(),
                offset,
                size,
                dst,
            },
            wait_list,
            blocking,
        )
    }

    /// Wait until everything enqueued so far has completed.
    ///
    /// Deferred commands must be released by their dependencies first; finishing a queue that is
    /// blocked on a user event nobody sets does not return.
    pub fn finish(&self) -> Result<()> {
        let mut backoff = Backoff::new();
        while self.deferred_command_count() > 0 {
            let blocked: Vec<Arc<Event>> = {
                let mut state = lock(&self.inner.state);
                state.prune_blocked();
                state.blocked.iter().filter_map(Weak::upgrade).collect()
            };
            for event in &blocked {
                event.poll_ancestors();
            }
            backoff.snooze();
        }
        let (task_count, flush_stamp) = {
            let state = lock(&self.inner.state);
            (state.task_count, state.flush_stamp)
        };
        if flush_stamp > 0 {
            self.inner
                .csr
                .wait_for_task_count_with_kmd_notify_fallback(task_count, flush_stamp, false)?;
        }
        self.inner.context.drain_pending_destruction();
        Ok(())
    }
}

impl QueueInner {
    fn create_event(&self, command_type: CommandType, task_level: u32) -> Arc<Event> {
        let init = EventInit {
            command_type,
            csr: Some(self.csr.clone()),
            task_level,
            profiling: self.profiling,
        };
        self.context
            .registry()
            .insert_with(|id, registry| Event::new(id, registry, init))
    }

    fn attach_staging(&self, event: &Event, prepared: &mut PreparedCommand) {
        if let Some(staging) = prepared.staging.take() {
            let callback = staging.into_callback(self.device.memory().clone());
            if let Err(err) = event.add_callback(ExecutionStatus::Complete, callback) {
                warn!(id = %event.id(), %err, "staging release not registered");
            }
        }
    }

    fn finish_enqueue(&self, event: Arc<Event>, blocking: bool) -> Result<Arc<Event>> {
        if blocking {
            event.wait(true, false)?;
            let status = event.raw_status();
            if status < STATUS_COMPLETE {
                return Err(RuntimeError::ExecStatusErrorForEventsInWaitList { status });
            }
        }
        Ok(event)
    }

    /// Task level and blocking parents for a command waiting on `wait_list`.
    ///
    /// A dependency blocks while it is unsubmitted, or while it is unfinished on another
    /// receiver. Statuses are read as last polled; the caller polls `wait_list` before locking.
    fn admit(
        &self,
        state: &mut QueueState,
        wait_list: &[Arc<Event>],
        barrier_like: bool,
    ) -> Admission {
        let dep_floor = wait_list
            .iter()
            .map(|dep| dep.task_level())
            .filter(|level| *level != TASK_LEVEL_NOT_READY)
            .max()
            .map_or(0, |level| level + 1);
        let task_level = if barrier_like {
            (state.task_level + 1).max(dep_floor)
        } else {
            state.task_level.max(dep_floor)
        };

        let mut parents: Vec<Arc<Event>> = wait_list
            .iter()
            .filter(|dep| {
                let status = dep.raw_status();
                status > STATUS_SUBMITTED || (status > STATUS_COMPLETE && !self.owns(dep))
            })
            .cloned()
            .collect();
        if let Some(virtual_event) = state.virtual_event.as_ref().and_then(Weak::upgrade) {
            if virtual_event.raw_status() > STATUS_SUBMITTED {
                parents.push(virtual_event);
            }
        }
        if barrier_like && self.ordering == QueueOrdering::OutOfOrder {
            state.prune_blocked();
            parents.extend(state.blocked.iter().filter_map(Weak::upgrade));
        }
        parents.sort_by_key(|event| event.id());
        parents.dedup_by_key(|event| event.id());

        Admission {
            task_level,
            parents,
        }
    }

    /// Whether `event` executes on this queue's receiver. User events execute nowhere and count
    /// as local.
    fn owns(&self, event: &Event) -> bool {
        event.csr().map_or(true, |csr| Arc::ptr_eq(csr, &self.csr))
    }

    fn obtain_allocation(&self, kind: AllocationKind, size: usize) -> Result<Arc<GraphicsAllocation>> {
        let memory = self.device.memory();
        match memory.obtain_reusable_allocation(kind, size, self.csr.completed_task_count()) {
            Some(reused) => Ok(reused),
            None => memory.allocate(kind, size),
        }
    }

    fn ensure_command_stream<'s>(
        &self,
        state: &'s mut QueueState,
        min_size: usize,
    ) -> Result<&'s mut LinearStream> {
        let fits = state
            .command_stream
            .as_ref()
            .is_some_and(|cs| cs.available() >= min_size);
        if !fits {
            let size = min_size.max(self.device.config().min_command_stream_size);
            let allocation = self.obtain_allocation(AllocationKind::CommandBuffer, size)?;
            match state.command_stream.as_mut() {
                Some(cs) => {
                    let old = cs.replace_buffer(allocation);
                    debug!(old = ?old.id(), new = ?cs.allocation().id(), size, "command stream replaced");
                    self.device.memory().store_reusable_allocation(old);
                    self.device.stats().inc_buffer_replacements();
                }
                None => state.command_stream = Some(LinearStream::new(allocation)),
            }
        }
        state
            .command_stream
            .as_mut()
            .ok_or(RuntimeError::InvalidOperation("command stream missing after reserve"))
    }

    fn ensure_heap<'s>(
        &self,
        state: &'s mut QueueState,
        kind: HeapKind,
        min_size: usize,
    ) -> Result<&'s mut IndirectHeap> {
        let slot = &mut state.heaps[kind.index()];
        let fits = slot.as_ref().is_some_and(|heap| heap.available() >= min_size);
        if !fits {
            let size = min_size.max(self.device.config().min_indirect_heap_size);
            let allocation = self.obtain_allocation(kind.allocation_kind(), size)?;
            match slot.as_mut() {
                Some(heap) => {
                    let old = heap.stream_mut().replace_buffer(allocation);
                    debug!(?kind, old = ?old.id(), size, "indirect heap replaced");
                    self.device.memory().store_reusable_allocation(old);
                    self.device.stats().inc_buffer_replacements();
                }
                None => *slot = Some(IndirectHeap::new(kind, allocation)),
            }
        }
        slot.as_mut()
            .ok_or(RuntimeError::InvalidOperation("indirect heap missing after reserve"))
    }

    /// Encode `prepared` and flush it. Must be called with the queue state locked; on success the
    /// queue's task count and flush stamp follow the flush.
    ///
    /// Buffers are reserved before anything is written, and the cursors are rewound if the flush
    /// fails, so a failed submission leaves the command stream and heaps as they were.
    fn submit_locked(
        &self,
        state: &mut QueueState,
        prepared: &PreparedCommand,
        task_level: u32,
        wait_list: &[Arc<Event>],
    ) -> Result<CompletionStamp> {
        let encoder = self.device.encoder();
        let body_len = match &prepared.work {
            Work::Sync => {
                let mut stamp = CompletionStamp {
                    task_count: state.task_count,
                    task_level,
                    flush_stamp: state.flush_stamp,
                };
                for dep in wait_list {
                    let same_csr = dep.csr().is_some() && self.owns(dep);
                    if same_csr && dep.task_count() != TASK_COUNT_NOT_READY {
                        stamp.task_count = stamp.task_count.max(dep.task_count());
                        stamp.flush_stamp = stamp.flush_stamp.max(dep.flush_stamp());
                    }
                }
                return Ok(stamp);
            }
            Work::Dispatch { payload, heap_data } => {
                let alignment = encoder.heap_alignment();
                let mut needed = [0usize; 4];
                for (kind, data) in heap_data {
                    needed[kind.index()] += data.len() + alignment;
                }
                for kind in HeapKind::ALL {
                    if needed[kind.index()] > 0 {
                        self.ensure_heap(state, kind, needed[kind.index()])?;
                    }
                }
                encoder.dispatch_size(payload.len())
            }
            Work::Copy { .. } => encoder.copy_size(),
            Work::Fill { pattern, .. } => encoder.fill_size(pattern.len()),
        } + encoder.batch_end_size();
        self.ensure_command_stream(state, body_len)?;

        let cursors = Cursors::of(state);
        let flushed = self.encode_and_flush(state, prepared, task_level);
        if flushed.is_err() {
            cursors.rewind(state);
        }
        let stamp = flushed?;
        state.task_count = stamp.task_count;
        state.flush_stamp = stamp.flush_stamp;
        Ok(stamp)
    }

    /// Write `prepared` into space reserved by [`QueueInner::submit_locked`] and flush it.
    fn encode_and_flush(
        &self,
        state: &mut QueueState,
        prepared: &PreparedCommand,
        task_level: u32,
    ) -> Result<CompletionStamp> {
        let encoder = self.device.encoder();
        let mut residency = prepared.residency.clone();
        let mut body = Vec::new();
        match &prepared.work {
            Work::Sync => {
                return Err(RuntimeError::InvalidOperation("sync work has no packets"));
            }
            Work::Dispatch { payload, heap_data } => {
                let alignment = encoder.heap_alignment();
                for (kind, data) in heap_data {
                    let heap = state.heaps[kind.index()].as_mut().ok_or(
                        RuntimeError::InvalidOperation("indirect heap missing after reserve"),
                    )?;
                    heap.push(data, alignment)?;
                }
                let mut bases = HeapBases::default();
                for kind in HeapKind::ALL {
                    if let Some(heap) = &state.heaps[kind.index()] {
                        bases.0[kind.index()] = heap.stream().gpu_address();
                        residency.push(heap.stream().allocation().clone());
                    }
                }
                encoder.encode_dispatch(&mut body, &bases, payload);
            }
            Work::Copy { src, dst, size } => encoder.encode_copy(&mut body, *src, *dst, *size),
            Work::Fill { dst, size, pattern } => {
                encoder.encode_fill(&mut body, *dst, *size, pattern)
            }
        }
        encoder.encode_batch_end(&mut body);

        let cs = state
            .command_stream
            .as_mut()
            .ok_or(RuntimeError::InvalidOperation("command stream missing after reserve"))?;
        let start_offset = cs.emit(&body)?;
        let batch = BatchBuffer {
            allocation: cs.allocation().clone(),
            start_offset,
            len: body.len(),
        };
        self.csr.flush(&batch, &residency, task_level)
    }
}

/// Write positions of a queue's buffers, taken once everything a submission needs is reserved.
struct Cursors {
    command_stream: usize,
    heaps: [usize; 4],
}

impl Cursors {
    fn of(state: &QueueState) -> Self {
        let mut heaps = [0; 4];
        for (used, heap) in heaps.iter_mut().zip(&state.heaps) {
            *used = heap.as_ref().map_or(0, |heap| heap.stream().used());
        }
        Self {
            command_stream: state.command_stream.as_ref().map_or(0, LinearStream::used),
            heaps,
        }
    }

    fn rewind(&self, state: &mut QueueState) {
        if let Some(cs) = state.command_stream.as_mut() {
            cs.rewind(self.command_stream);
        }
        for (used, heap) in self.heaps.iter().zip(&mut state.heaps) {
            if let Some(heap) = heap.as_mut() {
                heap.stream_mut().rewind(*used);
            }
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let memory = self.device.memory().clone();
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cs) = state.command_stream.take() {
            memory.store_reusable_allocation(cs.into_allocation());
        }
        for heap in state.heaps.iter_mut().filter_map(Option::take) {
            memory.store_reusable_allocation(heap.stream().allocation().clone());
        }
    }
}

/// Counts a queue's outstanding deferred commands for [`CommandQueue::finish`].
struct DeferredGuard {
    queue: Weak<QueueInner>,
}

impl DeferredGuard {
    fn new(queue: &Arc<QueueInner>) -> Self {
        queue.deferred_commands.fetch_add(1, Ordering::AcqRel);
        Self {
            queue: Arc::downgrade(queue),
        }
    }
}

impl Drop for DeferredGuard {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.deferred_commands.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// A command admitted while blocked. Keeps its queue alive until it runs or is aborted.
struct BlockedCommand {
    queue: Arc<QueueInner>,
    prepared: PreparedCommand,
    wait_list: Vec<Arc<Event>>,
    _guard: DeferredGuard,
}

impl DeferredCommand for BlockedCommand {
    fn submit(self: Box<Self>, event: &Event) -> Result<CompletionStamp> {
        let queue = &self.queue;
        let mut state = lock(&queue.state);
        let submitted =
            queue.submit_locked(&mut state, &self.prepared, event.task_level(), &self.wait_list);
        state.clear_virtual_event(event);
        drop(state);

        let stamp = submitted?;
        queue.device.stats().inc_deferred_submissions();
        debug!(
            id = %event.id(),
            task_level = event.task_level(),
            task_count = stamp.task_count,
            "deferred command submitted"
        );
        Ok(stamp)
    }

    fn abort(self: Box<Self>, event: &Event, status: i32) {
        self.queue.device.stats().inc_aborted_commands();
        warn!(id = %event.id(), status, "deferred command aborted");
        lock(&self.queue.state).clear_virtual_event(event);
    }
}
