//! Command stream receivers: the submission side of the runtime.
//!
//! A [`CommandStreamReceiver`] owns the completion contract shared by every backend: each flush
//! gets the next task count and flush stamp, every allocation the submission references is
//! stamped with that task count, and completion is observed through the hardware tag. What a
//! flush physically does is delegated to a [`SubmissionBackend`]: [`HardwareBackend`] hands the
//! batch to a kernel driver, [`AubBackend`] appends it to a capture trace and [`TbxBackend`]
//! pushes it to a remote simulator.

mod aub;
mod hardware;
mod tbx;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use kestrel_shared::TagMemory;
use tracing::{debug, error, trace, warn};

pub use aub::{AubBackend, AubRecord, AubTrace};
pub use hardware::{ExecBuffer, HardwareBackend, KernelDriver, RetireMode, SimulatedGpu};
pub use tbx::{LoopbackSimulator, SimulatorLink, TbxBackend, RING_START_REGISTER, RING_TAIL_REGISTER};

use crate::config::CsrKind;
use crate::encoder::{CommandEncoder, PacketLayout};
use crate::error::{Result, RuntimeError};
use crate::kmd_notify::KmdNotifyHelper;
use crate::memory::{AllocationId, AllocationKind, GraphicsAllocation, MemoryManager};
use crate::stats::RuntimeStats;
use crate::stream::LinearStream;
use crate::sync::{lock, Backoff};
use crate::token::CompletionStamp;

/// OS-level blocking wait keyed on a flush stamp.
pub trait OsWaitPrimitive: Send + Sync + fmt::Debug {
    /// Block until the submission carrying `flush_stamp` is reported done, or until an
    /// implementation-defined timeout. Returns whether the signal was observed.
    fn wait_until_signalled(&self, flush_stamp: u64) -> bool;
}

/// Wait primitive for backends whose submissions complete synchronously.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateWait;

impl OsWaitPrimitive for ImmediateWait {
    fn wait_until_signalled(&self, _flush_stamp: u64) -> bool {
        true
    }
}

/// A finished span of a queue's command stream, ready to be chained from the ring.
#[derive(Clone, Debug)]
pub struct BatchBuffer {
    pub allocation: Arc<GraphicsAllocation>,
    pub start_offset: usize,
    pub len: usize,
}

impl BatchBuffer {
    pub fn gpu_address(&self) -> u64 {
        self.allocation.gpu_address() + self.start_offset as u64
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        self.allocation.read(self.start_offset, self.len)
    }
}

/// Everything a backend needs to perform one flush.
#[derive(Debug)]
pub struct Submission<'a> {
    pub task_count: u32,
    pub flush_stamp: u64,
    pub layout: &'static PacketLayout,
    /// GPU address of the ring segment written for this flush.
    pub ring_address: u64,
    /// Ring segment: chain to the batch, store the task count to the tag, end.
    pub ring: &'a [u8],
    pub batch: &'a BatchBuffer,
    pub residency: &'a [Arc<GraphicsAllocation>],
    pub tag: &'a TagMemory,
}

/// The part of a receiver that differs per variant.
pub trait SubmissionBackend: Send + fmt::Debug {
    fn kind(&self) -> CsrKind;

    /// Called once per flush for every allocation the submission references.
    fn make_resident(&mut self, _allocation: &Arc<GraphicsAllocation>) -> Result<()> {
        Ok(())
    }

    fn submit(&mut self, submission: &Submission<'_>) -> Result<()>;

    fn wait_primitive(&self) -> Arc<dyn OsWaitPrimitive>;
}

struct CsrState {
    task_count: u32,
    task_level: u32,
    flush_stamp: u64,
    residency: BTreeMap<AllocationId, Weak<GraphicsAllocation>>,
    ring: Option<LinearStream>,
    backend: Box<dyn SubmissionBackend>,
}

fn submit_resident(
    backend: &mut dyn SubmissionBackend,
    submission: &Submission<'_>,
) -> Result<()> {
    for allocation in submission.residency {
        backend.make_resident(allocation)?;
    }
    backend.submit(submission)
}

pub struct CommandStreamReceiver {
    kind: CsrKind,
    tag: TagMemory,
    tag_allocation: Arc<GraphicsAllocation>,
    state: Mutex<CsrState>,
    latest_task_count: AtomicU32,
    latest_task_level: AtomicU32,
    latest_flush_stamp: AtomicU64,
    waiter: Arc<dyn OsWaitPrimitive>,
    kmd_notify: KmdNotifyHelper,
    encoder: Arc<dyn CommandEncoder>,
    memory: Arc<dyn MemoryManager>,
    stats: Arc<RuntimeStats>,
    min_ring_size: usize,
}

impl fmt::Debug for CommandStreamReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandStreamReceiver")
            .field("kind", &self.kind)
            .field("task_count", &self.task_count())
            .field("flush_stamp", &self.flush_stamp())
            .field("hw_tag", &self.tag.read())
            .finish()
    }
}

impl CommandStreamReceiver {
    pub fn new(
        backend: Box<dyn SubmissionBackend>,
        encoder: Arc<dyn CommandEncoder>,
        memory: Arc<dyn MemoryManager>,
        kmd_notify: KmdNotifyHelper,
        stats: Arc<RuntimeStats>,
        min_ring_size: usize,
    ) -> Result<Self> {
        let tag_allocation = memory.allocate(AllocationKind::TagBuffer, 4)?;
        let tag = TagMemory::new(tag_allocation.gpu_address());
        let waiter = backend.wait_primitive();
        Ok(Self {
            kind: backend.kind(),
            tag,
            tag_allocation,
            state: Mutex::new(CsrState {
                task_count: 0,
                task_level: 0,
                flush_stamp: 0,
                residency: BTreeMap::new(),
                ring: None,
                backend,
            }),
            latest_task_count: AtomicU32::new(0),
            latest_task_level: AtomicU32::new(0),
            latest_flush_stamp: AtomicU64::new(0),
            waiter,
            kmd_notify,
            encoder,
            memory,
            stats,
            min_ring_size,
        })
    }

    pub fn kind(&self) -> CsrKind {
        self.kind
    }

    pub fn tag(&self) -> &TagMemory {
        &self.tag
    }

    /// Last task count the hardware reported complete.
    pub fn completed_task_count(&self) -> u32 {
        self.tag.read()
    }

    pub fn task_count(&self) -> u32 {
        self.latest_task_count.load(Ordering::Acquire)
    }

    pub fn task_level(&self) -> u32 {
        self.latest_task_level.load(Ordering::Acquire)
    }

    pub fn flush_stamp(&self) -> u64 {
        self.latest_flush_stamp.load(Ordering::Acquire)
    }

    pub fn encoder(&self) -> &Arc<dyn CommandEncoder> {
        &self.encoder
    }

    pub fn kmd_notify(&self) -> &KmdNotifyHelper {
        &self.kmd_notify
    }

    pub fn make_resident(&self, allocation: &Arc<GraphicsAllocation>) {
        let mut state = lock(&self.state);
        state
            .residency
            .entry(allocation.id())
            .or_insert_with(|| Arc::downgrade(allocation));
    }

    pub fn make_non_resident(&self, allocation: &GraphicsAllocation) {
        lock(&self.state).residency.remove(&allocation.id());
    }

    pub fn residency_len(&self) -> usize {
        lock(&self.state).residency.len()
    }

    /// Bytes written to the current ring buffer.
    pub fn ring_used(&self) -> usize {
        lock(&self.state).ring.as_ref().map_or(0, LinearStream::used)
    }

    /// Submit `batch` with everything in `residency` and the residency list.
    ///
    /// On success every referenced allocation carries the new task count and the residency list
    /// is empty. On failure the counters, the ring cursor and the allocations' task counts are
    /// unchanged.
    pub fn flush(
        &self,
        batch: &BatchBuffer,
        residency: &[Arc<GraphicsAllocation>],
        task_level: u32,
    ) -> Result<CompletionStamp> {
        let mut state = lock(&self.state);
        let task_count = state.task_count + 1;
        let flush_stamp = state.flush_stamp + 1;

        let mut ring_bytes = Vec::with_capacity(
            self.encoder.batch_start_size()
                + self.encoder.store_tag_size()
                + self.encoder.batch_end_size(),
        );
        self.encoder
            .encode_batch_start(&mut ring_bytes, batch.gpu_address());
        self.encoder
            .encode_store_tag(&mut ring_bytes, self.tag.gpu_address(), task_count);
        self.encoder.encode_batch_end(&mut ring_bytes);

        self.ensure_ring(&mut state, ring_bytes.len())?;
        let state = &mut *state;
        let Some(ring) = state.ring.as_mut() else {
            return Err(RuntimeError::InvalidOperation("ring buffer missing after reserve"));
        };
        let ring_mark = ring.used();
        let ring_address = ring.cursor_gpu_address();
        ring.emit(&ring_bytes)?;

        let mut surfaces: BTreeMap<AllocationId, Arc<GraphicsAllocation>> = BTreeMap::new();
        surfaces.insert(batch.allocation.id(), batch.allocation.clone());
        surfaces.insert(ring.allocation().id(), ring.allocation().clone());
        surfaces.insert(self.tag_allocation.id(), self.tag_allocation.clone());
        for allocation in residency {
            surfaces
                .entry(allocation.id())
                .or_insert_with(|| allocation.clone());
        }
        for weak in state.residency.values() {
            if let Some(allocation) = weak.upgrade() {
                surfaces.entry(allocation.id()).or_insert(allocation);
            }
        }
        let surfaces: Vec<_> = surfaces.into_values().collect();

        let submission = Submission {
            task_count,
            flush_stamp,
            layout: self.encoder.layout(),
            ring_address,
            ring: &ring_bytes,
            batch,
            residency: &surfaces,
            tag: &self.tag,
        };
        if let Err(err) = submit_resident(state.backend.as_mut(), &submission) {
            ring.rewind(ring_mark);
            warn!(kind = ?self.kind, task_count, %err, "flush rejected");
            return Err(err);
        }
        for allocation in &surfaces {
            trace!(id = ?allocation.id(), task_count, "resident");
            allocation.update_residency_task_count(task_count);
        }

        state.task_count = task_count;
        state.flush_stamp = flush_stamp;
        state.task_level = state.task_level.max(task_level);
        state.residency.clear();
        self.latest_task_level
            .store(state.task_level, Ordering::Release);
        self.latest_flush_stamp
            .store(flush_stamp, Ordering::Release);
        self.latest_task_count.store(task_count, Ordering::Release);
        self.stats.inc_flushes();

        debug!(
            kind = ?self.kind,
            task_count,
            flush_stamp,
            task_level,
            surfaces = surfaces.len(),
            "flushed"
        );
        Ok(CompletionStamp {
            task_count,
            task_level,
            flush_stamp,
        })
    }

    fn ensure_ring(&self, state: &mut CsrState, needed: usize) -> Result<()> {
        if let Some(ring) = &state.ring {
            if ring.available() >= needed {
                return Ok(());
            }
        }
        let size = self.min_ring_size.max(needed);
        let completed = self.tag.read();
        let allocation = match self.memory.obtain_reusable_allocation(
            AllocationKind::RingBuffer,
            size,
            completed,
        ) {
            Some(reused) => reused,
            None => self.memory.allocate(AllocationKind::RingBuffer, size)?,
        };
        match state.ring.as_mut() {
            Some(ring) => {
                let old = ring.replace_buffer(allocation);
                self.memory.store_reusable_allocation(old);
            }
            None => state.ring = Some(LinearStream::new(allocation)),
        }
        Ok(())
    }

    /// Poll the tag for `task_count_to_wait`.
    ///
    /// With `enable_timeout` unset (or a non-positive timeout) this is a single poll.
    pub fn wait_for_completion_with_timeout(
        &self,
        enable_timeout: bool,
        timeout_us: i64,
        task_count_to_wait: u32,
    ) -> bool {
        if self.tag.is_completed(task_count_to_wait) {
            return true;
        }
        if !enable_timeout || timeout_us <= 0 {
            return false;
        }

        let deadline = Instant::now() + Duration::from_micros(timeout_us as u64);
        let mut backoff = Backoff::new();
        loop {
            if self.tag.is_completed(task_count_to_wait) {
                return true;
            }
            if Instant::now() >= deadline {
                self.stats.inc_poll_timeouts();
                trace!(task_count_to_wait, timeout_us, "poll timed out");
                return false;
            }
            backoff.snooze();
        }
    }

    /// Two-tier wait: poll per the wait policy, then block in the OS keyed on the flush stamp.
    ///
    /// If the tag still has not reached `task_count_to_wait` after the OS wait, the engine is
    /// considered hung and [`RuntimeError::GpuHang`] is returned. Callers must not retry.
    pub fn wait_for_task_count_with_kmd_notify_fallback(
        &self,
        task_count_to_wait: u32,
        flush_stamp_to_wait: u64,
        quick_sleep_hint: bool,
    ) -> Result<()> {
        let params = self.kmd_notify.obtain_timeout_params(
            quick_sleep_hint,
            self.tag.read(),
            task_count_to_wait,
            flush_stamp_to_wait,
        );

        let mut completed = self.wait_for_completion_with_timeout(
            params.enable_timeout,
            params.timeout_us,
            task_count_to_wait,
        );
        if !completed {
            self.stats.inc_os_fallback_waits();
            warn!(
                task_count_to_wait,
                flush_stamp_to_wait,
                hw_tag = self.tag.read(),
                "falling back to OS wait"
            );
            self.waiter.wait_until_signalled(flush_stamp_to_wait);
            completed = self.wait_for_completion_with_timeout(false, 0, task_count_to_wait);
        }
        self.kmd_notify.update_last_wait_timestamp();

        if !completed {
            error!(
                task_count_to_wait,
                flush_stamp_to_wait,
                hw_tag = self.tag.read(),
                "GPU hang detected"
            );
            return Err(RuntimeError::GpuHang {
                task_count: task_count_to_wait,
                flush_stamp: flush_stamp_to_wait,
            });
        }
        Ok(())
    }

    /// Wait for everything flushed so far.
    pub fn wait_for_idle(&self) -> Result<()> {
        let (task_count, flush_stamp) = {
            let state = lock(&self.state);
            (state.task_count, state.flush_stamp)
        };
        self.wait_for_task_count_with_kmd_notify_fallback(task_count, flush_stamp, false)
    }
}

impl Drop for CommandStreamReceiver {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(ring) = state.ring.take() {
            self.memory.free(ring.into_allocation());
        }
        self.memory.free(self.tag_allocation.clone());
    }
}
