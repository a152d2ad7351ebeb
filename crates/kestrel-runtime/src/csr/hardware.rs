use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use kestrel_shared::TagMemory;
use tracing::{debug, trace, warn};

use super::{OsWaitPrimitive, Submission, SubmissionBackend};
use crate::config::CsrKind;
use crate::encoder::{decode_packets, Packet, PacketLayout};
use crate::error::{Result, RuntimeError};
use crate::memory::{AllocationId, GraphicsAllocation};
use crate::sync::lock;

/// One execbuffer call: the ring segment, the batch it chains to and the buffer objects both
/// reference.
#[derive(Clone)]
pub struct ExecBuffer {
    pub task_count: u32,
    pub flush_stamp: u64,
    pub layout: &'static PacketLayout,
    pub ring_address: u64,
    pub ring: Vec<u8>,
    pub batch_address: u64,
    pub batch: Vec<u8>,
    pub objects: Vec<Arc<GraphicsAllocation>>,
    pub tag: TagMemory,
}

impl fmt::Debug for ExecBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecBuffer")
            .field("task_count", &self.task_count)
            .field("flush_stamp", &self.flush_stamp)
            .field("ring_address", &format_args!("{:#x}", self.ring_address))
            .field("batch_address", &format_args!("{:#x}", self.batch_address))
            .field("batch_len", &self.batch.len())
            .field("objects", &self.objects.len())
            .finish()
    }
}

/// Kernel-mode driver boundary. The OS wait is keyed on the flush stamp of an exec call.
pub trait KernelDriver: OsWaitPrimitive {
    /// Bind an allocation into the GPU address space. Called once per allocation.
    fn bind(&self, _allocation: &GraphicsAllocation) -> Result<()> {
        Ok(())
    }

    fn exec(&self, exec: ExecBuffer) -> Result<()>;
}

/// Receiver backend that submits through a [`KernelDriver`].
pub struct HardwareBackend {
    driver: Arc<dyn KernelDriver>,
    waiter: Arc<dyn OsWaitPrimitive>,
    bound: HashSet<AllocationId>,
}

impl fmt::Debug for HardwareBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareBackend")
            .field("driver", &self.driver)
            .field("bound", &self.bound.len())
            .finish()
    }
}

impl HardwareBackend {
    pub fn new<D: KernelDriver + 'static>(driver: Arc<D>) -> Self {
        Self {
            waiter: driver.clone(),
            driver,
            bound: HashSet::new(),
        }
    }
}

impl SubmissionBackend for HardwareBackend {
    fn kind(&self) -> CsrKind {
        CsrKind::Hw
    }

    fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) -> Result<()> {
        if self.bound.insert(allocation.id()) {
            if let Err(err) = self.driver.bind(allocation) {
                self.bound.remove(&allocation.id());
                return Err(err);
            }
        }
        Ok(())
    }

    fn submit(&mut self, submission: &Submission<'_>) -> Result<()> {
        self.driver.exec(ExecBuffer {
            task_count: submission.task_count,
            flush_stamp: submission.flush_stamp,
            layout: submission.layout,
            ring_address: submission.ring_address,
            ring: submission.ring.to_vec(),
            batch_address: submission.batch.gpu_address(),
            batch: submission.batch.bytes()?,
            objects: submission.residency.to_vec(),
            tag: submission.tag.clone(),
        })
    }

    fn wait_primitive(&self) -> Arc<dyn OsWaitPrimitive> {
        self.waiter.clone()
    }
}

/// When the simulated engine retires an exec call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetireMode {
    /// Inside `exec`.
    Immediate,
    /// Only on [`SimulatedGpu::retire_next`] / [`SimulatedGpu::retire_all`].
    Deferred,
    /// Inside `exec`, but the tag store is lost: the driver reports completion, the tag never
    /// moves.
    DropTagWrites,
}

#[derive(Debug, Default)]
struct SimState {
    pending: VecDeque<ExecBuffer>,
    retired_flush_stamp: u64,
    submissions: u64,
    dispatches: u64,
}

/// In-process engine model behind the [`KernelDriver`] interface.
///
/// Retiring an exec call walks its ring: a batch start executes the chained batch (copies and
/// fills act on the exec's objects, dispatches are counted) and a tag store signals the tag.
#[derive(Debug)]
pub struct SimulatedGpu {
    mode: RetireMode,
    state: Mutex<SimState>,
    retired: Condvar,
    os_wait_timeout: Duration,
}

impl SimulatedGpu {
    pub fn new(mode: RetireMode) -> Self {
        Self {
            mode,
            state: Mutex::new(SimState::default()),
            retired: Condvar::new(),
            os_wait_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_os_wait_timeout(mut self, timeout: Duration) -> Self {
        self.os_wait_timeout = timeout;
        self
    }

    pub fn submission_count(&self) -> u64 {
        lock(&self.state).submissions
    }

    pub fn dispatch_count(&self) -> u64 {
        lock(&self.state).dispatches
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn retire_next(&self) -> bool {
        let mut state = lock(&self.state);
        let Some(exec) = state.pending.pop_front() else {
            return false;
        };
        self.execute(&mut state, &exec, true);
        drop(state);
        self.retired.notify_all();
        true
    }

    pub fn retire_all(&self) -> usize {
        let mut retired = 0;
        while self.retire_next() {
            retired += 1;
        }
        retired
    }

    fn execute(&self, state: &mut SimState, exec: &ExecBuffer, write_tag: bool) {
        for packet in decode_packets(exec.layout, &exec.ring) {
            match packet {
                Packet::BatchStart { address } if address == exec.batch_address => {
                    state.dispatches += run_batch(exec);
                }
                Packet::StoreTag { address, value } if address == exec.tag.gpu_address() => {
                    if write_tag {
                        exec.tag.signal(value);
                    }
                }
                other => trace!(?other, "ignored ring packet"),
            }
        }
        state.retired_flush_stamp = state.retired_flush_stamp.max(exec.flush_stamp);
        trace!(task_count = exec.task_count, flush_stamp = exec.flush_stamp, "retired");
    }
}

fn resolve<'a>(
    objects: &'a [Arc<GraphicsAllocation>],
    address: u64,
    len: u64,
) -> Option<(&'a GraphicsAllocation, usize)> {
    objects.iter().find_map(|a| {
        let start = a.gpu_address();
        let end = start + a.size() as u64;
        (address >= start && address.checked_add(len)? <= end)
            .then(|| (a.as_ref(), (address - start) as usize))
    })
}

fn run_batch(exec: &ExecBuffer) -> u64 {
    let mut dispatches = 0;
    for packet in decode_packets(exec.layout, &exec.batch) {
        match packet {
            Packet::Dispatch { .. } => dispatches += 1,
            Packet::Copy { src, dst, size } => {
                let (Some((from, src_off)), Some((to, dst_off))) = (
                    resolve(&exec.objects, src, size),
                    resolve(&exec.objects, dst, size),
                ) else {
                    warn!(src, dst, size, "copy references non-resident memory");
                    continue;
                };
                let moved = from
                    .read(src_off, size as usize)
                    .and_then(|bytes| to.write(dst_off, &bytes));
                if let Err(err) = moved {
                    warn!(%err, "copy failed");
                }
            }
            Packet::Fill { dst, size, pattern } => {
                let Some((to, off)) = resolve(&exec.objects, dst, size) else {
                    warn!(dst, size, "fill references non-resident memory");
                    continue;
                };
                if let Err(err) = to.fill(off, size as usize, &pattern) {
                    warn!(%err, "fill failed");
                }
            }
            Packet::BatchEnd => break,
            _ => {}
        }
    }
    dispatches
}

impl OsWaitPrimitive for SimulatedGpu {
    fn wait_until_signalled(&self, flush_stamp: u64) -> bool {
        let deadline = Instant::now() + self.os_wait_timeout;
        let mut state = lock(&self.state);
        while state.retired_flush_stamp < flush_stamp {
            let now = Instant::now();
            if now >= deadline {
                warn!(flush_stamp, "OS wait timed out");
                return false;
            }
            state = match self.retired.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

impl KernelDriver for SimulatedGpu {
    fn exec(&self, exec: ExecBuffer) -> Result<()> {
        if exec.ring.is_empty() {
            return Err(RuntimeError::Backend("empty ring segment".into()));
        }
        let mut state = lock(&self.state);
        state.submissions += 1;
        debug!(task_count = exec.task_count, mode = ?self.mode, "exec");
        match self.mode {
            RetireMode::Immediate => self.execute(&mut state, &exec, true),
            RetireMode::DropTagWrites => self.execute(&mut state, &exec, false),
            RetireMode::Deferred => {
                state.pending.push_back(exec);
                return Ok(());
            }
        }
        drop(state);
        self.retired.notify_all();
        Ok(())
    }
}
