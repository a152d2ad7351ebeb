use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::trace;

use super::{ImmediateWait, OsWaitPrimitive, Submission, SubmissionBackend};
use crate::config::CsrKind;
use crate::error::Result;
use crate::memory::{AllocationId, AllocationKind, GraphicsAllocation};
use crate::sync::lock;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AubRecord {
    /// Contents of GPU memory at `gpu_address`.
    MemoryWrite {
        gpu_address: u64,
        kind: AllocationKind,
        data: Vec<u8>,
    },
    /// Ring segment handed to the engine.
    Submit {
        task_count: u32,
        flush_stamp: u64,
        ring_address: u64,
        batch_address: u64,
    },
    /// Replay must poll `address` until it reads `value`.
    PollTag { address: u64, value: u32 },
}

/// In-memory AUB capture. Writing it to disk is left to the embedder.
#[derive(Debug, Default)]
pub struct AubTrace {
    records: Vec<AubRecord>,
}

impl AubTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[AubRecord] {
        &self.records
    }

    pub fn submissions(&self) -> usize {
        self.records
            .iter()
            .filter(|r| matches!(r, AubRecord::Submit { .. }))
            .count()
    }

    fn push(&mut self, record: AubRecord) {
        self.records.push(record);
    }
}

/// Receiver backend that captures submissions into an [`AubTrace`].
///
/// There is no engine behind a capture, so a submission counts as retired once recorded: the tag
/// is written with the submission's task count and the poll is recorded for replay.
#[derive(Debug)]
pub struct AubBackend {
    trace: Arc<Mutex<AubTrace>>,
    dumped: HashSet<AllocationId>,
}

impl AubBackend {
    pub fn new(trace: Arc<Mutex<AubTrace>>) -> Self {
        Self {
            trace,
            dumped: HashSet::new(),
        }
    }

    pub fn trace(&self) -> Arc<Mutex<AubTrace>> {
        self.trace.clone()
    }
}

impl SubmissionBackend for AubBackend {
    fn kind(&self) -> CsrKind {
        CsrKind::Aub
    }

    fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) -> Result<()> {
        if !self.dumped.insert(allocation.id()) {
            return Ok(());
        }
        let data = allocation.read(0, allocation.size())?;
        trace!(id = ?allocation.id(), bytes = data.len(), "aub: dump allocation");
        lock(&self.trace).push(AubRecord::MemoryWrite {
            gpu_address: allocation.gpu_address(),
            kind: allocation.kind(),
            data,
        });
        Ok(())
    }

    fn submit(&mut self, submission: &Submission<'_>) -> Result<()> {
        let batch = submission.batch.bytes()?;
        let mut trace = lock(&self.trace);
        trace.push(AubRecord::MemoryWrite {
            gpu_address: submission.batch.gpu_address(),
            kind: submission.batch.allocation.kind(),
            data: batch,
        });
        trace.push(AubRecord::MemoryWrite {
            gpu_address: submission.ring_address,
            kind: AllocationKind::RingBuffer,
            data: submission.ring.to_vec(),
        });
        trace.push(AubRecord::Submit {
            task_count: submission.task_count,
            flush_stamp: submission.flush_stamp,
            ring_address: submission.ring_address,
            batch_address: submission.batch.gpu_address(),
        });
        trace.push(AubRecord::PollTag {
            address: submission.tag.gpu_address(),
            value: submission.task_count,
        });
        drop(trace);

        submission.tag.signal(submission.task_count);
        Ok(())
    }

    fn wait_primitive(&self) -> Arc<dyn OsWaitPrimitive> {
        Arc::new(ImmediateWait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::csr::tests::{batch, csr_with};
    use crate::memory::{HostMemoryManager, MemoryManager};

    #[test]
    fn capture_records_dump_submit_and_poll() {
        let trace = Arc::new(Mutex::new(AubTrace::new()));
        let memory: Arc<dyn MemoryManager> = Arc::new(HostMemoryManager::new());
        let (csr, _) = csr_with(Box::new(AubBackend::new(trace.clone())), memory.clone());
        assert_eq!(csr.kind(), CsrKind::Aub);

        let b = batch(memory.as_ref(), &csr);
        let first = csr.flush(&b, &[], 0).unwrap();
        let second = csr.flush(&b, &[], 0).unwrap();
        assert_eq!((first.task_count, second.task_count), (1, 2));
        assert_eq!((first.flush_stamp, second.flush_stamp), (1, 2));
        assert!(csr.tag().is_completed(2));

        let trace = trace.lock().unwrap();
        assert_eq!(trace.submissions(), 2);
        let polls: Vec<_> = trace
            .records()
            .iter()
            .filter_map(|r| match r {
                AubRecord::PollTag { value, .. } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(polls, vec![1, 2]);

        // Batch, ring and tag allocations are dumped once each on first residency.
        let first_submit = trace
            .records()
            .iter()
            .position(|r| matches!(r, AubRecord::Submit { .. }))
            .unwrap();
        let dumps_before_first_submit = trace.records()[..first_submit]
            .iter()
            .filter(|r| matches!(r, AubRecord::MemoryWrite { .. }))
            .count();
        assert_eq!(dumps_before_first_submit, 3 + 2);
    }
}
