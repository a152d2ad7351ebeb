use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use super::{ImmediateWait, OsWaitPrimitive, Submission, SubmissionBackend};
use crate::config::CsrKind;
use crate::encoder::{decode_packets, Packet, PacketLayout};
use crate::error::{Result, RuntimeError};
use crate::memory::GraphicsAllocation;
use crate::sync::lock;

/// Ring segment start address. Written before [`RING_TAIL_REGISTER`].
pub const RING_START_REGISTER: u32 = 0x2034;
/// Ring segment length in bytes. Writing it rings the doorbell.
pub const RING_TAIL_REGISTER: u32 = 0x2030;

/// Transport to a remote hardware simulator.
pub trait SimulatorLink: Send + fmt::Debug {
    fn write_memory(&mut self, gpu_address: u64, bytes: &[u8]) -> Result<()>;

    fn write_register(&mut self, offset: u32, value: u64) -> Result<()>;

    fn read_memory(&mut self, gpu_address: u64, len: usize) -> Result<Vec<u8>>;
}

/// Receiver backend that mirrors memory to a simulator and drives its ring registers.
#[derive(Debug)]
pub struct TbxBackend {
    link: Box<dyn SimulatorLink>,
}

impl TbxBackend {
    pub fn new(link: Box<dyn SimulatorLink>) -> Self {
        Self { link }
    }
}

impl SubmissionBackend for TbxBackend {
    fn kind(&self) -> CsrKind {
        CsrKind::Tbx
    }

    fn make_resident(&mut self, allocation: &Arc<GraphicsAllocation>) -> Result<()> {
        let data = allocation.read(0, allocation.size())?;
        trace!(id = ?allocation.id(), bytes = data.len(), "tbx: upload");
        self.link.write_memory(allocation.gpu_address(), &data)
    }

    fn submit(&mut self, submission: &Submission<'_>) -> Result<()> {
        self.link
            .write_memory(submission.batch.gpu_address(), &submission.batch.bytes()?)?;
        self.link
            .write_memory(submission.ring_address, submission.ring)?;
        self.link
            .write_register(RING_START_REGISTER, submission.ring_address)?;
        self.link
            .write_register(RING_TAIL_REGISTER, submission.ring.len() as u64)?;

        let raw = self.link.read_memory(submission.tag.gpu_address(), 4)?;
        let bytes: [u8; 4] = raw
            .as_slice()
            .try_into()
            .map_err(|_| RuntimeError::Backend("short tag read from simulator".into()))?;
        let value = u32::from_le_bytes(bytes);
        debug!(task_count = submission.task_count, tag = value, "tbx: submitted");
        submission.tag.signal(value);
        Ok(())
    }

    fn wait_primitive(&self) -> Arc<dyn OsWaitPrimitive> {
        Arc::new(ImmediateWait)
    }
}

const SIM_PAGE: u64 = 4096;

#[derive(Debug, Default)]
struct LoopbackState {
    pages: HashMap<u64, Vec<u8>>,
    registers: HashMap<u32, u64>,
    memory_writes: u64,
    doorbells: u64,
}

impl LoopbackState {
    fn write(&mut self, gpu_address: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            let addr = gpu_address + i as u64;
            let page = self
                .pages
                .entry(addr / SIM_PAGE)
                .or_insert_with(|| vec![0; SIM_PAGE as usize]);
            page[(addr % SIM_PAGE) as usize] = *byte;
        }
    }

    fn read(&self, gpu_address: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                let addr = gpu_address + i;
                self.pages
                    .get(&(addr / SIM_PAGE))
                    .map_or(0, |page| page[(addr % SIM_PAGE) as usize])
            })
            .collect()
    }

    fn execute_ring(&mut self, layout: &PacketLayout, start: u64, len: usize) {
        let ring = self.read(start, len);
        for packet in decode_packets(layout, &ring) {
            if let Packet::StoreTag { address, value } = packet {
                self.write(address, &value.to_le_bytes());
            }
        }
    }
}

/// In-process stand-in for a simulator on the other end of a socket.
///
/// Clones share the simulated memory. Ringing the doorbell executes the tag stores of the ring
/// segment; batches are stored but not interpreted.
#[derive(Clone, Debug)]
pub struct LoopbackSimulator {
    layout: &'static PacketLayout,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackSimulator {
    pub fn new(layout: &'static PacketLayout) -> Self {
        Self {
            layout,
            state: Arc::new(Mutex::new(LoopbackState::default())),
        }
    }

    pub fn register(&self, offset: u32) -> Option<u64> {
        lock(&self.state).registers.get(&offset).copied()
    }

    pub fn memory_writes(&self) -> u64 {
        lock(&self.state).memory_writes
    }

    pub fn doorbells(&self) -> u64 {
        lock(&self.state).doorbells
    }

    pub fn peek(&self, gpu_address: u64, len: usize) -> Vec<u8> {
        lock(&self.state).read(gpu_address, len)
    }
}

impl SimulatorLink for LoopbackSimulator {
    fn write_memory(&mut self, gpu_address: u64, bytes: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        state.memory_writes += 1;
        state.write(gpu_address, bytes);
        Ok(())
    }

    fn write_register(&mut self, offset: u32, value: u64) -> Result<()> {
        let mut state = lock(&self.state);
        state.registers.insert(offset, value);
        if offset == RING_TAIL_REGISTER {
            let start = state
                .registers
                .get(&RING_START_REGISTER)
                .copied()
                .ok_or(RuntimeError::Backend("doorbell without ring start".into()))?;
            state.doorbells += 1;
            state.execute_ring(self.layout, start, value as usize);
        }
        Ok(())
    }

    fn read_memory(&mut self, gpu_address: u64, len: usize) -> Result<Vec<u8>> {
        Ok(lock(&self.state).read(gpu_address, len))
    }
}
