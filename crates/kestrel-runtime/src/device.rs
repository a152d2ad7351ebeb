//! Devices: one hardware family, its capability table and the receiver that feeds it.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{CsrKind, RuntimeConfig};
use crate::csr::{
    AubBackend, AubTrace, CommandStreamReceiver, HardwareBackend, LoopbackSimulator, RetireMode,
    SimulatedGpu, SubmissionBackend, TbxBackend,
};
use crate::encoder::{encoder_for, CommandEncoder, HardwareFamily};
use crate::error::Result;
use crate::kmd_notify::{KmdNotifyHelper, KmdNotifyProperties};
use crate::memory::{HostMemoryManager, MemoryManager};
use crate::os::{Clock, MonotonicClock, PowerSource, SysfsPowerSource};
use crate::stats::RuntimeStats;

/// Read-only capability table of a hardware family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    pub family: HardwareFamily,
    pub kmd_notify: KmdNotifyProperties,
    /// Largest pattern a fill command accepts, in bytes.
    pub max_fill_pattern_size: usize,
}

impl DeviceCapabilities {
    pub fn for_family(family: HardwareFamily) -> Self {
        let kmd_notify = match family {
            HardwareFamily::Gen9 => KmdNotifyProperties::default(),
            HardwareFamily::Gen11 | HardwareFamily::Gen12Lp => KmdNotifyProperties {
                enable_kmd_notify: true,
                delay_kmd_notify_us: 50_000,
                enable_quick_kmd_sleep: true,
                delay_quick_kmd_sleep_us: 5_000,
                enable_quick_kmd_sleep_for_sporadic_waits: true,
                delay_quick_kmd_sleep_for_sporadic_waits_us: 200_000,
            },
        };
        Self {
            family,
            kmd_notify,
            max_fill_pattern_size: 128,
        }
    }
}

pub struct DeviceBuilder {
    family: HardwareFamily,
    config: RuntimeConfig,
    backend: Option<Box<dyn SubmissionBackend>>,
    memory: Option<Arc<dyn MemoryManager>>,
    power: Option<Arc<dyn PowerSource>>,
    clock: Option<Arc<dyn Clock>>,
}

impl DeviceBuilder {
    pub fn new(family: HardwareFamily) -> Self {
        Self {
            family,
            config: RuntimeConfig::default(),
            backend: None,
            memory: None,
            power: None,
            clock: None,
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `backend` instead of the one `config.csr` selects.
    pub fn backend(mut self, backend: Box<dyn SubmissionBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn memory_manager(mut self, memory: Arc<dyn MemoryManager>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn power_source(mut self, power: Arc<dyn PowerSource>) -> Self {
        self.power = Some(power);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Arc<Device>> {
        let capabilities = DeviceCapabilities::for_family(self.family);
        let encoder = encoder_for(self.family);
        let memory = self
            .memory
            .unwrap_or_else(|| Arc::new(HostMemoryManager::new()));
        let stats = Arc::new(RuntimeStats::new());

        let backend = match self.backend {
            Some(backend) => backend,
            None => default_backend(self.config.csr, encoder.as_ref()),
        };
        let properties = capabilities
            .kmd_notify
            .with_overrides(&self.config.kmd_notify);
        let helper = KmdNotifyHelper::new(
            properties,
            self.config.power_saving_mode,
            self.power
                .unwrap_or_else(|| Arc::new(SysfsPowerSource::default())),
            self.clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::default())),
            stats.clone(),
        );
        let csr = Arc::new(CommandStreamReceiver::new(
            backend,
            encoder.clone(),
            memory.clone(),
            helper,
            stats.clone(),
            self.config.min_command_stream_size,
        )?);
        debug!(family = ?self.family, csr = ?csr.kind(), ?properties, "device created");

        Ok(Arc::new(Device {
            capabilities,
            encoder,
            memory,
            stats,
            csr,
            config: self.config,
        }))
    }
}

fn default_backend(kind: CsrKind, encoder: &dyn CommandEncoder) -> Box<dyn SubmissionBackend> {
    match kind {
        CsrKind::Hw => Box::new(HardwareBackend::new(Arc::new(SimulatedGpu::new(
            RetireMode::Immediate,
        )))),
        CsrKind::Aub => Box::new(AubBackend::new(Arc::new(Mutex::new(AubTrace::new())))),
        CsrKind::Tbx => Box::new(TbxBackend::new(Box::new(LoopbackSimulator::new(
            encoder.layout(),
        )))),
    }
}

pub struct Device {
    capabilities: DeviceCapabilities,
    encoder: Arc<dyn CommandEncoder>,
    memory: Arc<dyn MemoryManager>,
    stats: Arc<RuntimeStats>,
    csr: Arc<CommandStreamReceiver>,
    config: RuntimeConfig,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("family", &self.capabilities.family)
            .field("csr", &self.csr)
            .finish()
    }
}

impl Device {
    pub fn family(&self) -> HardwareFamily {
        self.capabilities.family
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    pub fn encoder(&self) -> &Arc<dyn CommandEncoder> {
        &self.encoder
    }

    pub fn memory(&self) -> &Arc<dyn MemoryManager> {
        &self.memory
    }

    pub fn stats(&self) -> &Arc<RuntimeStats> {
        &self.stats
    }

    pub fn csr(&self) -> &Arc<CommandStreamReceiver> {
        &self.csr
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
}
