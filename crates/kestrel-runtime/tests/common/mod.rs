#![allow(dead_code)]

use std::sync::Arc;

use kestrel_runtime::csr::{HardwareBackend, RetireMode, SimulatedGpu};
use kestrel_runtime::os::{AlwaysOnAc, PowerSource};
use kestrel_runtime::{Context, Device, DeviceBuilder, HardwareFamily, KernelPayload};

/// Route `tracing` output through the test harness so it shows up for failing tests only.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn simulated_device(
    family: HardwareFamily,
    mode: RetireMode,
    power: Arc<dyn PowerSource>,
) -> (Arc<Device>, Arc<SimulatedGpu>) {
    let gpu = Arc::new(SimulatedGpu::new(mode));
    let device = DeviceBuilder::new(family)
        .backend(Box::new(HardwareBackend::new(gpu.clone())))
        .power_source(power)
        .build()
        .unwrap();
    (device, gpu)
}

pub fn simulated_context(mode: RetireMode) -> (Arc<Context>, Arc<SimulatedGpu>) {
    let (device, gpu) = simulated_device(HardwareFamily::Gen9, mode, Arc::new(AlwaysOnAc));
    (Context::new(device), gpu)
}

pub fn kernel(name: &str) -> KernelPayload {
    KernelPayload {
        name: name.into(),
        encoded: vec![0x10, 0x20, 0x30, 0x40],
        ..KernelPayload::default()
    }
}
