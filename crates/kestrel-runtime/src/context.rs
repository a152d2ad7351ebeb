//! Contexts own the event registry and hand out queues and user events.

use std::fmt;
use std::sync::Arc;

use kestrel_shared::STATUS_COMPLETE;
use tracing::{debug, error};

use crate::device::Device;
use crate::error::{Result, RuntimeError};
use crate::event::{Event, EventInit, EventRegistry};
use crate::queue::{CommandQueue, QueueProperties};

/// Devices sharing one event namespace. Queues of different devices in the same context may
/// wait on each other's events.
pub struct Context {
    devices: Vec<Arc<Device>>,
    registry: Arc<EventRegistry>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("devices", &self.devices)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Context {
    pub fn new(device: Arc<Device>) -> Arc<Self> {
        Arc::new(Self {
            devices: vec![device],
            registry: EventRegistry::new(),
        })
    }

    pub fn with_devices(devices: Vec<Arc<Device>>) -> Result<Arc<Self>> {
        if devices.is_empty() {
            return Err(RuntimeError::InvalidValue("context without devices"));
        }
        Ok(Arc::new(Self {
            devices,
            registry: EventRegistry::new(),
        }))
    }

    /// The default device, used by [`Context::create_queue`].
    pub fn device(&self) -> &Arc<Device> {
        &self.devices[0]
    }

    pub fn devices(&self) -> &[Arc<Device>] {
        &self.devices
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn create_queue(self: &Arc<Self>, properties: QueueProperties) -> CommandQueue {
        debug!(?properties, "queue created");
        CommandQueue::new(self.clone(), self.device().clone(), properties)
    }

    pub fn create_queue_on(
        self: &Arc<Self>,
        device: &Arc<Device>,
        properties: QueueProperties,
    ) -> Result<CommandQueue> {
        if !self.devices.iter().any(|d| Arc::ptr_eq(d, device)) {
            return Err(RuntimeError::InvalidValue("device is not part of this context"));
        }
        debug!(?properties, family = ?device.family(), "queue created");
        Ok(CommandQueue::new(self.clone(), device.clone(), properties))
    }

    /// An event the application completes itself with [`Context::set_user_event_status`].
    pub fn create_user_event(&self) -> Arc<Event> {
        self.registry
            .insert_with(|id, registry| Event::new(id, registry, EventInit::user()))
    }

    /// Complete (`STATUS_COMPLETE`) or fail (a negative code) a user event. Commands blocked on
    /// it are submitted or terminated before this returns.
    pub fn set_user_event_status(&self, event: &Event, status: i32) -> Result<()> {
        self.check_owned(event)?;
        if !event.is_user_event() {
            return Err(RuntimeError::InvalidOperation("not a user event"));
        }
        if status > STATUS_COMPLETE {
            return Err(RuntimeError::InvalidValue(
                "user event status must be complete or an error code",
            ));
        }
        event.set_status(status)
    }

    pub fn retain_event(&self, event: &Event) -> Result<()> {
        self.check_owned(event)?;
        event.retain();
        Ok(())
    }

    /// Drop one application reference. The last one parks the event until it is observed
    /// finished, then it is destroyed.
    pub fn release_event(&self, event: &Event) -> Result<()> {
        self.check_owned(event)?;
        if event.release()? {
            self.registry.defer_destruction(event.id());
            self.registry.drain_pending_destruction();
        }
        Ok(())
    }

    pub fn drain_pending_destruction(&self) -> usize {
        self.registry.drain_pending_destruction()
    }

    pub fn wait_for_events(&self, events: &[Arc<Event>]) -> Result<()> {
        for event in events {
            self.check_owned(event)?;
        }
        Event::wait_for_events(events, false)
    }

    fn check_owned(&self, event: &Event) -> Result<()> {
        if event.belongs_to(&self.registry) {
            Ok(())
        } else {
            error!(id = %event.id(), "event belongs to another context");
            Err(RuntimeError::InvalidContext)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::device::DeviceBuilder;
    use crate::encoder::HardwareFamily;
    use crate::os::AlwaysOnAc;

    fn context() -> Arc<Context> {
        let device = DeviceBuilder::new(HardwareFamily::Gen9)
            .power_source(Arc::new(AlwaysOnAc))
            .build()
            .unwrap();
        Context::new(device)
    }

    #[test]
    fn user_events_accept_only_complete_or_errors() {
        let ctx = context();
        let event = ctx.create_user_event();
        assert!(matches!(
            ctx.set_user_event_status(&event, 1),
            Err(RuntimeError::InvalidValue(_))
        ));
        ctx.set_user_event_status(&event, STATUS_COMPLETE).unwrap();
        assert!(matches!(
            ctx.set_user_event_status(&event, STATUS_COMPLETE),
            Err(RuntimeError::InvalidOperation(_))
        ));
    }

    #[test]
    fn foreign_events_are_rejected() {
        let a = context();
        let b = context();
        let event = a.create_user_event();
        assert_eq!(
            b.set_user_event_status(&event, STATUS_COMPLETE),
            Err(RuntimeError::InvalidContext)
        );
        assert_eq!(b.release_event(&event), Err(RuntimeError::InvalidContext));
        assert_eq!(
            b.wait_for_events(&[event]),
            Err(RuntimeError::InvalidContext)
        );
    }

    #[test]
    fn queues_only_on_member_devices() {
        let ctx = context();
        let outsider = DeviceBuilder::new(HardwareFamily::Gen11)
            .power_source(Arc::new(AlwaysOnAc))
            .build()
            .unwrap();
        assert!(ctx
            .create_queue_on(&outsider, QueueProperties::empty())
            .is_err());
        assert!(Context::with_devices(Vec::new()).is_err());

        let shared = Context::with_devices(vec![ctx.device().clone(), outsider.clone()]).unwrap();
        let q = shared
            .create_queue_on(&outsider, QueueProperties::empty())
            .unwrap();
        assert!(Arc::ptr_eq(q.csr(), outsider.csr()));
    }

    #[test]
    fn released_events_are_destroyed_once_finished() {
        let ctx = context();
        let event = ctx.create_user_event();
        ctx.retain_event(&event).unwrap();
        ctx.release_event(&event).unwrap();
        assert_eq!(ctx.registry().pending_destruction_len(), 0);

        ctx.release_event(&event).unwrap();
        assert_eq!(ctx.registry().pending_destruction_len(), 1);
        assert!(ctx.registry().contains(event.id()));

        ctx.set_user_event_status(&event, STATUS_COMPLETE).unwrap();
        assert_eq!(ctx.drain_pending_destruction(), 1);
        assert!(!ctx.registry().contains(event.id()));
    }
}
