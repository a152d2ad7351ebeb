//! Kestrel: command admission and completion tracking for GPU compute queues.
//!
//! This crate re-exports [`kestrel_runtime`]. Embedders build a [`Device`] with
//! [`DeviceBuilder`], wrap it in a [`Context`] and enqueue work through a [`CommandQueue`]:
//!
//! ```no_run
//! use kestrel::{Context, DeviceBuilder, HardwareFamily, QueueProperties};
//!
//! # fn main() -> kestrel::Result<()> {
//! let device = DeviceBuilder::new(HardwareFamily::Gen12Lp).build()?;
//! let ctx = Context::new(device);
//! let queue = ctx.create_queue(QueueProperties::empty());
//!
//! let gate = ctx.create_user_event();
//! let marker = queue.enqueue_marker(&[gate.clone()])?;
//! ctx.set_user_event_status(&gate, kestrel::STATUS_COMPLETE)?;
//! ctx.wait_for_events(&[marker])?;
//! # Ok(())
//! # }
//! ```

pub use kestrel_runtime::*;
