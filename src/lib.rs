//! # Membrane
//!
//! A stream-ordered memory runtime: typed memory resources, owning buffers,
//! and cross-process shareable memory pools.
//!
//! Membrane models an accelerator-style memory system on plain Linux
//! primitives. Allocation, copy, and release are ordered against streams
//! (background work queues) rather than executed synchronously, and pool
//! backings built on `memfd_create` can be exported to other processes over
//! unix sockets.
//!
//! ## Features
//!
//! - **Typed resources**: device, pinned, unified, and host memory behind
//!   one [`MemoryResource`](memory::MemoryResource) trait
//! - **Owning buffers**: stream-ordered copies, explicit close, release on
//!   drop as a safety net
//! - **Stream-ordered pools**: pre-reserved backings carved by a free list
//!   whose frees wait for stream completion events
//! - **Cross-process sharing**: memfd + `SCM_RIGHTS` handle transport with
//!   rkyv-serialized descriptors
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use membrane::prelude::*;
//!
//! let device = Device::new(0)?;
//! let pinned = PinnedMemoryResource::new(&device);
//! let dev = DeviceMemoryResource::new(&device);
//!
//! let mut staging = pinned.allocate(4096, None)?;
//! let mut target = dev.allocate(4096, None)?;
//! staging.copy_to(&mut target, device.default_stream())?;
//! device.synchronize()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod device;
mod driver;
pub mod error;
pub mod memory;
pub mod stream;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::device::Device;
    pub use crate::error::{Error, Result};
    pub use crate::memory::{
        Buffer, DeviceMemoryResource, HostMemoryResource, MemoryResource, MemoryResourceExt,
        Mempool, PinnedMemoryResource, ShareableHandle, ShareableMempool, SharedMempool,
        UnifiedMemoryResource,
    };
    pub use crate::stream::{Event, Stream};
}

pub use error::{Error, Result};
