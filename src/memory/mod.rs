//! Memory resources, owning buffers, and pools.
//!
//! The pieces fit together like this:
//!
//! - [`MemoryResource`] is the capability trait: allocate/release one kind
//!   of memory, with fixed accessibility flags and optional device affinity.
//!   [`DeviceMemoryResource`], [`PinnedMemoryResource`],
//!   [`UnifiedMemoryResource`], and [`HostMemoryResource`] are the
//!   non-pooled variants.
//! - [`Buffer`] owns one allocation and carries a back-reference to the
//!   resource that produced it; it supports stream-ordered copies and
//!   explicit close.
//! - [`Mempool`] pre-reserves a region and carves it with a stream-ordered
//!   free list. [`ShareableMempool`] is the exportable flavor;
//!   [`SharedMempool`] is an imported view of another process's pool, moved
//!   between processes as a [`ShareableHandle`] via [`ipc`].

mod buffer;
pub mod ipc;
mod pool;
mod resource;
mod shareable;

pub use buffer::Buffer;
pub use pool::{Mempool, ALLOC_ALIGN};
pub use resource::{
    DeviceMemoryResource, HostMemoryResource, MemoryResource, MemoryResourceExt,
    PinnedMemoryResource, UnifiedMemoryResource,
};
pub use shareable::{PoolDesc, ShareableHandle, ShareableMempool, SharedMempool};
