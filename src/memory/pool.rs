//! Stream-ordered memory pool.
//!
//! A [`Mempool`] reserves its whole backing region up front and carves
//! allocations out of a free list instead of round-tripping to the driver
//! for every allocate/deallocate pair. Every sub-range is in one of three
//! states:
//!
//! - **free** — on the free list, available to first-fit carving
//! - **in-use** — handed out to a live buffer
//! - **pending-free** — released by a buffer, but tagged with a completion
//!   event recorded on the releasing stream; the range returns to the free
//!   list only once that event has completed
//!
//! The pending state is what makes frees stream-ordered: a range can never
//! be reissued while work that may still touch it is in flight on the
//! releasing stream.
//!
//! Carving is first-fit over a free list kept sorted by offset, which makes
//! reuse deterministic: after a full synchronize, the lowest-offset fit is
//! always chosen.

use crate::device::Device;
use crate::driver::PoolBacking;
use crate::error::{Error, Result};
use crate::memory::resource::{check_size, MemoryResource};
use crate::stream::{Event, Stream};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Granularity of pool carving, in bytes.
pub const ALLOC_ALIGN: usize = 256;

fn align_up(size: usize) -> Result<usize> {
    size.checked_add(ALLOC_ALIGN - 1)
        .map(|s| s & !(ALLOC_ALIGN - 1))
        .ok_or_else(|| Error::InvalidArgument("allocation size is not representable".into()))
}

struct FreeRange {
    offset: usize,
    len: usize,
}

struct PendingRange {
    offset: usize,
    len: usize,
    event: Event,
}

struct PoolState {
    /// Free ranges, sorted by offset, adjacent ranges coalesced.
    free: Vec<FreeRange>,
    /// Live allocations: offset -> carved length.
    in_use: HashMap<usize, usize>,
    /// Released ranges waiting for their stream event.
    pending: Vec<PendingRange>,
    used_bytes: usize,
    pending_bytes: usize,
}

impl PoolState {
    fn new(capacity: usize) -> PoolState {
        PoolState {
            free: vec![FreeRange {
                offset: 0,
                len: capacity,
            }],
            in_use: HashMap::new(),
            pending: Vec::new(),
            used_bytes: 0,
            pending_bytes: 0,
        }
    }

    /// Move every pending range whose event has completed to the free list.
    fn reclaim_completed(&mut self) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].event.is_complete() {
                let done = self.pending.swap_remove(i);
                self.pending_bytes -= done.len;
                insert_free(&mut self.free, done.offset, done.len);
            } else {
                i += 1;
            }
        }
    }

    fn free_bytes(&self) -> usize {
        self.free.iter().map(|r| r.len).sum()
    }
}

/// Insert a range into the sorted free list, coalescing neighbors.
fn insert_free(free: &mut Vec<FreeRange>, offset: usize, len: usize) {
    let idx = free.partition_point(|r| r.offset < offset);
    free.insert(idx, FreeRange { offset, len });

    if idx + 1 < free.len() && free[idx].offset + free[idx].len == free[idx + 1].offset {
        free[idx].len += free[idx + 1].len;
        free.remove(idx + 1);
    }
    if idx > 0 && free[idx - 1].offset + free[idx - 1].len == free[idx].offset {
        free[idx - 1].len += free[idx].len;
        free.remove(idx);
    }
}

/// A [`MemoryResource`] drawing from one pre-reserved backing region.
///
/// The pool variant used here is device-bound: allocations are
/// device-accessible and not host-accessible, and `device_id` reports the
/// owning device. Total bytes handed to live buffers never exceed the
/// reserved capacity.
///
/// # Example
///
/// ```rust,ignore
/// let device = Device::new(0)?;
/// let pool = Mempool::new(&device, 1 << 20)?;
/// let buffer = pool.allocate(64 * 1024, None)?;
/// ```
pub struct Mempool {
    backing: PoolBacking,
    state: Mutex<PoolState>,
    device: Device,
}

impl Mempool {
    /// Reserve a pool of `max_size` bytes on `device`.
    ///
    /// The backing is private to this process; use
    /// [`ShareableMempool`](crate::memory::ShareableMempool) for a pool
    /// whose backing can be exported to other processes.
    pub fn new(device: &Device, max_size: usize) -> Result<Arc<Mempool>> {
        check_size(max_size)?;
        Ok(Arc::new(Mempool::from_backing(
            device,
            PoolBacking::new_private(max_size)?,
        )))
    }

    pub(crate) fn from_backing(device: &Device, backing: PoolBacking) -> Mempool {
        let capacity = backing.size();
        Mempool {
            backing,
            state: Mutex::new(PoolState::new(capacity)),
            device: device.clone(),
        }
    }

    pub(crate) fn backing(&self) -> &PoolBacking {
        &self.backing
    }

    /// The device this pool is bound to.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Identity of the physical pool, stable across export/import.
    pub fn pool_id(&self) -> u64 {
        self.backing.id()
    }

    /// Total reserved capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.backing.size()
    }

    /// Bytes currently held by live buffers.
    pub fn used_bytes(&self) -> usize {
        self.lock_state().used_bytes
    }

    /// Bytes released but still waiting for their stream event.
    pub fn pending_bytes(&self) -> usize {
        let mut state = self.lock_state();
        state.reclaim_completed();
        state.pending_bytes
    }

    /// Bytes allocatable right now.
    pub fn available_bytes(&self) -> usize {
        let mut state = self.lock_state();
        state.reclaim_completed();
        state.free_bytes()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MemoryResource for Mempool {
    fn allocate_raw(&self, size: usize, _stream: Option<&Stream>) -> Result<usize> {
        check_size(size)?;
        let aligned = align_up(size)?;

        let mut state = self.lock_state();
        state.reclaim_completed();

        let chosen = state
            .free
            .iter()
            .position(|range| range.len >= aligned);
        let Some(idx) = chosen else {
            return Err(Error::PoolExhausted {
                requested: size,
                available: state.free_bytes(),
            });
        };

        let offset = state.free[idx].offset;
        if state.free[idx].len == aligned {
            state.free.remove(idx);
        } else {
            state.free[idx].offset += aligned;
            state.free[idx].len -= aligned;
        }
        state.in_use.insert(offset, aligned);
        state.used_bytes += aligned;

        tracing::trace!(
            pool = self.backing.id(),
            offset,
            size,
            aligned,
            "pool alloc"
        );
        Ok(self.backing.base_addr() + offset)
    }

    fn deallocate(&self, handle: usize, _size: usize, stream: Option<&Stream>) -> Result<()> {
        let offset = handle
            .checked_sub(self.backing.base_addr())
            .filter(|offset| *offset < self.backing.size())
            .ok_or_else(|| {
                Error::InvalidArgument("handle does not belong to this pool".into())
            })?;

        let mut state = self.lock_state();
        if !state.in_use.contains_key(&offset) {
            return Err(Error::InvalidArgument(
                "handle was not issued by this pool".into(),
            ));
        }

        // Tag the range with a marker on the releasing stream: it becomes
        // reusable only once everything enqueued before the release is done.
        let stream = stream.unwrap_or_else(|| self.default_stream());
        let event = stream.record_event()?;

        let len = state
            .in_use
            .remove(&offset)
            .ok_or_else(|| Error::InvalidArgument("handle was not issued by this pool".into()))?;
        state.used_bytes -= len;
        state.pending_bytes += len;
        state.pending.push(PendingRange { offset, len, event });

        tracing::trace!(pool = self.backing.id(), offset, len, "pool free pending");
        Ok(())
    }

    fn is_device_accessible(&self) -> bool {
        true
    }

    fn is_host_accessible(&self) -> bool {
        false
    }

    fn device_id(&self) -> Result<u32> {
        Ok(self.device.id())
    }

    fn default_stream(&self) -> &Stream {
        self.device.default_stream()
    }
}
