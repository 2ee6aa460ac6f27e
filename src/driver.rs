//! Low-level allocation primitives.
//!
//! Everything in this module is a thin wrapper over raw mappings; the
//! resource types in [`crate::memory`] are policy layers that never issue a
//! syscall themselves. "Device" memory is simulated with anonymous private
//! mappings, pinned host memory additionally attempts to page-lock, and pool
//! backings come in three flavors: private (anonymous), exportable
//! (memfd + `MAP_SHARED`, so the fd can cross a process boundary), and
//! imported (a mapping of a received fd).

use crate::error::{Error, Result};
use rustix::fd::OwnedFd;
use rustix::mm::{MapFlags, ProtFlags};
use std::ffi::CString;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate a unique pool ID.
fn next_pool_id() -> u64 {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

fn map_anonymous(size: usize) -> Result<usize> {
    let ptr = unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE,
        )?
    };
    match NonNull::new(ptr.cast::<u8>()) {
        Some(ptr) => Ok(ptr.as_ptr() as usize),
        None => Err(Error::AllocationFailed("mmap returned null".into())),
    }
}

/// Allocate simulated device memory.
pub(crate) fn alloc_device(size: usize) -> Result<usize> {
    let addr = map_anonymous(size)?;
    tracing::trace!(addr, size, "device alloc");
    Ok(addr)
}

/// Allocate pinned host memory.
///
/// Page-locking is best-effort: `mlock` commonly fails under container
/// rlimits and the mapping is still usable, so failure only logs.
pub(crate) fn alloc_pinned(size: usize) -> Result<usize> {
    let addr = map_anonymous(size)?;
    if let Err(errno) = unsafe { rustix::mm::mlock(addr as *mut _, size) } {
        tracing::debug!(%errno, size, "mlock failed, continuing with unlocked pages");
    }
    tracing::trace!(addr, size, "pinned alloc");
    Ok(addr)
}

/// Allocate unified (device and host accessible) memory.
pub(crate) fn alloc_unified(size: usize) -> Result<usize> {
    let addr = map_anonymous(size)?;
    tracing::trace!(addr, size, "unified alloc");
    Ok(addr)
}

/// Allocate plain host memory with no device affinity.
pub(crate) fn alloc_host(size: usize) -> Result<usize> {
    let addr = map_anonymous(size)?;
    tracing::trace!(addr, size, "host alloc");
    Ok(addr)
}

/// Release a mapping produced by one of the `alloc_*` primitives.
///
/// # Safety
///
/// `addr`/`size` must describe exactly one live mapping returned by one of
/// the `alloc_*` primitives, released at most once.
pub(crate) unsafe fn release(addr: usize, size: usize) -> Result<()> {
    // SAFETY: caller guarantees this is a live mapping of exactly this size.
    unsafe { rustix::mm::munmap(addr as *mut _, size)? };
    tracing::trace!(addr, size, "release");
    Ok(())
}

/// Transfer direction of a copy, derived from endpoint accessibility.
///
/// An endpoint counts as the device side iff it is device-accessible and
/// not host-accessible; pinned and unified memory route as host endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CopyKind {
    /// Both endpoints host-reachable.
    HostToHost,
    /// Host source into device-only destination.
    HostToDevice,
    /// Device-only source into host-reachable destination.
    DeviceToHost,
    /// Both endpoints device-only.
    DeviceToDevice,
}

impl CopyKind {
    /// Select the copy primitive for a source/destination flag combination.
    pub(crate) fn derive(
        src_device: bool,
        src_host: bool,
        dst_device: bool,
        dst_host: bool,
    ) -> CopyKind {
        match (src_device && !src_host, dst_device && !dst_host) {
            (false, false) => CopyKind::HostToHost,
            (false, true) => CopyKind::HostToDevice,
            (true, false) => CopyKind::DeviceToHost,
            (true, true) => CopyKind::DeviceToDevice,
        }
    }
}

/// Copy `len` bytes between two allocations.
///
/// All four kinds share one memmove in this simulated driver; the kind keeps
/// the routing decision explicit and observable in traces.
///
/// # Safety
///
/// `src` and `dst` must each point at `len` readable/writable bytes inside
/// live allocations.
pub(crate) unsafe fn copy(kind: CopyKind, src: usize, dst: usize, len: usize) {
    tracing::trace!(?kind, src, dst, len, "memcpy");
    // SAFETY: caller guarantees both ranges are live; copy handles overlap.
    unsafe { std::ptr::copy(src as *const u8, dst as *mut u8, len) };
}

/// One contiguous backing region for a memory pool.
///
/// Created once per pool and carved into sub-ranges by the pool's allocator.
/// Exportable backings are memfd-based: the fd can be duplicated and sent to
/// another process, which maps the same physical pages.
pub(crate) struct PoolBacking {
    base: NonNull<u8>,
    size: usize,
    /// Present only for exportable or imported backings.
    fd: Option<OwnedFd>,
    id: u64,
}

impl PoolBacking {
    /// Reserve a private (non-exportable) backing region.
    pub(crate) fn new_private(size: usize) -> Result<PoolBacking> {
        let addr = map_anonymous(size)?;
        Ok(PoolBacking {
            base: NonNull::new(addr as *mut u8)
                .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?,
            size,
            fd: None,
            id: next_pool_id(),
        })
    }

    /// Reserve an exportable backing region (memfd + shared mapping).
    pub(crate) fn new_exportable(name: &str, size: usize) -> Result<PoolBacking> {
        let cname = CString::new(name).map_err(|e| Error::AllocationFailed(e.to_string()))?;
        let fd = rustix::fs::memfd_create(&cname, rustix::fs::MemfdFlags::CLOEXEC)?;
        rustix::fs::ftruncate(&fd, size as u64)?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )?
        };
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::AllocationFailed("mmap returned null".into()))?;

        Ok(PoolBacking {
            base,
            size,
            fd: Some(fd),
            id: next_pool_id(),
        })
    }

    /// Map another process's exported backing into this address space.
    ///
    /// `pool_id` is the exporter's pool identity and is preserved so both
    /// sides agree on which physical pool they share.
    pub(crate) fn import(fd: OwnedFd, size: usize, pool_id: u64) -> Result<PoolBacking> {
        if size == 0 {
            return Err(Error::ImportFailed("descriptor claims zero size".into()));
        }

        // A torn-down or bogus fd fails here rather than at first access.
        let stat = rustix::fs::fstat(&fd)
            .map_err(|errno| Error::ImportFailed(format!("stale or invalid handle: {errno}")))?;
        if (stat.st_size as u64) < size as u64 {
            return Err(Error::ImportFailed(format!(
                "backing is {} bytes but descriptor claims {}",
                stat.st_size, size
            )));
        }

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
            .map_err(|errno| Error::ImportFailed(format!("mapping failed: {errno}")))?
        };
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::ImportFailed("mmap returned null".into()))?;

        Ok(PoolBacking {
            base,
            size,
            fd: Some(fd),
            id: pool_id,
        })
    }

    /// Base address of the backing region.
    #[inline]
    pub(crate) fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Size of the backing region in bytes.
    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    /// Pool identity, stable across export/import.
    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Whether this backing can produce a shareable fd.
    #[inline]
    pub(crate) fn is_exportable(&self) -> bool {
        self.fd.is_some()
    }

    /// Duplicate the backing fd for transport to another process.
    pub(crate) fn export_fd(&self) -> Result<OwnedFd> {
        match &self.fd {
            Some(fd) => Ok(rustix::io::fcntl_dupfd_cloexec(fd, 0)?),
            None => Err(Error::ExportFailed(
                "pool was created without export capability".into(),
            )),
        }
    }
}

impl Drop for PoolBacking {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.base.as_ptr().cast(), self.size);
        }
        // fd (if any) closes when OwnedFd drops.
    }
}

// SAFETY: the mapping is valid process-wide, access synchronization is the
// pool allocator's responsibility, and the fd is kernel-reference-counted.
unsafe impl Send for PoolBacking {}
unsafe impl Sync for PoolBacking {}
