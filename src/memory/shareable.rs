//! Cross-process pool sharing.
//!
//! A [`ShareableMempool`] is a pool whose backing was created with export
//! capability. [`ShareableMempool::get_shareable_handle`] produces a
//! [`ShareableHandle`]: a duplicated backing fd plus a serializable
//! [`PoolDesc`] describing the pool. The handle travels to another process
//! over a unix socket (see [`crate::memory::ipc`]) and is turned back into a
//! pool there with [`SharedMempool::new`].
//!
//! Both sides map the same physical pages but run independent allocators:
//! each process carves its own view, and coordination of which ranges belong
//! to whom is the application's protocol, not this layer's.

use crate::device::Device;
use crate::driver::PoolBacking;
use crate::error::{Error, Result};
use crate::memory::pool::Mempool;
use crate::memory::resource::MemoryResource;
use crate::stream::Stream;
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

/// Wire-format description of an exported pool.
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvDeserialize, RkyvSerialize)]
#[rkyv(derive(Debug))]
pub struct PoolDesc {
    /// Exporter-side pool identity; preserved on import.
    pub pool_id: u64,
    /// Total capacity of the backing in bytes.
    pub size: usize,
    /// Ordinal of the device the pool is bound to.
    pub device_id: u32,
}

/// Transferable capability to map an exported pool.
///
/// Carries the backing fd and its [`PoolDesc`]. Obtained from
/// [`ShareableMempool::get_shareable_handle`] and consumed by
/// [`SharedMempool::new`]; use [`crate::memory::ipc`] to move it between
/// processes.
pub struct ShareableHandle {
    fd: OwnedFd,
    desc: PoolDesc,
}

impl ShareableHandle {
    pub(crate) fn from_parts(fd: OwnedFd, desc: PoolDesc) -> ShareableHandle {
        ShareableHandle { fd, desc }
    }

    /// The pool description carried by this handle.
    pub fn desc(&self) -> &PoolDesc {
        &self.desc
    }

    /// Borrow the backing fd.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Duplicate the handle, including its fd.
    pub fn try_clone(&self) -> Result<ShareableHandle> {
        Ok(ShareableHandle {
            fd: rustix::io::fcntl_dupfd_cloexec(&self.fd, 0)?,
            desc: self.desc.clone(),
        })
    }
}

impl std::fmt::Debug for ShareableHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareableHandle")
            .field("desc", &self.desc)
            .finish_non_exhaustive()
    }
}

impl Mempool {
    /// Produce a transferable handle to this pool's backing.
    ///
    /// Fails with [`Error::ExportFailed`] when the pool was created without
    /// export capability (a plain [`Mempool::new`] pool).
    pub fn shareable_handle(&self) -> Result<ShareableHandle> {
        let fd = self.backing().export_fd()?;
        Ok(ShareableHandle::from_parts(
            fd,
            PoolDesc {
                pool_id: self.pool_id(),
                size: self.capacity(),
                device_id: self.device().id(),
            },
        ))
    }
}

/// A pool created with export capability.
///
/// Behaves exactly like a [`Mempool`] as a [`MemoryResource`]; additionally
/// its backing can be exported any number of times.
pub struct ShareableMempool {
    pool: Mempool,
}

impl ShareableMempool {
    /// Reserve an exportable pool of `max_size` bytes on `device`.
    pub fn new(device: &Device, max_size: usize) -> Result<Arc<ShareableMempool>> {
        crate::memory::resource::check_size(max_size)?;
        let backing = PoolBacking::new_exportable(
            &format!("membrane-pool-dev{}", device.id()),
            max_size,
        )?;
        Ok(Arc::new(ShareableMempool {
            pool: Mempool::from_backing(device, backing),
        }))
    }

    /// Produce a transferable handle to this pool's backing.
    ///
    /// Each call duplicates the fd, so one pool can be shared with several
    /// importers.
    pub fn get_shareable_handle(&self) -> Result<ShareableHandle> {
        self.pool.shareable_handle()
    }

    /// The device this pool is bound to.
    pub fn device(&self) -> &Device {
        self.pool.device()
    }

    /// Identity of the physical pool, stable across export/import.
    pub fn pool_id(&self) -> u64 {
        self.pool.pool_id()
    }

    /// Total reserved capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Bytes allocatable right now.
    pub fn available_bytes(&self) -> usize {
        self.pool.available_bytes()
    }

    /// Bytes currently held by live buffers.
    pub fn used_bytes(&self) -> usize {
        self.pool.used_bytes()
    }
}

impl MemoryResource for ShareableMempool {
    fn allocate_raw(&self, size: usize, stream: Option<&Stream>) -> Result<usize> {
        self.pool.allocate_raw(size, stream)
    }

    fn deallocate(&self, handle: usize, size: usize, stream: Option<&Stream>) -> Result<()> {
        self.pool.deallocate(handle, size, stream)
    }

    fn is_device_accessible(&self) -> bool {
        self.pool.is_device_accessible()
    }

    fn is_host_accessible(&self) -> bool {
        self.pool.is_host_accessible()
    }

    fn device_id(&self) -> Result<u32> {
        self.pool.device_id()
    }

    fn default_stream(&self) -> &Stream {
        self.pool.default_stream()
    }
}

/// An imported view of another process's exported pool.
///
/// Maps the exporter's physical pages and runs its own allocator over them.
/// Which ranges each side may touch is an application-level agreement.
pub struct SharedMempool {
    pool: Mempool,
}

impl SharedMempool {
    /// Map an exported pool described by `handle` onto `device`.
    ///
    /// Fails with [`Error::ImportFailed`] when the handle targets a
    /// different device ordinal, describes an implausible size, or its fd is
    /// stale.
    pub fn new(device: &Device, handle: &ShareableHandle) -> Result<Arc<SharedMempool>> {
        let desc = handle.desc();
        if desc.device_id != device.id() {
            return Err(Error::ImportFailed(format!(
                "pool is bound to device {} but import targets device {}",
                desc.device_id,
                device.id()
            )));
        }

        let fd = rustix::io::fcntl_dupfd_cloexec(&handle.fd, 0)
            .map_err(|errno| Error::ImportFailed(format!("cannot duplicate handle: {errno}")))?;
        let backing = PoolBacking::import(fd, desc.size, desc.pool_id)?;
        Ok(Arc::new(SharedMempool {
            pool: Mempool::from_backing(device, backing),
        }))
    }

    /// The device this view is mapped on.
    pub fn device(&self) -> &Device {
        self.pool.device()
    }

    /// Identity of the physical pool, equal to the exporter's.
    pub fn pool_id(&self) -> u64 {
        self.pool.pool_id()
    }

    /// Total capacity of the imported backing in bytes.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }
}

impl MemoryResource for SharedMempool {
    fn allocate_raw(&self, size: usize, stream: Option<&Stream>) -> Result<usize> {
        self.pool.allocate_raw(size, stream)
    }

    fn deallocate(&self, handle: usize, size: usize, stream: Option<&Stream>) -> Result<()> {
        self.pool.deallocate(handle, size, stream)
    }

    fn is_device_accessible(&self) -> bool {
        self.pool.is_device_accessible()
    }

    fn is_host_accessible(&self) -> bool {
        self.pool.is_host_accessible()
    }

    fn device_id(&self) -> Result<u32> {
        self.pool.device_id()
    }

    fn default_stream(&self) -> &Stream {
        self.pool.default_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryResourceExt;

    #[test]
    fn test_plain_pool_export_rejected() {
        let device = Device::new(0).unwrap();
        let pool = Mempool::new(&device, 4096).unwrap();
        assert!(matches!(
            pool.shareable_handle(),
            Err(Error::ExportFailed(_))
        ));
    }

    #[test]
    fn test_shareable_pool_exports_descriptor() {
        let device = Device::new(2).unwrap();
        let pool = ShareableMempool::new(&device, 8192).unwrap();

        let handle = pool.get_shareable_handle().unwrap();
        assert_eq!(handle.desc().pool_id, pool.pool_id());
        assert_eq!(handle.desc().size, 8192);
        assert_eq!(handle.desc().device_id, 2);

        // Multiple exports of the same pool are allowed.
        let second = pool.get_shareable_handle().unwrap();
        assert_eq!(second.desc(), handle.desc());
    }

    #[test]
    fn test_import_device_mismatch_rejected() {
        let exporter_dev = Device::new(0).unwrap();
        let pool = ShareableMempool::new(&exporter_dev, 4096).unwrap();
        let handle = pool.get_shareable_handle().unwrap();

        let other_dev = Device::new(1).unwrap();
        assert!(matches!(
            SharedMempool::new(&other_dev, &handle),
            Err(Error::ImportFailed(_))
        ));
    }

    #[test]
    fn test_imported_pool_sees_exporter_writes() {
        let device = Device::new(0).unwrap();
        let exporter = ShareableMempool::new(&device, 4096).unwrap();
        let handle = exporter.get_shareable_handle().unwrap();
        let importer = SharedMempool::new(&device, &handle).unwrap();

        assert_eq!(importer.pool_id(), exporter.pool_id());
        assert_eq!(importer.capacity(), 4096);

        // Both allocators are fresh, so first-fit hands out the same range
        // on each side; it aliases the same physical pages.
        let from_exporter = exporter.allocate(256, None).unwrap();
        let from_importer = importer.allocate(256, None).unwrap();

        unsafe {
            std::ptr::write(from_exporter.handle() as *mut u8, 0xa5);
        }
        device.synchronize().unwrap();
        unsafe {
            assert_eq!(std::ptr::read(from_importer.handle() as *const u8), 0xa5);
        }
        device.synchronize().unwrap();
    }

    #[test]
    fn test_handle_survives_exporter_side_clone() {
        let device = Device::new(0).unwrap();
        let pool = ShareableMempool::new(&device, 4096).unwrap();
        let handle = pool.get_shareable_handle().unwrap();
        let cloned = handle.try_clone().unwrap();
        drop(handle);

        let imported = SharedMempool::new(&device, &cloned).unwrap();
        assert_eq!(imported.pool_id(), pool.pool_id());
    }
}
