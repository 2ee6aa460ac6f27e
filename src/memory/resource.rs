//! Memory resource trait and the non-pooled resource variants.

use crate::device::Device;
use crate::driver;
use crate::error::{Error, Result};
use crate::memory::Buffer;
use crate::stream::Stream;
use std::sync::Arc;

/// Capability contract for allocating and releasing memory of one kind.
///
/// A resource's accessibility flags are fixed at construction and never
/// change. Implementations are thin policy layers over the raw allocation
/// primitives; callers obtain owning [`Buffer`]s through
/// [`MemoryResourceExt::allocate`] rather than calling `allocate_raw`
/// directly.
///
/// # Stream ordering
///
/// `allocate_raw` and `deallocate` are ordered against the supplied stream;
/// when `stream` is `None` the resource's [default
/// stream](MemoryResource::default_stream) is used. Neither blocks for
/// device-side completion.
pub trait MemoryResource: Send + Sync {
    /// Reserve `size` bytes and return a nonzero handle.
    ///
    /// Fails with [`Error::InvalidArgument`] for a zero size and
    /// [`Error::AllocationFailed`] (or [`Error::PoolExhausted`]) when the
    /// backing cannot satisfy the request.
    fn allocate_raw(&self, size: usize, stream: Option<&Stream>) -> Result<usize>;

    /// Release a handle previously returned by `allocate_raw`.
    ///
    /// Must be invoked exactly once per successful allocation; a second
    /// release of the same handle is a programming error this layer does not
    /// promise to detect.
    fn deallocate(&self, handle: usize, size: usize, stream: Option<&Stream>) -> Result<()>;

    /// Whether device-side code may dereference allocations from this
    /// resource. Constant for the resource's lifetime.
    fn is_device_accessible(&self) -> bool;

    /// Whether host-side code may dereference allocations from this
    /// resource. Constant for the resource's lifetime.
    fn is_host_accessible(&self) -> bool;

    /// Ordinal of the owning device.
    ///
    /// Fails with [`Error::NotDeviceBound`] on variants with no device
    /// affinity (pinned and plain host memory).
    fn device_id(&self) -> Result<u32>;

    /// The internal ordering stream used when callers pass no stream.
    fn default_stream(&self) -> &Stream;
}

/// Buffer-producing allocation entry point for `Arc`-held resources.
pub trait MemoryResourceExt {
    /// Allocate `size` bytes and wrap them in an owning [`Buffer`] that
    /// carries a back-reference to this resource.
    fn allocate(&self, size: usize, stream: Option<&Stream>) -> Result<Buffer>;
}

impl<M: MemoryResource + 'static> MemoryResourceExt for Arc<M> {
    fn allocate(&self, size: usize, stream: Option<&Stream>) -> Result<Buffer> {
        let handle = self.allocate_raw(size, stream)?;
        let mr: Arc<dyn MemoryResource> = Arc::<M>::clone(self);
        Ok(Buffer::from_raw_parts(handle, size, mr))
    }
}

impl MemoryResourceExt for Arc<dyn MemoryResource> {
    fn allocate(&self, size: usize, stream: Option<&Stream>) -> Result<Buffer> {
        let handle = self.allocate_raw(size, stream)?;
        Ok(Buffer::from_raw_parts(handle, size, Arc::clone(self)))
    }
}

/// Reject sizes the backing cannot represent.
pub(crate) fn check_size(size: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::InvalidArgument(
            "allocation size must be greater than 0".into(),
        ));
    }
    Ok(())
}

/// Enqueue the release of a raw mapping behind prior work on `stream`.
fn release_on(stream: &Stream, handle: usize, size: usize) -> Result<()> {
    stream.submit(move || {
        // SAFETY: the handle came from a driver alloc and is released once.
        if let Err(err) = unsafe { driver::release(handle, size) } {
            tracing::warn!(%err, handle, size, "deferred release failed");
        }
    })
}

/// Device-only memory: device-accessible, not host-accessible.
pub struct DeviceMemoryResource {
    device: Device,
}

impl DeviceMemoryResource {
    /// Create a device memory resource bound to `device`.
    pub fn new(device: &Device) -> Arc<DeviceMemoryResource> {
        Arc::new(DeviceMemoryResource {
            device: device.clone(),
        })
    }
}

impl MemoryResource for DeviceMemoryResource {
    fn allocate_raw(&self, size: usize, _stream: Option<&Stream>) -> Result<usize> {
        check_size(size)?;
        driver::alloc_device(size)
    }

    fn deallocate(&self, handle: usize, size: usize, stream: Option<&Stream>) -> Result<()> {
        release_on(stream.unwrap_or_else(|| self.default_stream()), handle, size)
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

/// Pinned (page-locked) host memory.
///
/// Reachable from both sides, but not bound to any one GPU: `device_id`
/// fails with [`Error::NotDeviceBound`]. The device reference only provides
/// the default ordering stream.
pub struct PinnedMemoryResource {
    device: Device,
}

impl PinnedMemoryResource {
    /// Create a pinned host memory resource ordered on `device`'s streams.
    pub fn new(device: &Device) -> Arc<PinnedMemoryResource> {
        Arc::new(PinnedMemoryResource {
            device: device.clone(),
        })
    }
}

impl MemoryResource for PinnedMemoryResource {
    fn allocate_raw(&self, size: usize, _stream: Option<&Stream>) -> Result<usize> {
        check_size(size)?;
        driver::alloc_pinned(size)
    }

    fn deallocate(&self, handle: usize, size: usize, stream: Option<&Stream>) -> Result<()> {
        release_on(stream.unwrap_or_else(|| self.default_stream()), handle, size)
    }

    fn is_device_accessible(&self) -> bool {
        true
    }

    fn is_host_accessible(&self) -> bool {
        true
    }

    fn device_id(&self) -> Result<u32> {
        Err(Error::NotDeviceBound)
    }

    fn default_stream(&self) -> &Stream {
        self.device.default_stream()
    }
}

/// Unified memory, accessible from device and host and bound to a device.
pub struct UnifiedMemoryResource {
    device: Device,
}

impl UnifiedMemoryResource {
    /// Create a unified memory resource bound to `device`.
    pub fn new(device: &Device) -> Arc<UnifiedMemoryResource> {
        Arc::new(UnifiedMemoryResource {
            device: device.clone(),
        })
    }
}

impl MemoryResource for UnifiedMemoryResource {
    fn allocate_raw(&self, size: usize, _stream: Option<&Stream>) -> Result<usize> {
        check_size(size)?;
        driver::alloc_unified(size)
    }

    fn deallocate(&self, handle: usize, size: usize, stream: Option<&Stream>) -> Result<()> {
        release_on(stream.unwrap_or_else(|| self.default_stream()), handle, size)
    }

    fn is_device_accessible(&self) -> bool {
        true
    }

    fn is_host_accessible(&self) -> bool {
        true
    }

    fn device_id(&self) -> Result<u32> {
        Ok(self.device.id())
    }

    fn default_stream(&self) -> &Stream {
        self.device.default_stream()
    }
}

/// Plain host memory with no device affinity at all.
///
/// Owns its own ordering stream since no device is involved.
pub struct HostMemoryResource {
    stream: Stream,
}

impl HostMemoryResource {
    /// Create a host memory resource with a private ordering stream.
    pub fn new() -> Result<Arc<HostMemoryResource>> {
        Ok(Arc::new(HostMemoryResource {
            stream: Stream::with_name("membrane-host-default")?,
        }))
    }
}

impl MemoryResource for HostMemoryResource {
    fn allocate_raw(&self, size: usize, _stream: Option<&Stream>) -> Result<usize> {
        check_size(size)?;
        driver::alloc_host(size)
    }

    fn deallocate(&self, handle: usize, size: usize, stream: Option<&Stream>) -> Result<()> {
        release_on(stream.unwrap_or_else(|| self.default_stream()), handle, size)
    }

    fn is_device_accessible(&self) -> bool {
        false
    }

    fn is_host_accessible(&self) -> bool {
        true
    }

    fn device_id(&self) -> Result<u32> {
        Err(Error::NotDeviceBound)
    }

    fn default_stream(&self) -> &Stream {
        &self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessibility_flags_per_variant() {
        let device = Device::new(0).unwrap();

        let dev = DeviceMemoryResource::new(&device);
        assert!(dev.is_device_accessible());
        assert!(!dev.is_host_accessible());

        let pinned = PinnedMemoryResource::new(&device);
        assert!(pinned.is_device_accessible());
        assert!(pinned.is_host_accessible());

        let unified = UnifiedMemoryResource::new(&device);
        assert!(unified.is_device_accessible());
        assert!(unified.is_host_accessible());

        let host = HostMemoryResource::new().unwrap();
        assert!(!host.is_device_accessible());
        assert!(host.is_host_accessible());
    }

    #[test]
    fn test_device_id_binding() {
        let device = Device::new(3).unwrap();

        assert_eq!(DeviceMemoryResource::new(&device).device_id().unwrap(), 3);
        assert_eq!(UnifiedMemoryResource::new(&device).device_id().unwrap(), 3);

        assert!(matches!(
            PinnedMemoryResource::new(&device).device_id(),
            Err(Error::NotDeviceBound)
        ));
        assert!(matches!(
            HostMemoryResource::new().unwrap().device_id(),
            Err(Error::NotDeviceBound)
        ));
    }

    #[test]
    fn test_zero_size_allocation_rejected() {
        let device = Device::new(0).unwrap();
        let mr = DeviceMemoryResource::new(&device);
        assert!(matches!(
            mr.allocate_raw(0, None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_raw_allocate_returns_nonzero_handle() {
        let device = Device::new(0).unwrap();
        let mr = PinnedMemoryResource::new(&device);

        let handle = mr.allocate_raw(1024, None).unwrap();
        assert_ne!(handle, 0);
        mr.deallocate(handle, 1024, None).unwrap();
        device.synchronize().unwrap();
    }
}
