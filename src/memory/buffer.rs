//! Owning buffer values with stream-ordered copies and explicit release.

use crate::driver::{self, CopyKind};
use crate::error::{Error, Result};
use crate::memory::MemoryResource;
use crate::stream::Stream;
use std::sync::Arc;

/// An owning handle to one allocated memory block.
///
/// A `Buffer` is created only by allocating from a
/// [`MemoryResource`](crate::memory::MemoryResource) and owns exactly one
/// block: it moves freely but is never duplicated. Release is explicit via
/// [`Buffer::close`]; dropping an unclosed buffer releases it as a fallback
/// and logs a warning, but explicit close remains the canonical contract —
/// device-backed memory must not rely on drop timing in caller designs that
/// hold buffers in long-lived collections.
///
/// After `close`, `handle()` is `0`, the resource back-reference is empty,
/// and every copy operation fails with [`Error::BufferClosed`].
pub struct Buffer {
    /// Address-sized handle into the backing memory; 0 once released.
    handle: usize,
    /// Byte length, fixed at construction.
    size: usize,
    /// Back-reference to the allocating resource; not an ownership edge.
    mr: Option<Arc<dyn MemoryResource>>,
}

impl Buffer {
    pub(crate) fn from_raw_parts(
        handle: usize,
        size: usize,
        mr: Arc<dyn MemoryResource>,
    ) -> Buffer {
        Buffer {
            handle,
            size,
            mr: Some(mr),
        }
    }

    /// The raw handle, or 0 if the buffer was closed.
    #[inline]
    pub fn handle(&self) -> usize {
        self.handle
    }

    /// Byte length of the buffer.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the buffer has been released.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.mr.is_none()
    }

    /// The allocating resource, or `None` after close.
    pub fn memory_resource(&self) -> Option<&Arc<dyn MemoryResource>> {
        self.mr.as_ref()
    }

    /// Check whether this buffer was allocated by `mr`.
    ///
    /// Compares resource *identity*, not configuration: two identically
    /// configured resources are still distinct owners.
    pub fn belongs_to<M>(&self, mr: &Arc<M>) -> bool
    where
        M: MemoryResource + ?Sized,
    {
        match &self.mr {
            Some(own) => std::ptr::addr_eq(Arc::as_ptr(own), Arc::as_ptr(mr)),
            None => false,
        }
    }

    /// Whether device-side code may dereference this buffer.
    pub fn is_device_accessible(&self) -> Result<bool> {
        Ok(self.resource()?.is_device_accessible())
    }

    /// Whether host-side code may dereference this buffer.
    pub fn is_host_accessible(&self) -> Result<bool> {
        Ok(self.resource()?.is_host_accessible())
    }

    /// Ordinal of the owning device, per the allocating resource.
    ///
    /// Fails with [`Error::NotDeviceBound`] for buffers from resources with
    /// no device affinity, and [`Error::BufferClosed`] after close.
    pub fn device_id(&self) -> Result<u32> {
        self.resource()?.device_id()
    }

    fn resource(&self) -> Result<&Arc<dyn MemoryResource>> {
        self.mr.as_ref().ok_or(Error::BufferClosed)
    }

    /// Copy this buffer's bytes into `dst`, ordered on `stream`.
    ///
    /// Both buffers must be open and the same size; the transfer kind
    /// (host/device on each end) is derived from the two resources'
    /// accessibility flags. Returns as soon as the copy is enqueued — the
    /// caller must keep both buffers alive until the stream has been
    /// synchronized past this operation.
    pub fn copy_to(&self, dst: &mut Buffer, stream: &Stream) -> Result<()> {
        let src_mr = self.resource()?;
        let dst_mr = dst.resource()?;
        if self.size != dst.size {
            return Err(Error::SizeMismatch {
                src: self.size,
                dst: dst.size,
            });
        }

        let kind = CopyKind::derive(
            src_mr.is_device_accessible(),
            src_mr.is_host_accessible(),
            dst_mr.is_device_accessible(),
            dst_mr.is_host_accessible(),
        );
        let (src, dst, len) = (self.handle, dst.handle, self.size);
        stream.submit(move || {
            // SAFETY: both handles are live allocations of at least `len`
            // bytes; liveness until synchronization is the caller's contract.
            unsafe { driver::copy(kind, src, dst, len) }
        })
    }

    /// Copy `src`'s bytes into this buffer, ordered on `stream`.
    pub fn copy_from(&mut self, src: &Buffer, stream: &Stream) -> Result<()> {
        src.copy_to(self, stream)
    }

    /// Release the buffer through its owning resource.
    ///
    /// The deallocation is ordered on the resource's default stream; use
    /// [`Buffer::close_on`] to order it on a specific stream. Closing an
    /// already closed buffer is a no-op returning `Ok(())`.
    pub fn close(&mut self) -> Result<()> {
        self.close_impl(None)
    }

    /// Release the buffer, ordering the deallocation on `stream`.
    pub fn close_on(&mut self, stream: &Stream) -> Result<()> {
        self.close_impl(Some(stream))
    }

    fn close_impl(&mut self, stream: Option<&Stream>) -> Result<()> {
        let Some(mr) = self.mr.take() else {
            return Ok(());
        };
        let handle = std::mem::replace(&mut self.handle, 0);
        mr.deallocate(handle, self.size, stream)
    }

    /// View the buffer as bytes. Only valid for host-accessible buffers.
    ///
    /// The view reflects whatever the backing memory currently holds;
    /// synchronize the relevant stream first if copies are in flight.
    pub fn host_slice(&self) -> Result<&[u8]> {
        let mr = self.resource()?;
        if !mr.is_host_accessible() {
            return Err(Error::InvalidArgument(
                "buffer is not host-accessible".into(),
            ));
        }
        // SAFETY: handle is a live host-reachable allocation of `size` bytes
        // and &self prevents close for the borrow's duration.
        Ok(unsafe { std::slice::from_raw_parts(self.handle as *const u8, self.size) })
    }

    /// Mutable byte view. Only valid for host-accessible buffers.
    pub fn host_slice_mut(&mut self) -> Result<&mut [u8]> {
        let mr = self.resource()?;
        if !mr.is_host_accessible() {
            return Err(Error::InvalidArgument(
                "buffer is not host-accessible".into(),
            ));
        }
        // SAFETY: as in `host_slice`, plus &mut self guarantees exclusivity
        // on the host side.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.handle as *mut u8, self.size) })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.mr.is_some() {
            tracing::warn!(
                handle = self.handle,
                size = self.size,
                "buffer dropped without close, releasing"
            );
            let _ = self.close_impl(None);
        }
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::memory::{
        DeviceMemoryResource, HostMemoryResource, MemoryResourceExt, PinnedMemoryResource,
        UnifiedMemoryResource,
    };

    fn check_initialization(mr: Arc<dyn MemoryResource>) {
        let mut buffer = mr.allocate(1024, None).unwrap();
        assert_ne!(buffer.handle(), 0);
        assert_eq!(buffer.size(), 1024);
        assert!(buffer.belongs_to(&mr));
        assert_eq!(
            buffer.is_device_accessible().unwrap(),
            mr.is_device_accessible()
        );
        assert_eq!(
            buffer.is_host_accessible().unwrap(),
            mr.is_host_accessible()
        );
        match mr.device_id() {
            Ok(id) => assert_eq!(buffer.device_id().unwrap(), id),
            Err(_) => assert!(matches!(buffer.device_id(), Err(Error::NotDeviceBound))),
        }
        buffer.close().unwrap();
    }

    #[test]
    fn test_buffer_initialization() {
        let device = Device::new(0).unwrap();
        check_initialization(DeviceMemoryResource::new(&device));
        check_initialization(PinnedMemoryResource::new(&device));
        check_initialization(UnifiedMemoryResource::new(&device));
        check_initialization(HostMemoryResource::new().unwrap());
        device.synchronize().unwrap();
    }

    #[test]
    fn test_buffer_close_clears_state() {
        let device = Device::new(0).unwrap();
        let mr = PinnedMemoryResource::new(&device);

        let mut buffer = mr.allocate(1024, None).unwrap();
        buffer.close().unwrap();

        assert_eq!(buffer.handle(), 0);
        assert!(buffer.memory_resource().is_none());
        assert!(buffer.is_closed());
        assert!(!buffer.belongs_to(&mr));

        // Second close is a documented no-op.
        buffer.close().unwrap();
        assert_eq!(buffer.handle(), 0);
        device.synchronize().unwrap();
    }

    #[test]
    fn test_copy_to_roundtrip_pattern() {
        let device = Device::new(0).unwrap();
        let mr = PinnedMemoryResource::new(&device);
        let stream = device.create_stream().unwrap();

        let mut src = mr.allocate(1024, None).unwrap();
        let mut dst = mr.allocate(1024, None).unwrap();

        for (i, byte) in src.host_slice_mut().unwrap().iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }

        src.copy_to(&mut dst, &stream).unwrap();
        stream.synchronize().unwrap();

        let expected: Vec<u8> = (0..1024).map(|i| (i % 256) as u8).collect();
        assert_eq!(dst.host_slice().unwrap(), &expected[..]);

        dst.close().unwrap();
        src.close().unwrap();
        device.synchronize().unwrap();
    }

    #[test]
    fn test_copy_from_roundtrip_pattern() {
        let device = Device::new(0).unwrap();
        let mr = UnifiedMemoryResource::new(&device);
        let stream = device.create_stream().unwrap();

        let mut src = mr.allocate(512, None).unwrap();
        let mut dst = mr.allocate(512, None).unwrap();

        src.host_slice_mut().unwrap().fill(0xAB);
        dst.copy_from(&src, &stream).unwrap();
        stream.synchronize().unwrap();

        assert!(dst.host_slice().unwrap().iter().all(|&b| b == 0xAB));

        dst.close().unwrap();
        src.close().unwrap();
        device.synchronize().unwrap();
    }

    #[test]
    fn test_device_roundtrip_via_staging() {
        let device = Device::new(0).unwrap();
        let device_mr = DeviceMemoryResource::new(&device);
        let pinned_mr = PinnedMemoryResource::new(&device);
        let stream = device.create_stream().unwrap();

        let mut upload = pinned_mr.allocate(1024, None).unwrap();
        let mut on_device = device_mr.allocate(1024, None).unwrap();
        let mut download = pinned_mr.allocate(1024, None).unwrap();

        for (i, byte) in upload.host_slice_mut().unwrap().iter_mut().enumerate() {
            *byte = (i % 256) as u8;
        }

        upload.copy_to(&mut on_device, &stream).unwrap();
        on_device.copy_to(&mut download, &stream).unwrap();
        stream.synchronize().unwrap();

        assert_eq!(
            download.host_slice().unwrap(),
            upload.host_slice().unwrap()
        );

        download.close().unwrap();
        on_device.close().unwrap();
        upload.close().unwrap();
        device.synchronize().unwrap();
    }

    #[test]
    fn test_copy_size_mismatch() {
        let device = Device::new(0).unwrap();
        let mr = PinnedMemoryResource::new(&device);
        let stream = device.create_stream().unwrap();

        let big = mr.allocate(1024, None).unwrap();
        let mut small = mr.allocate(512, None).unwrap();
        small.host_slice_mut().unwrap().fill(0xEE);

        let result = big.copy_to(&mut small, &stream);
        assert!(matches!(
            result,
            Err(Error::SizeMismatch { src: 1024, dst: 512 })
        ));

        // No partial copy happened.
        stream.synchronize().unwrap();
        assert!(small.host_slice().unwrap().iter().all(|&b| b == 0xEE));
        device.synchronize().unwrap();
    }

    #[test]
    fn test_copy_on_closed_buffer_fails() {
        let device = Device::new(0).unwrap();
        let mr = PinnedMemoryResource::new(&device);
        let stream = device.create_stream().unwrap();

        let mut closed = mr.allocate(256, None).unwrap();
        let mut open = mr.allocate(256, None).unwrap();
        closed.close().unwrap();

        assert!(matches!(
            closed.copy_to(&mut open, &stream),
            Err(Error::BufferClosed)
        ));
        assert!(matches!(
            open.copy_from(&closed, &stream),
            Err(Error::BufferClosed)
        ));
        assert!(matches!(closed.host_slice(), Err(Error::BufferClosed)));
        device.synchronize().unwrap();
    }

    #[test]
    fn test_host_slice_rejected_for_device_memory() {
        let device = Device::new(0).unwrap();
        let mr = DeviceMemoryResource::new(&device);

        let buffer = mr.allocate(256, None).unwrap();
        assert!(matches!(
            buffer.host_slice(),
            Err(Error::InvalidArgument(_))
        ));
        device.synchronize().unwrap();
    }

    #[test]
    fn test_identity_not_configuration() {
        let device = Device::new(0).unwrap();
        let a = PinnedMemoryResource::new(&device);
        let b = PinnedMemoryResource::new(&device);

        let buffer = a.allocate(64, None).unwrap();
        assert!(buffer.belongs_to(&a));
        assert!(!buffer.belongs_to(&b)); // identical configuration, different owner
        device.synchronize().unwrap();
    }
}
