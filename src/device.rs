//! Device and stream provider.
//!
//! A [`Device`] stands in for an accelerator: it carries a numeric identity,
//! owns the internal default ordering stream used when callers pass no
//! stream, and tracks every stream created through it so
//! [`Device::synchronize`] can wait on all of them.
//!
//! Memory resources hold a `Device` clone for their device affinity and for
//! access to the default stream; the device does not own buffers or pools.

use crate::error::Result;
use crate::stream::{Stream, WeakStream};
use std::sync::{Arc, Mutex};

struct DeviceInner {
    id: u32,
    default_stream: Stream,
    /// Streams created via `create_stream`; weak so an abandoned stream can
    /// shut down without the device keeping it alive.
    streams: Mutex<Vec<WeakStream>>,
}

/// Handle to a (simulated) accelerator device.
///
/// Cloning yields another handle to the same device. Two `Device` values
/// compare equal when they refer to the same underlying device instance.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Open the device with the given ordinal.
    ///
    /// Creates the device's default ordering stream.
    pub fn new(id: u32) -> Result<Device> {
        let default_stream = Stream::with_name(&format!("membrane-dev{id}-default"))?;
        Ok(Device {
            inner: Arc::new(DeviceInner {
                id,
                default_stream,
                streams: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Get the device ordinal.
    #[inline]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Get the device's default ordering stream.
    ///
    /// Used by allocate/copy/deallocate when the caller supplies no stream.
    #[inline]
    pub fn default_stream(&self) -> &Stream {
        &self.inner.default_stream
    }

    /// Create a new stream on this device.
    pub fn create_stream(&self) -> Result<Stream> {
        let stream = Stream::with_name(&format!("membrane-dev{}-stream", self.inner.id))?;
        let mut streams = self
            .inner
            .streams
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        streams.retain(|weak| weak.upgrade().is_some());
        streams.push(stream.downgrade());
        Ok(stream)
    }

    /// Block until all work on the default stream and every live stream
    /// created through this device has completed.
    pub fn synchronize(&self) -> Result<()> {
        self.inner.default_stream.synchronize()?;
        let live: Vec<Stream> = {
            let mut streams = self
                .inner
                .streams
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            streams.retain(|weak| weak.upgrade().is_some());
            streams.iter().filter_map(|weak| weak.upgrade()).collect()
        };
        for stream in live {
            stream.synchronize()?;
        }
        Ok(())
    }

    /// Check whether two handles refer to the same device instance.
    pub fn same_device(&self, other: &Device) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("id", &self.inner.id).finish()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.same_device(other)
    }
}

impl Eq for Device {}
