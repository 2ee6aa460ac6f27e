//! Error types for membrane.

use thiserror::Error;

/// Result type alias using membrane's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for membrane operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed argument (zero size, unknown handle, inaccessible view).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Backing memory allocation failed.
    #[error("memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Memory pool cannot satisfy the request.
    #[error("memory pool exhausted: requested {requested} bytes, {available} available")]
    PoolExhausted {
        /// Bytes the caller asked for.
        requested: usize,
        /// Bytes currently allocatable from the pool.
        available: usize,
    },

    /// Copy endpoints have different sizes.
    #[error("buffer size mismatch: source is {src} bytes, destination is {dst} bytes")]
    SizeMismatch {
        /// Source buffer size in bytes.
        src: usize,
        /// Destination buffer size in bytes.
        dst: usize,
    },

    /// Operation attempted on a buffer whose handle was already released.
    #[error("operation on closed buffer")]
    BufferClosed,

    /// Device-affinity query on a resource with no device binding.
    #[error("memory resource is not bound to any GPU")]
    NotDeviceBound,

    /// Shareable handle creation failed or is unsupported for this pool.
    #[error("shareable handle export failed: {0}")]
    ExportFailed(String),

    /// Shareable handle is invalid, stale, or bound to a different device.
    #[error("shareable handle import failed: {0}")]
    ImportFailed(String),

    /// Opaque failure surfaced from an underlying primitive.
    #[error("driver error during {op}: {msg}")]
    Driver {
        /// Name of the failing operation.
        op: &'static str,
        /// Underlying failure description.
        msg: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
