//! Contracts the swap manager expects from the device runtime.
//!
//! The manager never allocates device memory itself. It reads buffer sizes, releases buffers
//! that are no longer needed, and asks a [`TransferEngine`] to stage buffers through pinned
//! host regions it owns until teardown.

use std::fmt;

/// One gibibyte, the unit of every estimator value.
pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Converts a byte count into gigabytes.
pub fn bytes_to_gb(bytes: usize) -> f64 {
    bytes as f64 / BYTES_PER_GB
}

/// Device-resident memory block referenced by the step graph.
///
/// Implementations use interior mutability: the graph and the swap manager share the
/// buffer through an `Arc`, and the manager only ever holds shared references.
pub trait DeviceBuffer: Send + Sync {
    /// Current device footprint in bytes; zero once released.
    fn size_in_bytes(&self) -> usize;

    /// Resizes the buffer to empty and returns its device memory.
    fn release(&self);
}

/// Direction of a host/device copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    DeviceToHost,
    HostToDevice,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferDirection::DeviceToHost => write!(f, "device-to-host"),
            TransferDirection::HostToDevice => write!(f, "host-to-device"),
        }
    }
}

/// Free and total device memory reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceMemoryInfo {
    pub free_bytes: usize,
    pub total_bytes: usize,
}

/// Failure reported by a transfer engine.
#[derive(Debug)]
pub enum TransferError {
    PinnedAllocation { bytes: usize, reason: String },
    Copy {
        direction: TransferDirection,
        reason: String,
    },
    MemoryQuery { reason: String },
    OutOfDeviceMemory { requested: usize, free: usize },
}

impl TransferError {
    pub fn pinned_allocation(bytes: usize, reason: impl Into<String>) -> Self {
        TransferError::PinnedAllocation {
            bytes,
            reason: reason.into(),
        }
    }

    pub fn copy(direction: TransferDirection, reason: impl Into<String>) -> Self {
        TransferError::Copy {
            direction,
            reason: reason.into(),
        }
    }

    pub fn memory_query(reason: impl Into<String>) -> Self {
        TransferError::MemoryQuery {
            reason: reason.into(),
        }
    }

    pub fn out_of_device_memory(requested: usize, free: usize) -> Self {
        TransferError::OutOfDeviceMemory { requested, free }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::PinnedAllocation { bytes, reason } => {
                write!(f, "pinned host allocation of {bytes} bytes failed: {reason}")
            }
            TransferError::Copy { direction, reason } => {
                write!(f, "{direction} copy failed: {reason}")
            }
            TransferError::MemoryQuery { reason } => {
                write!(f, "device memory query failed: {reason}")
            }
            TransferError::OutOfDeviceMemory { requested, free } => {
                write!(
                    f,
                    "out of device memory: requested {requested} bytes with {free} free"
                )
            }
        }
    }
}

impl std::error::Error for TransferError {}

/// Convenience alias for results returned by transfer engines.
pub type TransferResult<T> = Result<T, TransferError>;

/// Asynchronous host/device copy facility with pinned host allocation.
pub trait TransferEngine: Send + Sync {
    type Buffer: DeviceBuffer + 'static;
    /// Page-locked host allocation used as the staging area of one swap-out.
    type HostRegion: Send + 'static;
    /// Ticket for an issued transfer, consumed by [`TransferEngine::wait`].
    type Transfer: Send + 'static;

    /// Returns a human-readable engine identifier (e.g., `"cpu-ref"`, `"cuda"`).
    fn engine_name(&self) -> &str;

    fn memory_info(&self) -> TransferResult<DeviceMemoryInfo>;

    fn alloc_pinned(&self, bytes: usize) -> TransferResult<Self::HostRegion>;

    /// Returns a pinned region to the host allocator.
    fn free_pinned(&self, region: Self::HostRegion);

    /// Issues a copy of the buffer's full contents into `host`.
    fn begin_device_to_host(
        &self,
        buffer: &Self::Buffer,
        host: &mut Self::HostRegion,
    ) -> TransferResult<Self::Transfer>;

    /// Issues a copy of the first `bytes` of `host` back into `buffer`, re-establishing its
    /// device storage.
    fn begin_host_to_device(
        &self,
        host: &Self::HostRegion,
        bytes: usize,
        buffer: &Self::Buffer,
    ) -> TransferResult<Self::Transfer>;

    /// Blocks until the transfer completes.
    fn wait(&self, transfer: Self::Transfer) -> TransferResult<()>;
}
