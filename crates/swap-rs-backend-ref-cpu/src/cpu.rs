//! Reference transfer engine that models device memory with host vectors.
//!
//! Device capacity is a byte ledger shared by the engine and its buffers, so releasing a
//! buffer or restoring it shows up in [`CpuDevice::memory_info`]. Copies run eagerly when a
//! transfer is issued; [`CpuDevice::wait`] only reports the outcome.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use swap_rs::device::{
    DeviceBuffer, DeviceMemoryInfo, TransferDirection, TransferEngine, TransferError,
    TransferResult,
};
use tracing::{debug, trace};

/// Capacity of [`CpuDevice::new`]: one gibibyte.
pub const DEFAULT_CAPACITY_BYTES: usize = 1 << 30;

struct DeviceLedger {
    capacity: usize,
    used: AtomicUsize,
}

impl DeviceLedger {
    fn reserve(&self, bytes: usize) -> TransferResult<()> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.capacity)
            })
            .map(|_| ())
            .map_err(|used| {
                TransferError::out_of_device_memory(bytes, self.capacity.saturating_sub(used))
            })
    }

    fn give_back(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }
}

/// Device buffer backed by a host vector; an empty vector means released.
pub struct CpuBuffer {
    data: Mutex<Vec<u8>>,
    ledger: Arc<DeviceLedger>,
}

impl CpuBuffer {
    fn data(&self) -> MutexGuard<'_, Vec<u8>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the buffer's current contents.
    pub fn read_bytes(&self) -> Vec<u8> {
        self.data().clone()
    }
}

impl DeviceBuffer for CpuBuffer {
    fn size_in_bytes(&self) -> usize {
        self.data().len()
    }

    fn release(&self) {
        let released = std::mem::take(&mut *self.data());
        self.ledger.give_back(released.len());
    }
}

impl Drop for CpuBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

/// Host staging area handed out by [`CpuDevice::alloc_pinned`].
pub struct PinnedHostBuffer {
    data: Box<[u8]>,
}

impl PinnedHostBuffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// Completed copy awaiting [`CpuDevice::wait`]; carries the injected failure, if any.
pub struct CpuTransfer {
    direction: TransferDirection,
    bytes: usize,
    failure: Option<String>,
}

impl CpuTransfer {
    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

pub struct CpuDevice {
    ledger: Arc<DeviceLedger>,
    pinned_regions: AtomicUsize,
    fail_next_transfer: AtomicBool,
}

impl Default for CpuDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuDevice {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY_BYTES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        CpuDevice {
            ledger: Arc::new(DeviceLedger {
                capacity,
                used: AtomicUsize::new(0),
            }),
            pinned_regions: AtomicUsize::new(0),
            fail_next_transfer: AtomicBool::new(false),
        }
    }

    /// Allocates a zero-filled buffer of `bytes` bytes.
    pub fn allocate(&self, bytes: usize) -> TransferResult<Arc<CpuBuffer>> {
        self.from_bytes(vec![0; bytes])
    }

    /// Uploads `data` into a new device buffer.
    pub fn from_bytes(&self, data: Vec<u8>) -> TransferResult<Arc<CpuBuffer>> {
        self.ledger.reserve(data.len())?;
        Ok(Arc::new(CpuBuffer {
            data: Mutex::new(data),
            ledger: Arc::clone(&self.ledger),
        }))
    }

    /// Makes the next issued transfer report a failure from `wait` without copying.
    pub fn fail_next_transfer(&self) {
        self.fail_next_transfer.store(true, Ordering::SeqCst);
    }

    pub fn capacity(&self) -> usize {
        self.ledger.capacity
    }

    /// Device bytes held by live buffers.
    pub fn used_bytes(&self) -> usize {
        self.ledger.used()
    }

    /// Pinned regions allocated and not yet freed.
    pub fn pinned_regions(&self) -> usize {
        self.pinned_regions.load(Ordering::SeqCst)
    }

    fn injected_failure(&self, direction: TransferDirection, bytes: usize) -> Option<CpuTransfer> {
        self.fail_next_transfer
            .swap(false, Ordering::SeqCst)
            .then(|| CpuTransfer {
                direction,
                bytes,
                failure: Some("injected transfer failure".to_string()),
            })
    }
}

impl TransferEngine for CpuDevice {
    type Buffer = CpuBuffer;
    type HostRegion = PinnedHostBuffer;
    type Transfer = CpuTransfer;

    fn engine_name(&self) -> &str {
        "cpu-ref"
    }

    fn memory_info(&self) -> TransferResult<DeviceMemoryInfo> {
        let total_bytes = self.ledger.capacity;
        Ok(DeviceMemoryInfo {
            free_bytes: total_bytes.saturating_sub(self.ledger.used()),
            total_bytes,
        })
    }

    fn alloc_pinned(&self, bytes: usize) -> TransferResult<PinnedHostBuffer> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes)
            .map_err(|err| TransferError::pinned_allocation(bytes, err.to_string()))?;
        data.resize(bytes, 0);
        self.pinned_regions.fetch_add(1, Ordering::SeqCst);
        debug!(bytes, "allocated pinned host region");
        Ok(PinnedHostBuffer {
            data: data.into_boxed_slice(),
        })
    }

    fn free_pinned(&self, region: PinnedHostBuffer) {
        self.pinned_regions.fetch_sub(1, Ordering::SeqCst);
        debug!(bytes = region.capacity(), "freed pinned host region");
    }

    fn begin_device_to_host(
        &self,
        buffer: &CpuBuffer,
        host: &mut PinnedHostBuffer,
    ) -> TransferResult<CpuTransfer> {
        let data = buffer.data();
        let bytes = data.len();
        if bytes > host.capacity() {
            return Err(TransferError::copy(
                TransferDirection::DeviceToHost,
                format!(
                    "{bytes} bytes do not fit a {} byte host region",
                    host.capacity()
                ),
            ));
        }
        if let Some(failed) = self.injected_failure(TransferDirection::DeviceToHost, bytes) {
            return Ok(failed);
        }
        host.data[..bytes].copy_from_slice(&data);
        trace!(bytes, "device-to-host copy");
        Ok(CpuTransfer {
            direction: TransferDirection::DeviceToHost,
            bytes,
            failure: None,
        })
    }

    fn begin_host_to_device(
        &self,
        host: &PinnedHostBuffer,
        bytes: usize,
        buffer: &CpuBuffer,
    ) -> TransferResult<CpuTransfer> {
        if bytes > host.capacity() {
            return Err(TransferError::copy(
                TransferDirection::HostToDevice,
                format!(
                    "{bytes} bytes requested from a {} byte host region",
                    host.capacity()
                ),
            ));
        }
        if let Some(failed) = self.injected_failure(TransferDirection::HostToDevice, bytes) {
            return Ok(failed);
        }

        let mut data = buffer.data();
        self.ledger.reserve(bytes)?;
        self.ledger.give_back(data.len());
        data.clear();
        data.extend_from_slice(&host.data[..bytes]);
        trace!(bytes, "host-to-device copy");
        Ok(CpuTransfer {
            direction: TransferDirection::HostToDevice,
            bytes,
            failure: None,
        })
    }

    fn wait(&self, transfer: CpuTransfer) -> TransferResult<()> {
        match transfer.failure {
            Some(reason) => Err(TransferError::copy(transfer.direction, reason)),
            None => Ok(()),
        }
    }
}
