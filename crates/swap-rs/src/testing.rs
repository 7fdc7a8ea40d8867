//! Size-only buffers and a bookkeeping engine for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::device::{
    DeviceBuffer, DeviceMemoryInfo, TransferDirection, TransferEngine, TransferError,
    TransferResult,
};

pub(crate) struct FakeBuffer {
    size: AtomicUsize,
}

impl FakeBuffer {
    pub(crate) fn new(size: usize) -> Self {
        FakeBuffer {
            size: AtomicUsize::new(size),
        }
    }

    fn restore(&self, size: usize) {
        self.size.store(size, Ordering::SeqCst);
    }
}

impl DeviceBuffer for FakeBuffer {
    fn size_in_bytes(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    fn release(&self) {
        self.size.store(0, Ordering::SeqCst);
    }
}

pub(crate) struct FakeHost {
    pub(crate) capacity: usize,
}

pub(crate) struct FakeTransfer {
    direction: TransferDirection,
}

#[derive(Default)]
pub(crate) struct FakeEngine {
    free_bytes: usize,
    total_bytes: usize,
    pub(crate) begins: AtomicUsize,
    pub(crate) waits: AtomicUsize,
    pub(crate) pinned_live: AtomicUsize,
    fail_next_wait: AtomicBool,
}

impl FakeEngine {
    pub(crate) fn with_memory(free_bytes: usize, total_bytes: usize) -> Self {
        FakeEngine {
            free_bytes,
            total_bytes,
            ..Default::default()
        }
    }

    pub(crate) fn fail_next_wait(&self) {
        self.fail_next_wait.store(true, Ordering::SeqCst);
    }
}

impl TransferEngine for FakeEngine {
    type Buffer = FakeBuffer;
    type HostRegion = FakeHost;
    type Transfer = FakeTransfer;

    fn engine_name(&self) -> &str {
        "fake"
    }

    fn memory_info(&self) -> TransferResult<DeviceMemoryInfo> {
        Ok(DeviceMemoryInfo {
            free_bytes: self.free_bytes,
            total_bytes: self.total_bytes,
        })
    }

    fn alloc_pinned(&self, bytes: usize) -> TransferResult<FakeHost> {
        self.pinned_live.fetch_add(1, Ordering::SeqCst);
        Ok(FakeHost { capacity: bytes })
    }

    fn free_pinned(&self, _region: FakeHost) {
        self.pinned_live.fetch_sub(1, Ordering::SeqCst);
    }

    fn begin_device_to_host(
        &self,
        buffer: &FakeBuffer,
        host: &mut FakeHost,
    ) -> TransferResult<FakeTransfer> {
        assert!(host.capacity >= buffer.size_in_bytes());
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(FakeTransfer {
            direction: TransferDirection::DeviceToHost,
        })
    }

    fn begin_host_to_device(
        &self,
        host: &FakeHost,
        bytes: usize,
        buffer: &FakeBuffer,
    ) -> TransferResult<FakeTransfer> {
        assert!(bytes <= host.capacity);
        self.begins.fetch_add(1, Ordering::SeqCst);
        buffer.restore(bytes);
        Ok(FakeTransfer {
            direction: TransferDirection::HostToDevice,
        })
    }

    fn wait(&self, transfer: FakeTransfer) -> TransferResult<()> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        if self.fail_next_wait.swap(false, Ordering::SeqCst) {
            return Err(TransferError::copy(transfer.direction, "injected failure"));
        }
        Ok(())
    }
}
