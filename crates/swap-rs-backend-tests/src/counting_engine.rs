use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use swap_rs::device::{DeviceMemoryInfo, TransferEngine, TransferResult};

/// Snapshot of the calls a [`CountingEngine`] forwarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineCalls {
    pub device_to_host: usize,
    pub host_to_device: usize,
    pub waits: usize,
    pub pinned_allocs: usize,
    pub pinned_frees: usize,
}

impl EngineCalls {
    pub fn pinned_live(&self) -> usize {
        self.pinned_allocs - self.pinned_frees
    }
}

/// Test-only engine wrapper that counts every call before forwarding it.
pub struct CountingEngine<E> {
    inner: Arc<E>,
    device_to_host: AtomicUsize,
    host_to_device: AtomicUsize,
    waits: AtomicUsize,
    pinned_allocs: AtomicUsize,
    pinned_frees: AtomicUsize,
}

impl<E: TransferEngine> CountingEngine<E> {
    pub fn new(inner: Arc<E>) -> Self {
        CountingEngine {
            inner,
            device_to_host: AtomicUsize::new(0),
            host_to_device: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            pinned_allocs: AtomicUsize::new(0),
            pinned_frees: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<E> {
        &self.inner
    }

    pub fn calls(&self) -> EngineCalls {
        EngineCalls {
            device_to_host: self.device_to_host.load(Ordering::SeqCst),
            host_to_device: self.host_to_device.load(Ordering::SeqCst),
            waits: self.waits.load(Ordering::SeqCst),
            pinned_allocs: self.pinned_allocs.load(Ordering::SeqCst),
            pinned_frees: self.pinned_frees.load(Ordering::SeqCst),
        }
    }
}

impl<E: TransferEngine> TransferEngine for CountingEngine<E> {
    type Buffer = E::Buffer;
    type HostRegion = E::HostRegion;
    type Transfer = E::Transfer;

    fn engine_name(&self) -> &str {
        self.inner.engine_name()
    }

    fn memory_info(&self) -> TransferResult<DeviceMemoryInfo> {
        self.inner.memory_info()
    }

    fn alloc_pinned(&self, bytes: usize) -> TransferResult<Self::HostRegion> {
        let region = self.inner.alloc_pinned(bytes)?;
        self.pinned_allocs.fetch_add(1, Ordering::SeqCst);
        Ok(region)
    }

    fn free_pinned(&self, region: Self::HostRegion) {
        self.pinned_frees.fetch_add(1, Ordering::SeqCst);
        self.inner.free_pinned(region);
    }

    fn begin_device_to_host(
        &self,
        buffer: &Self::Buffer,
        host: &mut Self::HostRegion,
    ) -> TransferResult<Self::Transfer> {
        self.device_to_host.fetch_add(1, Ordering::SeqCst);
        self.inner.begin_device_to_host(buffer, host)
    }

    fn begin_host_to_device(
        &self,
        host: &Self::HostRegion,
        bytes: usize,
        buffer: &Self::Buffer,
    ) -> TransferResult<Self::Transfer> {
        self.host_to_device.fetch_add(1, Ordering::SeqCst);
        self.inner.begin_host_to_device(host, bytes, buffer)
    }

    fn wait(&self, transfer: Self::Transfer) -> TransferResult<()> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        self.inner.wait(transfer)
    }
}
