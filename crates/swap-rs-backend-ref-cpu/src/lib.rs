pub mod cpu;

pub use cpu::{CpuBuffer, CpuDevice, CpuTransfer, PinnedHostBuffer, DEFAULT_CAPACITY_BYTES};
