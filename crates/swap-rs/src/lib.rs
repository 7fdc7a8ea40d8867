//! Per-step device memory swapping for forward/backward step traversals.
//!
//! A planner decides which buffers leave device memory after a step's forward computation,
//! which come back before a step's backward computation, and which are dropped once the
//! backward pass no longer reads them. [`SwapManager`] turns that plan into swap actions,
//! runs them from the executor's step hooks, and projects free device memory for a
//! candidate plan with [`SwapManager::estimate`].

pub mod action;
pub mod config;
pub mod device;
mod env;
pub mod error;
pub mod estimator;
pub mod manager;
pub mod registry;
pub mod schedule;
pub mod stats;
#[cfg(test)]
mod testing;

pub use action::{ActionId, ActionKind, ActionPair, SwapAction, TransferPhase};
pub use config::SwapConfig;
pub use device::{
    bytes_to_gb, DeviceBuffer, DeviceMemoryInfo, TransferDirection, TransferEngine,
    TransferError, TransferResult, BYTES_PER_GB,
};
pub use env::MEMORY_SWAPPING_VAR;
pub use error::{SwapError, SwapResult};
pub use estimator::{MemoryEstimate, MemoryProjection};
pub use manager::{Pass, SwapManager};
pub use registry::{BufferKey, BufferRegistry, Completed};
pub use schedule::{StepActions, StepKey, StepSchedule, SwapPlan};
pub use stats::SwapStats;
