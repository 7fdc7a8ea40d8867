//! Construction-time configuration for the swap manager.

use serde::{Deserialize, Serialize};

use crate::env;

/// Explicit switch for memory swapping, passed to
/// [`SwapManager::new`](crate::manager::SwapManager::new).
///
/// Swapping is disabled by default; a disabled manager never creates actions and every hook
/// returns immediately.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl SwapConfig {
    pub fn enabled() -> Self {
        SwapConfig { enabled: true }
    }

    pub fn disabled() -> Self {
        SwapConfig { enabled: false }
    }

    /// Reads the switch from `SWAPRS_MEMORY_SWAPPING`; unset or blank means disabled.
    pub fn from_env() -> Self {
        SwapConfig {
            enabled: env::memory_swapping_requested(),
        }
    }
}
