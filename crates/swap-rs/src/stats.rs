use serde::Serialize;

use crate::action::ActionKind;
use crate::registry::Completed;

/// Running totals of the work performed by the hooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SwapStats {
    pub swap_outs: u64,
    pub swap_ins: u64,
    pub frees: u64,
    /// Actions that found their buffer already in place and moved nothing.
    pub skipped: u64,
    pub bytes_swapped_out: u64,
    pub bytes_swapped_in: u64,
    pub bytes_freed: u64,
    /// Pinned host bytes held by swap-out actions when the snapshot was taken.
    pub pinned_bytes: u64,
}

impl SwapStats {
    pub(crate) fn record(&mut self, completed: Completed) {
        if completed.bytes == 0 {
            self.skipped += 1;
            return;
        }
        let bytes = completed.bytes as u64;
        match completed.kind {
            ActionKind::SwapOut => {
                self.swap_outs += 1;
                self.bytes_swapped_out += bytes;
            }
            ActionKind::SwapIn => {
                self.swap_ins += 1;
                self.bytes_swapped_in += bytes;
            }
        }
    }

    pub(crate) fn record_free(&mut self, bytes: usize) {
        self.frees += 1;
        self.bytes_freed += bytes as u64;
    }

    /// Completed transfers in either direction.
    pub fn transfers(&self) -> u64 {
        self.swap_outs + self.swap_ins
    }
}
