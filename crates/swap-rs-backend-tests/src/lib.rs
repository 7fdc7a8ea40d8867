use std::sync::Arc;

use swap_rs::device::TransferEngine;

pub mod counting_engine;
pub mod smoke;

pub use counting_engine::{CountingEngine, EngineCalls};

/// Engine under test plus the content accessors the scenarios need to check data survives
/// a round trip.
pub struct BackendHarness<E: TransferEngine> {
    pub engine: Arc<E>,
    /// Creates a device buffer holding exactly the given bytes.
    pub upload: fn(&E, Vec<u8>) -> Arc<E::Buffer>,
    /// Reads a buffer's current contents back to the host.
    pub download: fn(&E::Buffer) -> Vec<u8>,
}

impl<E: TransferEngine> BackendHarness<E> {
    /// Buffer of `len` bytes filled with a pattern derived from `seed`.
    pub fn patterned(&self, len: usize, seed: u8) -> Arc<E::Buffer> {
        (self.upload)(&self.engine, pattern(len, seed))
    }

    pub fn read(&self, buffer: &E::Buffer) -> Vec<u8> {
        (self.download)(buffer)
    }
}

pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|index| (index as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $harness_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;
            use $crate::smoke;

            #[test]
            fn smoke_round_trip_preserves_contents() {
                let harness = ($harness_ctor)();
                smoke::round_trip_preserves_contents(&harness);
            }

            #[test]
            fn smoke_free_list_drops_only_listed_buffers() {
                let harness = ($harness_ctor)();
                smoke::free_list_drops_only_listed_buffers(&harness);
            }

            #[test]
            fn smoke_disabled_manager_moves_nothing() {
                let harness = ($harness_ctor)();
                smoke::disabled_manager_moves_nothing(&harness);
            }

            #[test]
            fn smoke_inference_traversal_moves_nothing() {
                let harness = ($harness_ctor)();
                smoke::inference_traversal_moves_nothing(&harness);
            }

            #[test]
            fn smoke_repeated_traversals_reuse_pinned_regions() {
                let harness = ($harness_ctor)();
                smoke::repeated_traversals_reuse_pinned_regions(&harness);
            }

            #[test]
            fn smoke_reinitialize_releases_pinned_regions() {
                let harness = ($harness_ctor)();
                smoke::reinitialize_releases_pinned_regions(&harness);
            }

            #[test]
            fn smoke_estimate_tracks_swapped_bytes() {
                let harness = ($harness_ctor)();
                smoke::estimate_tracks_swapped_bytes(&harness);
            }
        }
    };
}
