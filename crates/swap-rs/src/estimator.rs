//! Offline projection of free device memory across a traversal of the installed schedule.
//!
//! The projection is a running sum, not a timing model: starting from the free memory
//! measured at construction, each visited step adds the bytes it swaps in and subtracts the
//! bytes it swaps out or frees. It is meant for checking whether a candidate plan fits before
//! running it.

use std::collections::HashMap;

use serde::Serialize;

use crate::device::{bytes_to_gb, DeviceBuffer, TransferEngine};
use crate::manager::{Pass, SwapManager};
use crate::schedule::{StepKey, StepSchedule};

/// Projected free memory after one step visit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryEstimate {
    pub time_step: usize,
    pub pass: Pass,
    pub free_gb: f64,
}

/// Ordered visits of one estimator run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MemoryProjection {
    visits: Vec<MemoryEstimate>,
}

impl MemoryProjection {
    pub fn visits(&self) -> &[MemoryEstimate] {
        &self.visits
    }

    pub fn len(&self) -> usize {
        self.visits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visits.is_empty()
    }

    /// Value recorded by the latest visit of `time_step`.
    pub fn at(&self, time_step: usize) -> Option<f64> {
        self.visits
            .iter()
            .rev()
            .find(|visit| visit.time_step == time_step)
            .map(|visit| visit.free_gb)
    }

    /// Value recorded by the latest visit of `time_step` during `pass`.
    pub fn at_pass(&self, time_step: usize, pass: Pass) -> Option<f64> {
        self.visits
            .iter()
            .rev()
            .find(|visit| visit.time_step == time_step && visit.pass == pass)
            .map(|visit| visit.free_gb)
    }

    /// Collapses the visits into one value per time step, later visits winning.
    pub fn to_map(&self) -> HashMap<usize, f64> {
        self.visits
            .iter()
            .map(|visit| (visit.time_step, visit.free_gb))
            .collect()
    }

    /// Lowest projected free memory over the run.
    pub fn min_free_gb(&self) -> Option<f64> {
        self.visits
            .iter()
            .map(|visit| visit.free_gb)
            .min_by(f64::total_cmp)
    }

    /// True when no visit projects negative free memory.
    pub fn fits(&self) -> bool {
        self.min_free_gb().map_or(true, |min| min >= 0.0)
    }
}

/// Next visit of the two-phase traversal: forward while the following time step exists,
/// then backward down to time step 0.
fn next_visit<S: StepKey, B>(
    schedule: &StepSchedule<S, B>,
    time_step: usize,
    pass: Pass,
) -> Option<(usize, Pass)> {
    if pass == Pass::Forward && schedule.step_at(time_step + 1).is_some() {
        return Some((time_step + 1, Pass::Forward));
    }
    time_step
        .checked_sub(1)
        .map(|previous| (previous, Pass::Backward))
}

impl<S: StepKey, E: TransferEngine> SwapManager<S, E> {
    /// Projects free device memory, in gigabytes, for each step visited from `start` to `end`.
    ///
    /// The traversal runs backward when `start` is the last time step and forward otherwise,
    /// turning backward once the forward sequence ends. It stops after visiting `end` on any
    /// visit but the first, or once the backward sweep has passed time step 0.
    ///
    /// Swap sizes use each action's recorded footprint; freed sizes use the buffer's current
    /// size.
    ///
    /// # Panics
    ///
    /// Panics when `start` or `end` lies beyond [`SwapManager::max_time_step`].
    pub fn estimate(&self, start: usize, end: usize) -> MemoryProjection {
        let schedule = self.schedule();
        let registry = self.registry();
        let max_time_step = schedule.max_time_step();
        assert!(
            start <= max_time_step && end <= max_time_step,
            "estimate range {start}..={end} exceeds max time step {max_time_step}"
        );

        let base_gb = self.free_memory_base_gb();
        let mut swap_in_gb = 0.0;
        let mut swap_out_gb = 0.0;
        let mut freed_gb = 0.0;
        let mut visits = Vec::new();

        let first_pass = if start == max_time_step {
            Pass::Backward
        } else {
            Pass::Forward
        };
        let mut cursor = Some((start, first_pass));
        while let Some((time_step, pass)) = cursor {
            if let Some(step) = schedule.step_at(time_step) {
                match pass {
                    Pass::Forward => {
                        for &id in schedule.forward_swap_out(step) {
                            swap_out_gb += bytes_to_gb(registry.footprint_bytes(id));
                        }
                    }
                    Pass::Backward => {
                        for &id in schedule.backward_swap_in(step) {
                            swap_in_gb += bytes_to_gb(registry.footprint_bytes(id));
                        }
                        for buffer in schedule.backward_free(step) {
                            freed_gb += bytes_to_gb(buffer.size_in_bytes());
                        }
                    }
                }
            }

            visits.push(MemoryEstimate {
                time_step,
                pass,
                free_gb: base_gb + swap_in_gb - swap_out_gb - freed_gb,
            });
            if visits.len() > 1 && time_step == end {
                break;
            }
            cursor = next_visit(schedule, time_step, pass);
        }

        MemoryProjection { visits }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::SwapConfig;
    use crate::device::BYTES_PER_GB;
    use crate::manager::{Pass, SwapManager};
    use crate::schedule::SwapPlan;
    use crate::testing::{FakeBuffer, FakeEngine};

    const GB: usize = BYTES_PER_GB as usize;

    fn manager(free_gb: usize) -> SwapManager<usize, FakeEngine> {
        let engine = Arc::new(FakeEngine::with_memory(free_gb * GB, 16 * GB));
        SwapManager::new(engine, SwapConfig::enabled()).unwrap()
    }

    #[test]
    fn swap_out_then_free_follows_running_sum() {
        let mut manager = manager(8);
        let activation = Arc::new(FakeBuffer::new(2 * GB));
        let scratch = Arc::new(FakeBuffer::new(GB));
        let mut plan = SwapPlan::new()
            .time_step(0, 0)
            .time_step(1, 1)
            .swap_out_after_forward(0, &activation)
            .free_after_backward(0, &scratch);
        plan.backward_swap_in.insert(0, Vec::new());
        manager.initialize(plan);
        assert_eq!(manager.max_time_step(), 1);

        let projection = manager.estimate(0, 0);

        let visits: Vec<_> = projection
            .visits()
            .iter()
            .map(|visit| (visit.time_step, visit.pass, visit.free_gb))
            .collect();
        assert_eq!(
            visits,
            vec![
                (0, Pass::Forward, 6.0),
                (1, Pass::Forward, 6.0),
                (0, Pass::Backward, 5.0),
            ]
        );
        assert_eq!(projection.at_pass(0, Pass::Forward), Some(6.0));
        assert_eq!(projection.at(0), Some(5.0));
        assert_eq!(projection.to_map().len(), 2);
    }

    #[test]
    fn swap_in_adds_back_the_swapped_out_footprint() {
        let engine = Arc::new(FakeEngine::with_memory(8 * GB, 16 * GB));
        let mut manager: SwapManager<&str, FakeEngine> =
            SwapManager::new(engine, SwapConfig::enabled()).unwrap();
        let activation = Arc::new(FakeBuffer::new(GB));
        let plan = SwapPlan::new()
            .time_step("embed", 0)
            .time_step("block", 1)
            .time_step("head", 2)
            .swap_out_after_forward("embed", &activation)
            .swap_in_before_backward("block", &activation);
        manager.initialize(plan);

        let projection = manager.estimate(0, 0);

        assert_eq!(projection.at_pass(0, Pass::Forward), Some(7.0));
        assert_eq!(projection.at_pass(2, Pass::Forward), Some(7.0));
        assert_eq!(projection.at_pass(1, Pass::Backward), Some(8.0));
        assert_eq!(projection.at(0), Some(8.0));
        assert_eq!(projection.min_free_gb(), Some(7.0));
        assert!(projection.fits());
    }

    #[test]
    fn starting_at_last_step_runs_backward_only() {
        let mut manager = manager(4);
        let weights = Arc::new(FakeBuffer::new(GB));
        let plan = SwapPlan::new()
            .time_step(0, 0)
            .time_step(1, 1)
            .time_step(2, 2)
            .free_after_backward(2, &weights);
        manager.initialize(plan);

        let projection = manager.estimate(2, 0);

        let passes: Vec<_> = projection
            .visits()
            .iter()
            .map(|visit| (visit.time_step, visit.pass))
            .collect();
        assert_eq!(
            passes,
            vec![(2, Pass::Backward), (1, Pass::Backward), (0, Pass::Backward)]
        );
        assert_eq!(projection.at(2), Some(3.0));
        assert_eq!(projection.at(0), Some(3.0));
    }

    #[test]
    fn forward_end_stops_before_turning_around() {
        let mut manager = manager(4);
        let plan: SwapPlan<usize, FakeBuffer> = SwapPlan::new()
            .time_step(0, 0)
            .time_step(1, 1)
            .time_step(2, 2)
            .time_step(3, 3);
        manager.initialize(plan);

        let projection = manager.estimate(1, 2);

        assert_eq!(projection.len(), 2);
        assert!(projection
            .visits()
            .iter()
            .all(|visit| visit.pass == Pass::Forward));
    }

    #[test]
    fn cleared_schedule_projects_baseline_everywhere() {
        let mut manager = manager(8);
        let activation = Arc::new(FakeBuffer::new(2 * GB));
        let plan = SwapPlan::new()
            .time_step(0, 0)
            .time_step(1, 1)
            .swap_out_after_forward(0, &activation)
            .swap_in_before_backward(1, &activation);
        manager.initialize(plan);
        manager.clear();

        let projection = manager.estimate(0, 0);

        assert!(!projection.is_empty());
        assert!(projection.visits().iter().all(|visit| visit.free_gb == 8.0));
    }

    #[test]
    #[should_panic(expected = "exceeds max time step")]
    fn out_of_range_start_panics() {
        let mut manager = manager(8);
        let plan: SwapPlan<usize, FakeBuffer> = SwapPlan::new().time_step(0, 0).time_step(1, 1);
        manager.initialize(plan);
        let _ = manager.estimate(2, 0);
    }
}
