//! Per-step action lists built from a precomputed swap plan.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::action::ActionId;
use crate::device::TransferEngine;
use crate::registry::BufferRegistry;

/// Identity of a step in the traversal, supplied by the graph executor.
pub trait StepKey: Eq + Hash + Clone + fmt::Debug {}

impl<T: Eq + Hash + Clone + fmt::Debug> StepKey for T {}

/// Assignment tables produced by the planner.
///
/// Buffers listed for one step are handled in the order they were added.
pub struct SwapPlan<S, B> {
    /// Buffers to evict after the step's forward computation.
    pub forward_swap_out: HashMap<S, Vec<Arc<B>>>,
    /// Buffers to restore before the step's backward computation.
    pub backward_swap_in: HashMap<S, Vec<Arc<B>>>,
    /// Buffers to drop after the step's backward computation.
    pub backward_free: HashMap<S, Vec<Arc<B>>>,
    /// Position of each step in the traversal order.
    pub time_steps: HashMap<S, usize>,
}

impl<S, B> Default for SwapPlan<S, B> {
    fn default() -> Self {
        SwapPlan {
            forward_swap_out: HashMap::new(),
            backward_swap_in: HashMap::new(),
            backward_free: HashMap::new(),
            time_steps: HashMap::new(),
        }
    }
}

impl<S: StepKey, B> SwapPlan<S, B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn time_step(mut self, step: S, time_step: usize) -> Self {
        self.time_steps.insert(step, time_step);
        self
    }

    pub fn swap_out_after_forward(mut self, step: S, buffer: &Arc<B>) -> Self {
        self.forward_swap_out
            .entry(step)
            .or_default()
            .push(Arc::clone(buffer));
        self
    }

    pub fn swap_in_before_backward(mut self, step: S, buffer: &Arc<B>) -> Self {
        self.backward_swap_in
            .entry(step)
            .or_default()
            .push(Arc::clone(buffer));
        self
    }

    pub fn free_after_backward(mut self, step: S, buffer: &Arc<B>) -> Self {
        self.backward_free
            .entry(step)
            .or_default()
            .push(Arc::clone(buffer));
        self
    }

    /// Checks that the swap-out and swap-in tables name the same number of steps.
    ///
    /// # Panics
    ///
    /// Panics on a mismatch; every evicted buffer is expected to come back somewhere.
    pub fn assert_balanced(&self) {
        assert_eq!(
            self.forward_swap_out.len(),
            self.backward_swap_in.len(),
            "swap plan lists {} swap-out steps but {} swap-in steps",
            self.forward_swap_out.len(),
            self.backward_swap_in.len()
        );
    }
}

/// Everything scheduled for one step.
pub struct StepActions<B> {
    pub forward_swap_out: SmallVec<[ActionId; 4]>,
    pub backward_swap_in: SmallVec<[ActionId; 4]>,
    pub backward_free: Vec<Arc<B>>,
}

impl<B> Default for StepActions<B> {
    fn default() -> Self {
        StepActions {
            forward_swap_out: SmallVec::new(),
            backward_swap_in: SmallVec::new(),
            backward_free: Vec::new(),
        }
    }
}

/// Installed schedule: per-step action lists plus the traversal order.
pub struct StepSchedule<S, B> {
    steps: HashMap<S, StepActions<B>>,
    /// Step occupying each time step; `None` marks a position no step claimed.
    timeline: Vec<Option<S>>,
    max_time_step: usize,
}

impl<S: StepKey, B> Default for StepSchedule<S, B> {
    fn default() -> Self {
        StepSchedule {
            steps: HashMap::new(),
            timeline: Vec::new(),
            max_time_step: 0,
        }
    }
}

impl<S: StepKey, B> StepSchedule<S, B> {
    /// Builds the per-step lists, registering action pairs for every swapped buffer.
    ///
    /// # Panics
    ///
    /// Panics when the swap-out and swap-in tables name a different number of steps, or when
    /// two steps claim the same time step. Both mean the planner produced an inconsistent plan.
    pub fn build<E>(plan: SwapPlan<S, B>, registry: &mut BufferRegistry<E>) -> Self
    where
        E: TransferEngine<Buffer = B>,
    {
        plan.assert_balanced();
        let SwapPlan {
            forward_swap_out,
            backward_swap_in,
            backward_free,
            time_steps,
        } = plan;

        let mut schedule = Self::with_timeline(time_steps);
        for (step, buffers) in forward_swap_out {
            let entry = schedule.steps.entry(step).or_default();
            for buffer in &buffers {
                entry
                    .forward_swap_out
                    .push(registry.get_or_create(buffer).swap_out);
            }
        }
        for (step, buffers) in backward_swap_in {
            let entry = schedule.steps.entry(step).or_default();
            for buffer in &buffers {
                entry
                    .backward_swap_in
                    .push(registry.get_or_create(buffer).swap_in);
            }
        }
        for (step, buffers) in backward_free {
            schedule.steps.entry(step).or_default().backward_free = buffers;
        }
        schedule
    }

    /// Schedule that only knows the traversal order.
    ///
    /// Time steps are positions in a traversal and are expected to be dense: the timeline
    /// holds one slot per position up to the largest one, so gaps cost a slot each.
    ///
    /// # Panics
    ///
    /// Panics when two steps claim the same time step or the largest time step is `usize::MAX`.
    pub fn with_timeline(time_steps: HashMap<S, usize>) -> Self {
        let max_time_step = time_steps.values().copied().max().unwrap_or(0);
        let mut timeline: Vec<Option<S>> = Vec::new();
        if !time_steps.is_empty() {
            let slots = max_time_step.checked_add(1).unwrap_or_else(|| {
                panic!("time step {max_time_step} leaves no room for a timeline")
            });
            timeline.resize(slots, None);
        }
        for (step, time_step) in time_steps {
            let slot = &mut timeline[time_step];
            assert!(
                slot.is_none(),
                "time step {time_step} claimed by both {:?} and {step:?}",
                slot.as_ref()
            );
            *slot = Some(step);
        }
        StepSchedule {
            steps: HashMap::new(),
            timeline,
            max_time_step,
        }
    }

    pub fn step(&self, step: &S) -> Option<&StepActions<B>> {
        self.steps.get(step)
    }

    pub fn forward_swap_out(&self, step: &S) -> &[ActionId] {
        self.steps
            .get(step)
            .map(|actions| actions.forward_swap_out.as_slice())
            .unwrap_or(&[])
    }

    pub fn backward_swap_in(&self, step: &S) -> &[ActionId] {
        self.steps
            .get(step)
            .map(|actions| actions.backward_swap_in.as_slice())
            .unwrap_or(&[])
    }

    pub fn backward_free(&self, step: &S) -> &[Arc<B>] {
        self.steps
            .get(step)
            .map(|actions| actions.backward_free.as_slice())
            .unwrap_or(&[])
    }

    /// Step at `time_step`, if one was supplied.
    pub fn step_at(&self, time_step: usize) -> Option<&S> {
        self.timeline.get(time_step).and_then(Option::as_ref)
    }

    pub fn max_time_step(&self) -> usize {
        self.max_time_step
    }

    /// Number of steps with at least one scheduled entry.
    pub fn scheduled_steps(&self) -> usize {
        self.steps.len()
    }

    /// Drops every per-step list but keeps the traversal order.
    pub fn clear_actions(&mut self) {
        self.steps.clear();
    }
}
