//! Swap manager: owns the action registry and the installed schedule, and runs the actions
//! of each step when the executor calls the synchronization hooks.
//!
//! ## Hook protocol
//!
//! The executor drives one forward sweep followed by one backward sweep over the same steps
//! and brackets every step computation with [`SwapManager::before_step`] and
//! [`SwapManager::after_step`]:
//!
//! ```text
//!              before_step                 after_step
//! Forward   :  (nothing)                   swap out buffers evicted at this step
//! Backward  :  swap in buffers needed here free buffers never read again
//! ```
//!
//! Every action is issued and then waited on before the hook returns, so a step never
//! observes a buffer mid-transfer. The hooks do nothing while swapping is disabled or the
//! executor is not training.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use crate::action::{ActionId, ActionPair, SwapAction};
use crate::config::SwapConfig;
use crate::device::{bytes_to_gb, DeviceBuffer, TransferEngine, TransferResult};
use crate::error::SwapResult;
use crate::registry::BufferRegistry;
use crate::schedule::{StepKey, StepSchedule, SwapPlan};
use crate::stats::SwapStats;

/// Direction of a traversal over the step sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pass {
    Forward,
    Backward,
}

impl fmt::Display for Pass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pass::Forward => write!(f, "forward"),
            Pass::Backward => write!(f, "backward"),
        }
    }
}

pub struct SwapManager<S: StepKey, E: TransferEngine> {
    engine: Arc<E>,
    config: SwapConfig,
    registry: BufferRegistry<E>,
    schedule: StepSchedule<S, E::Buffer>,
    free_memory_base_gb: f64,
    total_memory_base_gb: f64,
    stats: SwapStats,
}

impl<S: StepKey, E: TransferEngine> SwapManager<S, E> {
    /// Creates a manager and records the device's free memory as the estimator baseline.
    pub fn new(engine: Arc<E>, config: SwapConfig) -> TransferResult<Self> {
        let memory = engine.memory_info()?;
        let manager = SwapManager {
            free_memory_base_gb: bytes_to_gb(memory.free_bytes),
            total_memory_base_gb: bytes_to_gb(memory.total_bytes),
            engine,
            config,
            registry: BufferRegistry::new(),
            schedule: StepSchedule::default(),
            stats: SwapStats::default(),
        };
        info!(
            engine = manager.engine.engine_name(),
            enabled = config.enabled,
            free_gb = manager.free_memory_base_gb,
            total_gb = manager.total_memory_base_gb,
            "swap manager created"
        );
        Ok(manager)
    }

    /// Installs the schedule for a new graph topology, tearing down the previous one first.
    ///
    /// # Panics
    ///
    /// Panics when the plan is inconsistent; see [`StepSchedule::build`].
    pub fn initialize(&mut self, plan: SwapPlan<S, E::Buffer>) {
        self.clear();
        plan.assert_balanced();
        if !self.config.enabled {
            debug!("memory swapping disabled; recording traversal order only");
            self.schedule = StepSchedule::with_timeline(plan.time_steps);
            return;
        }

        self.schedule = StepSchedule::build(plan, &mut self.registry);
        info!(
            buffers = self.registry.len(),
            steps = self.schedule.scheduled_steps(),
            max_time_step = self.schedule.max_time_step(),
            "swap schedule installed"
        );
    }

    /// Runs before a step's forward or backward computation.
    ///
    /// On the backward pass this restores every buffer the step needs.
    pub fn before_step(&mut self, step: &S, pass: Pass, training: bool) -> SwapResult<()> {
        if !self.active(training) {
            return Ok(());
        }
        if pass == Pass::Backward {
            let actions = self.schedule.backward_swap_in(step);
            run_actions(&mut self.registry, &mut self.stats, &self.engine, actions)?;
        }
        Ok(())
    }

    /// Runs after a step's forward or backward computation.
    ///
    /// On the forward pass this evicts the step's swap-out buffers; on the backward pass it
    /// releases the step's free-list buffers without keeping a host copy.
    pub fn after_step(&mut self, step: &S, pass: Pass, training: bool) -> SwapResult<()> {
        if !self.active(training) {
            return Ok(());
        }
        match pass {
            Pass::Forward => {
                let actions = self.schedule.forward_swap_out(step);
                run_actions(&mut self.registry, &mut self.stats, &self.engine, actions)?;
            }
            Pass::Backward => {
                for buffer in self.schedule.backward_free(step) {
                    let bytes = buffer.size_in_bytes();
                    buffer.release();
                    self.stats.record_free(bytes);
                    trace!(?step, bytes, "freed buffer");
                }
            }
        }
        Ok(())
    }

    /// Releases every pinned host region and drops all actions and per-step lists.
    ///
    /// The traversal order survives, so [`SwapManager::estimate`] keeps working on the
    /// emptied schedule.
    pub fn clear(&mut self) {
        let released = self.registry.release_all(&self.engine);
        self.schedule.clear_actions();
        debug!(pinned_bytes = released, "cleared swap actions");
    }

    fn active(&self, training: bool) -> bool {
        self.config.enabled && training
    }

    pub fn config(&self) -> SwapConfig {
        self.config
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn registry(&self) -> &BufferRegistry<E> {
        &self.registry
    }

    /// Registers (or looks up) the action pair of a buffer outside of a plan.
    ///
    /// Returns `None` while swapping is disabled; a disabled manager never creates actions.
    pub fn get_or_create_actions(&mut self, buffer: &Arc<E::Buffer>) -> Option<ActionPair> {
        self.config
            .enabled
            .then(|| self.registry.get_or_create(buffer))
    }

    pub fn actions_for(&self, buffer: &Arc<E::Buffer>) -> Option<ActionPair> {
        self.registry.pair_for(buffer)
    }

    pub fn action(&self, id: ActionId) -> Option<&SwapAction<E>> {
        self.registry.action(id)
    }

    pub fn schedule(&self) -> &StepSchedule<S, E::Buffer> {
        &self.schedule
    }

    pub fn max_time_step(&self) -> usize {
        self.schedule.max_time_step()
    }

    /// Free device memory measured at construction, in gigabytes.
    pub fn free_memory_base_gb(&self) -> f64 {
        self.free_memory_base_gb
    }

    /// Total device memory measured at construction, in gigabytes.
    pub fn total_memory_base_gb(&self) -> f64 {
        self.total_memory_base_gb
    }

    /// Snapshot of the hook counters plus the pinned host memory currently held.
    pub fn stats(&self) -> SwapStats {
        SwapStats {
            pinned_bytes: self.registry.pinned_bytes() as u64,
            ..self.stats
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = SwapStats::default();
    }

    /// Pinned host bytes currently held by swap-out actions.
    pub fn pinned_bytes(&self) -> usize {
        self.registry.pinned_bytes()
    }
}

impl<S: StepKey, E: TransferEngine> Drop for SwapManager<S, E> {
    fn drop(&mut self) {
        self.registry.release_all(&self.engine);
    }
}

fn run_actions<E: TransferEngine>(
    registry: &mut BufferRegistry<E>,
    stats: &mut SwapStats,
    engine: &E,
    actions: &[ActionId],
) -> SwapResult<()> {
    for &id in actions {
        let completed = registry.run(id, engine)?;
        stats.record(completed);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::action::TransferPhase;
    use crate::error::SwapError;
    use crate::testing::{FakeBuffer, FakeEngine};

    fn engine() -> Arc<FakeEngine> {
        Arc::new(FakeEngine::with_memory(1 << 30, 1 << 32))
    }

    fn two_step_plan(
        evicted: &Arc<FakeBuffer>,
        dropped: &Arc<FakeBuffer>,
    ) -> SwapPlan<&'static str, FakeBuffer> {
        SwapPlan::new()
            .time_step("fc1", 0)
            .time_step("fc2", 1)
            .swap_out_after_forward("fc1", evicted)
            .swap_in_before_backward("fc2", evicted)
            .free_after_backward("fc2", dropped)
    }

    #[test]
    fn construction_records_memory_baseline() {
        let manager: SwapManager<u32, FakeEngine> =
            SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        assert_eq!(manager.free_memory_base_gb(), 1.0);
        assert_eq!(manager.total_memory_base_gb(), 4.0);
        assert_eq!(manager.max_time_step(), 0);
    }

    #[test]
    fn full_traversal_evicts_restores_and_frees() {
        let mut manager = SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        let evicted = Arc::new(FakeBuffer::new(512));
        let dropped = Arc::new(FakeBuffer::new(64));
        let bystander = Arc::new(FakeBuffer::new(32));
        manager.initialize(two_step_plan(&evicted, &dropped));

        for step in ["fc1", "fc2"] {
            manager.before_step(&step, Pass::Forward, true).unwrap();
            manager.after_step(&step, Pass::Forward, true).unwrap();
        }
        assert_eq!(evicted.size_in_bytes(), 0);
        assert_eq!(manager.pinned_bytes(), 512);

        manager.before_step(&"fc2", Pass::Backward, true).unwrap();
        assert_eq!(evicted.size_in_bytes(), 512);
        manager.after_step(&"fc2", Pass::Backward, true).unwrap();
        assert_eq!(dropped.size_in_bytes(), 0);
        manager.before_step(&"fc1", Pass::Backward, true).unwrap();
        manager.after_step(&"fc1", Pass::Backward, true).unwrap();

        assert_eq!(bystander.size_in_bytes(), 32);
        let stats = manager.stats();
        assert_eq!(stats.swap_outs, 1);
        assert_eq!(stats.swap_ins, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.bytes_swapped_out, 512);
        assert_eq!(stats.bytes_freed, 64);
        assert_eq!(stats.pinned_bytes, 512);
        assert_eq!(manager.engine().waits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn inactive_hooks_do_nothing() {
        let mut manager = SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        let evicted = Arc::new(FakeBuffer::new(512));
        let dropped = Arc::new(FakeBuffer::new(64));
        manager.initialize(two_step_plan(&evicted, &dropped));

        manager.after_step(&"fc1", Pass::Forward, false).unwrap();
        manager.after_step(&"fc2", Pass::Backward, false).unwrap();

        assert_eq!(evicted.size_in_bytes(), 512);
        assert_eq!(dropped.size_in_bytes(), 64);
        assert_eq!(manager.engine().begins.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn disabled_manager_never_creates_actions() {
        let mut manager = SwapManager::new(engine(), SwapConfig::disabled()).unwrap();
        let evicted = Arc::new(FakeBuffer::new(512));
        let dropped = Arc::new(FakeBuffer::new(64));
        manager.initialize(two_step_plan(&evicted, &dropped));

        assert!(manager.registry().is_empty());
        assert_eq!(manager.max_time_step(), 1);
        for step in ["fc1", "fc2"] {
            manager.after_step(&step, Pass::Forward, true).unwrap();
        }
        for step in ["fc2", "fc1"] {
            manager.before_step(&step, Pass::Backward, true).unwrap();
            manager.after_step(&step, Pass::Backward, true).unwrap();
        }

        assert_eq!(evicted.size_in_bytes(), 512);
        assert_eq!(dropped.size_in_bytes(), 64);
        assert_eq!(manager.stats(), SwapStats::default());
    }

    #[test]
    #[should_panic(expected = "swap plan lists 2 swap-out steps but 1 swap-in steps")]
    fn mismatched_tables_fail_the_cardinality_check() {
        let mut manager = SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        let a = Arc::new(FakeBuffer::new(8));
        let b = Arc::new(FakeBuffer::new(8));
        let plan = SwapPlan::new()
            .time_step("fc1", 0)
            .time_step("fc2", 1)
            .swap_out_after_forward("fc1", &a)
            .swap_out_after_forward("fc2", &b)
            .swap_in_before_backward("fc2", &a);
        manager.initialize(plan);
    }

    #[test]
    #[should_panic(expected = "swap plan lists 1 swap-out steps but 0 swap-in steps")]
    fn disabled_manager_still_checks_plan_balance() {
        let mut manager = SwapManager::new(engine(), SwapConfig::disabled()).unwrap();
        let evicted = Arc::new(FakeBuffer::new(8));
        let plan = SwapPlan::new()
            .time_step("fc1", 0)
            .swap_out_after_forward("fc1", &evicted);
        manager.initialize(plan);
    }

    #[test]
    fn get_or_create_actions_respects_disabled_config() {
        let buffer = Arc::new(FakeBuffer::new(8));

        let mut disabled: SwapManager<u32, FakeEngine> =
            SwapManager::new(engine(), SwapConfig::disabled()).unwrap();
        assert_eq!(disabled.get_or_create_actions(&buffer), None);
        assert!(disabled.registry().is_empty());

        let mut enabled: SwapManager<u32, FakeEngine> =
            SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        let pair = enabled.get_or_create_actions(&buffer).unwrap();
        assert_eq!(enabled.get_or_create_actions(&buffer), Some(pair));
        assert_eq!(enabled.action(pair.swap_in).unwrap().source(), Some(pair.swap_out));
    }

    #[test]
    fn restored_copy_is_not_restored_again() {
        let mut manager = SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        let activation = Arc::new(FakeBuffer::new(64));
        let plan = SwapPlan::new()
            .time_step("fc1", 0)
            .time_step("fc2", 1)
            .swap_out_after_forward("fc1", &activation)
            .swap_in_before_backward("fc2", &activation)
            .free_after_backward("fc1", &activation);
        manager.initialize(plan);

        for step in ["fc1", "fc2"] {
            manager.after_step(&step, Pass::Forward, true).unwrap();
        }
        manager.before_step(&"fc2", Pass::Backward, true).unwrap();
        assert_eq!(activation.size_in_bytes(), 64);
        manager.after_step(&"fc1", Pass::Backward, true).unwrap();
        assert_eq!(activation.size_in_bytes(), 0);

        manager.after_step(&"fc1", Pass::Forward, true).unwrap();
        let err = manager
            .before_step(&"fc2", Pass::Backward, true)
            .unwrap_err();

        assert!(matches!(err, SwapError::MissingHostCopy { .. }));
        assert_eq!(activation.size_in_bytes(), 0);
        let stats = manager.stats();
        assert_eq!(stats.swap_outs, 1);
        assert_eq!(stats.swap_ins, 1);
        assert_eq!(stats.skipped, 1);
    }

    #[test]
    fn reinitialize_releases_previous_host_memory() {
        let mut manager = SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        let evicted = Arc::new(FakeBuffer::new(512));
        let dropped = Arc::new(FakeBuffer::new(64));
        manager.initialize(two_step_plan(&evicted, &dropped));
        manager.after_step(&"fc1", Pass::Forward, true).unwrap();
        assert_eq!(manager.engine().pinned_live.load(Ordering::SeqCst), 1);
        let old_pair = manager.actions_for(&evicted).unwrap();
        assert_eq!(
            manager.action(old_pair.swap_out).unwrap().phase(),
            TransferPhase::Complete
        );

        let other = Arc::new(FakeBuffer::new(16));
        manager.initialize(two_step_plan(&other, &dropped));

        assert_eq!(manager.engine().pinned_live.load(Ordering::SeqCst), 0);
        assert!(manager.actions_for(&evicted).is_none());
        assert!(manager.actions_for(&other).is_some());
    }

    #[test]
    fn clear_is_idempotent() {
        let mut manager: SwapManager<&str, FakeEngine> =
            SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        manager.clear();
        manager.clear();
        assert!(manager.registry().is_empty());
        assert_eq!(manager.pinned_bytes(), 0);
    }

    #[test]
    fn transfer_failure_propagates_out_of_the_hook() {
        let mut manager = SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        let evicted = Arc::new(FakeBuffer::new(512));
        let dropped = Arc::new(FakeBuffer::new(64));
        manager.initialize(two_step_plan(&evicted, &dropped));
        manager.engine().fail_next_wait();

        let err = manager
            .after_step(&"fc1", Pass::Forward, true)
            .unwrap_err();
        assert!(matches!(err, SwapError::Transfer { .. }));
        assert_eq!(manager.stats().swap_outs, 0);
    }

    #[test]
    fn shared_buffer_across_steps_moves_once() {
        let mut manager = SwapManager::new(engine(), SwapConfig::enabled()).unwrap();
        let shared = Arc::new(FakeBuffer::new(100));
        let plan = SwapPlan::new()
            .time_step(0u32, 0)
            .time_step(1u32, 1)
            .swap_out_after_forward(0, &shared)
            .swap_out_after_forward(1, &shared)
            .swap_in_before_backward(1, &shared)
            .swap_in_before_backward(0, &shared);
        manager.initialize(plan);
        assert_eq!(manager.registry().len(), 1);

        manager.after_step(&0, Pass::Forward, true).unwrap();
        manager.after_step(&1, Pass::Forward, true).unwrap();
        manager.before_step(&1, Pass::Backward, true).unwrap();
        manager.before_step(&0, Pass::Backward, true).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.transfers(), 2);
        assert_eq!(stats.skipped, 2);
        assert_eq!(shared.size_in_bytes(), 100);
    }
}
