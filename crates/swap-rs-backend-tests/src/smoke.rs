use std::sync::Arc;

use swap_rs::device::{bytes_to_gb, DeviceBuffer, TransferEngine};
use swap_rs::{Pass, StepKey, SwapConfig, SwapManager, SwapPlan};

use crate::{pattern, BackendHarness, CountingEngine, EngineCalls};

type Manager<E> = SwapManager<&'static str, CountingEngine<E>>;

fn counting_manager<E: TransferEngine>(
    harness: &BackendHarness<E>,
    config: SwapConfig,
) -> Manager<E> {
    let engine = Arc::new(CountingEngine::new(Arc::clone(&harness.engine)));
    SwapManager::new(engine, config).unwrap()
}

/// Drives one forward sweep over `steps` and one backward sweep in reverse order.
pub fn traverse<S: StepKey, E: TransferEngine>(
    manager: &mut SwapManager<S, E>,
    steps: &[S],
    training: bool,
) {
    for step in steps {
        manager.before_step(step, Pass::Forward, training).unwrap();
        manager.after_step(step, Pass::Forward, training).unwrap();
    }
    for step in steps.iter().rev() {
        manager.before_step(step, Pass::Backward, training).unwrap();
        manager.after_step(step, Pass::Backward, training).unwrap();
    }
}

const STEPS: [&str; 3] = ["embed", "block", "head"];

fn three_step_plan<B>(first: &Arc<B>, second: &Arc<B>) -> SwapPlan<&'static str, B> {
    SwapPlan::new()
        .time_step("embed", 0)
        .time_step("block", 1)
        .time_step("head", 2)
        .swap_out_after_forward("embed", first)
        .swap_in_before_backward("block", first)
        .swap_out_after_forward("block", second)
        .swap_in_before_backward("head", second)
}

pub fn round_trip_preserves_contents<E: TransferEngine>(harness: &BackendHarness<E>) {
    let mut manager = counting_manager(harness, SwapConfig::enabled());
    let activation = harness.patterned(4096, 1);
    let residual = harness.patterned(1024, 2);
    manager.initialize(three_step_plan(&activation, &residual));

    manager.before_step(&"embed", Pass::Forward, true).unwrap();
    manager.after_step(&"embed", Pass::Forward, true).unwrap();
    assert_eq!(activation.size_in_bytes(), 0);
    assert_eq!(residual.size_in_bytes(), 1024);
    for step in ["block", "head"] {
        manager.before_step(&step, Pass::Forward, true).unwrap();
        manager.after_step(&step, Pass::Forward, true).unwrap();
    }
    assert_eq!(residual.size_in_bytes(), 0);

    manager.before_step(&"head", Pass::Backward, true).unwrap();
    assert_eq!(harness.read(&residual), pattern(1024, 2));
    assert_eq!(activation.size_in_bytes(), 0);
    manager.after_step(&"head", Pass::Backward, true).unwrap();
    for step in ["block", "embed"] {
        manager.before_step(&step, Pass::Backward, true).unwrap();
        manager.after_step(&step, Pass::Backward, true).unwrap();
    }

    assert_eq!(harness.read(&activation), pattern(4096, 1));
    assert_eq!(
        manager.engine().calls(),
        EngineCalls {
            device_to_host: 2,
            host_to_device: 2,
            waits: 4,
            pinned_allocs: 2,
            pinned_frees: 0,
        }
    );
    let stats = manager.stats();
    assert_eq!(stats.bytes_swapped_out, 5120);
    assert_eq!(stats.bytes_swapped_in, 5120);
}

pub fn free_list_drops_only_listed_buffers<E: TransferEngine>(harness: &BackendHarness<E>) {
    let mut manager = counting_manager(harness, SwapConfig::enabled());
    let scratch = harness.patterned(512, 3);
    let weights = harness.patterned(256, 4);
    let plan = SwapPlan::new()
        .time_step("attn", 0)
        .time_step("mlp", 1)
        .free_after_backward("mlp", &scratch);
    manager.initialize(plan);

    traverse(&mut manager, &["attn", "mlp"], true);

    assert_eq!(scratch.size_in_bytes(), 0);
    assert_eq!(harness.read(&weights), pattern(256, 4));
    assert_eq!(manager.engine().calls(), EngineCalls::default());
    assert_eq!(manager.stats().bytes_freed, 512);
}

pub fn disabled_manager_moves_nothing<E: TransferEngine>(harness: &BackendHarness<E>) {
    let mut manager = counting_manager(harness, SwapConfig::disabled());
    let activation = harness.patterned(2048, 5);
    let residual = harness.patterned(64, 6);
    manager.initialize(three_step_plan(&activation, &residual));

    traverse(&mut manager, &STEPS, true);

    assert!(manager.registry().is_empty());
    assert_eq!(manager.max_time_step(), 2);
    assert_eq!(harness.read(&activation), pattern(2048, 5));
    assert_eq!(harness.read(&residual), pattern(64, 6));
    assert_eq!(manager.engine().calls(), EngineCalls::default());
}

pub fn inference_traversal_moves_nothing<E: TransferEngine>(harness: &BackendHarness<E>) {
    let mut manager = counting_manager(harness, SwapConfig::enabled());
    let activation = harness.patterned(2048, 7);
    let residual = harness.patterned(64, 8);
    manager.initialize(three_step_plan(&activation, &residual));

    traverse(&mut manager, &STEPS, false);

    assert_eq!(manager.registry().len(), 2);
    assert_eq!(activation.size_in_bytes(), 2048);
    assert_eq!(residual.size_in_bytes(), 64);
    assert_eq!(manager.engine().calls(), EngineCalls::default());
}

pub fn repeated_traversals_reuse_pinned_regions<E: TransferEngine>(harness: &BackendHarness<E>) {
    let mut manager = counting_manager(harness, SwapConfig::enabled());
    let activation = harness.patterned(1000, 9);
    let residual = harness.patterned(300, 10);
    manager.initialize(three_step_plan(&activation, &residual));

    for _ in 0..3 {
        traverse(&mut manager, &STEPS, true);
    }

    assert_eq!(harness.read(&activation), pattern(1000, 9));
    assert_eq!(harness.read(&residual), pattern(300, 10));
    let calls = manager.engine().calls();
    assert_eq!(calls.pinned_allocs, 2);
    assert_eq!(calls.device_to_host, 6);
    assert_eq!(manager.stats().transfers(), 12);
    assert_eq!(manager.pinned_bytes(), 1300);
}

pub fn reinitialize_releases_pinned_regions<E: TransferEngine>(harness: &BackendHarness<E>) {
    let engine = Arc::new(CountingEngine::new(Arc::clone(&harness.engine)));
    let mut manager: Manager<E> =
        SwapManager::new(Arc::clone(&engine), SwapConfig::enabled()).unwrap();
    let activation = harness.patterned(128, 11);
    let residual = harness.patterned(128, 12);
    manager.initialize(three_step_plan(&activation, &residual));
    traverse(&mut manager, &STEPS, true);
    assert_eq!(engine.calls().pinned_live(), 2);

    manager.initialize(three_step_plan(&residual, &activation));
    assert_eq!(engine.calls().pinned_live(), 0);
    assert_eq!(manager.registry().len(), 2);

    traverse(&mut manager, &STEPS, true);
    assert_eq!(engine.calls().pinned_live(), 2);
    drop(manager);
    assert_eq!(engine.calls().pinned_live(), 0);
    assert_eq!(harness.read(&activation), pattern(128, 11));
}

pub fn estimate_tracks_swapped_bytes<E: TransferEngine>(harness: &BackendHarness<E>) {
    let activation = harness.patterned(1 << 20, 13);
    let residual = harness.patterned(1 << 10, 14);
    let mut manager = counting_manager(harness, SwapConfig::enabled());
    manager.initialize(three_step_plan(&activation, &residual));

    let base = manager.free_memory_base_gb();
    let activation_gb = bytes_to_gb(1 << 20);
    let residual_gb = bytes_to_gb(1 << 10);
    let projection = manager.estimate(0, 0);

    let close = |actual: Option<f64>, expected: f64| {
        let actual = actual.unwrap();
        assert!(
            (actual - expected).abs() < 1e-12,
            "expected {expected}, got {actual}"
        );
    };
    close(projection.at_pass(0, Pass::Forward), base - activation_gb);
    close(
        projection.at_pass(2, Pass::Forward),
        base - activation_gb - residual_gb,
    );
    close(projection.at_pass(1, Pass::Backward), base - residual_gb);
    close(projection.at(0), base - residual_gb);
    assert_eq!(projection.len(), 5);
    assert_eq!(manager.engine().calls(), EngineCalls::default());
}
