//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use pcg_dispatch::executor::{ComputeGraphExecutor, PhaseResult};
use pcg_dispatch::gpu::RenderQueue;
use std::time::Duration;

/// Upper bound on ticks before a test gives up on an execution
pub const MAX_TICKS: u64 = 2_000;

/// Tick until the execution ends, pumping the render queue between ticks.
pub fn run_to_completion(executor: &mut ComputeGraphExecutor, render: &RenderQueue) -> PhaseResult {
    for _ in 0..MAX_TICKS {
        let result = executor.tick();
        if result.is_terminal() {
            return result;
        }
        if render.pump() == 0 {
            std::thread::sleep(Duration::from_micros(200));
        }
    }
    panic!("execution did not finish within {} ticks", MAX_TICKS);
}

/// Step phase by phase until the executor is about to run `phase`.
///
/// Returns false if the execution ended first.
pub fn step_until(
    executor: &mut ComputeGraphExecutor,
    render: &RenderQueue,
    phase: pcg_dispatch::Phase,
) -> bool {
    for _ in 0..MAX_TICKS {
        if executor.phase() == phase {
            return true;
        }
        if executor.step().is_terminal() {
            return false;
        }
        render.pump();
    }
    false
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f32, b: f32, epsilon: f32) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
