//! Integration tests for failing and cancelled executions
//!
//! These tests validate that every way out of an execution leaves nothing
//! behind:
//! - Cancellation from any phase
//! - Rejected and failed submissions
//! - Budget, compilation and data validation failures

mod common;

use common::builders::{forest_request, seeds, ForestGraphBuilder, TestBackend, GRAPH, GRID};
use common::mock_helpers::{FailingScheduler, RecordingInspectionStore};
use common::{run_to_completion, step_until};
use pcg_dispatch::executor::{ComputeGraphExecutor, ExecutionFailure, ExecutionRequest, Phase, PhaseResult};
use pcg_dispatch::gpu::DeviceBudget;
use pcg_dispatch::graph::{CompileMessage, CompileSeverity};
use pcg_dispatch::id::KernelId;
use pcg_dispatch::pool::GraphInstanceKey;
use pcg_dispatch::PcgError;
use std::sync::Arc;

fn expect_failure(result: PhaseResult) -> ExecutionFailure {
    match result {
        PhaseResult::Failed(failure) => failure,
        other => panic!("expected a failed execution, got {:?}", other),
    }
}

fn key() -> GraphInstanceKey {
    GraphInstanceKey::new(GRAPH, GRID, 0)
}

#[test]
fn test_cancel_from_every_phase_releases_everything() {
    for phase in Phase::ALL {
        let backend = TestBackend::deferred(&ForestGraphBuilder::new().exported().build());
        let services = backend.services();
        let pool = Arc::clone(&services.pool);
        let exported = Arc::clone(&services.exported);
        let request = forest_request().with_inspect(true);
        let mut executor = ComputeGraphExecutor::new(services, request);

        assert!(
            step_until(&mut executor, &backend.render, phase),
            "execution ended before reaching {}",
            phase
        );

        let failure = expect_failure(executor.cancel());
        assert_eq!(failure.phase, phase);
        assert!(matches!(*failure.error, PcgError::Cancelled));
        assert!(!executor.has_pending_async_operations(), "pending work after cancel in {}", phase);

        // Anything still queued must not touch the released instance
        backend.render.pump();
        if phase <= Phase::ScheduleComputeGraph {
            assert_eq!(backend.scheduler.kernels_dispatched(), 0, "kernels ran after cancel in {}", phase);
        }
        // No output was handed out, so no export may outlive the execution
        assert!(exported.lock().unwrap().is_empty(), "export leaked after cancel in {}", phase);

        let pool = pool.lock().unwrap();
        assert_eq!(pool.checked_out(), 0);
        let expected = usize::from(phase > Phase::GetComputeGraph);
        assert_eq!(pool.available(&key()), expected, "instance not returned after cancel in {}", phase);
    }
}

#[test]
fn test_cancel_discards_enqueued_work() {
    let backend = TestBackend::deferred(&ForestGraphBuilder::new().exported().build());
    let services = backend.services();
    let exported = Arc::clone(&services.exported);
    let mut executor = ComputeGraphExecutor::new(services, forest_request());

    assert!(matches!(executor.tick(), PhaseResult::Suspended));
    assert_eq!(executor.phase(), Phase::WaitForExecutionComplete);
    assert_eq!(backend.render.pending(), 1);

    executor.cancel();
    assert_eq!(backend.render.pump(), 1);

    assert_eq!(backend.scheduler.submitted(), 1);
    assert_eq!(backend.scheduler.kernels_dispatched(), 0);
    assert!(exported.lock().unwrap().is_empty());
}

#[test]
fn test_dropping_executor_tears_down() {
    let backend = TestBackend::deferred(&ForestGraphBuilder::new().build());
    let services = backend.services();
    let pool = Arc::clone(&services.pool);

    {
        let mut executor = ComputeGraphExecutor::new(services, forest_request());
        assert!(matches!(executor.tick(), PhaseResult::Suspended));
    }

    backend.render.pump();
    assert_eq!(backend.scheduler.kernels_dispatched(), 0);
    assert_eq!(pool.lock().unwrap().available(&key()), 1);
}

#[test]
fn test_terminal_failure_is_sticky() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    backend.scheduler.set_reject_submissions(true);
    let mut executor = ComputeGraphExecutor::new(backend.services(), forest_request());

    let first = expect_failure(executor.tick());
    let ticks = executor.stats().ticks;
    let again = expect_failure(executor.tick());
    let cancelled = expect_failure(executor.cancel());

    assert_eq!(first.phase, again.phase);
    assert!(Arc::ptr_eq(&first.error, &again.error));
    assert!(Arc::ptr_eq(&first.error, &cancelled.error));
    assert_eq!(executor.stats().ticks, ticks);
}

#[test]
fn test_rejected_submission_fails_schedule_phase() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    backend.scheduler.set_reject_submissions(true);
    let services = backend.services();
    let pool = Arc::clone(&services.pool);
    let mut executor = ComputeGraphExecutor::new(services, forest_request());

    let failure = expect_failure(executor.tick());
    assert_eq!(failure.phase, Phase::ScheduleComputeGraph);
    assert!(matches!(*failure.error, PcgError::SubmissionRejected(ref name) if name == "PCG:forest"));
    assert_eq!(pool.lock().unwrap().available(&key()), 1);
}

#[test]
fn test_submit_failure_on_render_side_fails_wait_phase() {
    let backend = TestBackend::deferred(&ForestGraphBuilder::new().exported().build());
    backend.scheduler.set_fail_on_submit(true);
    let mut executor = ComputeGraphExecutor::new(backend.services(), forest_request());

    assert!(matches!(executor.tick(), PhaseResult::Suspended));
    assert!(executor.has_pending_async_operations());

    let failure = expect_failure(run_to_completion(&mut executor, &backend.render));
    assert_eq!(failure.phase, Phase::WaitForExecutionComplete);
    assert!(matches!(*failure.error, PcgError::SubmissionFailed(_)));
    assert!(executor.graph_submit_failed());
    assert!(!executor.has_pending_async_operations());
    assert_eq!(backend.scheduler.kernels_dispatched(), 0);
}

#[test]
fn test_submit_failure_reported_during_enqueue() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    let mut services = backend.services();
    services.scheduler = Arc::new(FailingScheduler {
        reason: "device removed".to_string(),
    });
    let mut executor = ComputeGraphExecutor::new(services, forest_request());

    // The failure is only observed once the executor drains its messages
    assert!(matches!(executor.tick(), PhaseResult::Suspended));
    let failure = expect_failure(executor.tick());
    assert_eq!(failure.phase, Phase::WaitForExecutionComplete);
    assert!(matches!(*failure.error, PcgError::SubmissionFailed(ref r) if r == "device removed"));
}

#[test]
fn test_over_budget_allocation_fails_prepare() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    let services = backend.services().with_budget(DeviceBudget::new(64, 0.5));
    let pool = Arc::clone(&services.pool);
    // 8 seeds fit in 32 bytes; the 16 scattered points do not
    let request = ExecutionRequest::new(GRAPH, 300.0)
        .with_inputs(seeds(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]));
    let mut executor = ComputeGraphExecutor::new(services, request);

    let failure = expect_failure(executor.tick());
    assert_eq!(failure.phase, Phase::PrepareForExecute);
    match failure.error.root() {
        PcgError::ResourceBudget {
            pin,
            requested,
            budget,
        } => {
            assert_eq!(pin, "Points");
            assert_eq!(*requested, 64);
            assert_eq!(*budget, 32);
        }
        other => panic!("expected a budget failure, got {:?}", other),
    }
    assert_eq!(pool.lock().unwrap().available(&key()), 1);
}

#[test]
fn test_compile_error_fails_validation() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    backend.compiler.push_message(
        &backend.graph,
        CompileMessage::new(Some(KernelId(1)), CompileSeverity::Error, "unresolved symbol 'density'"),
    );
    let mut executor = ComputeGraphExecutor::new(backend.services(), forest_request());

    let failure = expect_failure(executor.tick());
    assert_eq!(failure.phase, Phase::ValidateComputeGraphCompilation);
    assert!(matches!(
        *failure.error,
        PcgError::Compilation { kernel: Some(KernelId(1)), .. }
    ));
    assert_eq!(backend.scheduler.submitted(), 0);
}

#[test]
fn test_informational_failed_message_fails_validation() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    backend.compiler.push_message(
        &backend.graph,
        CompileMessage::new(None, CompileSeverity::Info, "Shader cache lookup failed, recompiling"),
    );
    let mut executor = ComputeGraphExecutor::new(backend.services(), forest_request());

    let failure = expect_failure(executor.tick());
    assert!(matches!(*failure.error, PcgError::Compilation { kernel: None, .. }));
}

#[test]
fn test_warnings_do_not_fail_validation() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    backend.compiler.push_message(
        &backend.graph,
        CompileMessage::new(None, CompileSeverity::Warning, "kernel 'filter' uses a slow path"),
    );
    let mut executor = ComputeGraphExecutor::new(backend.services(), forest_request());

    assert!(executor.tick().is_done());
}

#[test]
fn test_missing_required_input_fails_validation_of_data() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    let mut executor =
        ComputeGraphExecutor::new(backend.services(), ExecutionRequest::new(GRAPH, 300.0));

    let failure = expect_failure(executor.tick());
    assert_eq!(failure.phase, Phase::PrimeDataDescriptionsAndValidateData);
    assert!(matches!(*failure.error, PcgError::InvalidGraphData(ref g) if g == GRAPH));
    assert!(failure.error.is_configuration());
}

#[test]
fn test_unknown_grid_fails_graph_lookup() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    // Only the 400 grid is registered
    let request = forest_request();
    let request = ExecutionRequest {
        generation_extent: 5_000.0,
        ..request
    };
    let mut executor = ComputeGraphExecutor::new(backend.services(), request);

    let failure = expect_failure(executor.tick());
    assert_eq!(failure.phase, Phase::GetComputeGraph);
    assert!(matches!(*failure.error, PcgError::NoCompiledGraph { ref grid, .. } if grid == "6400"));
}

#[test]
fn test_failure_after_export_releases_it() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().exported().build());
    let services = backend
        .services()
        .with_inspection(Arc::new(RecordingInspectionStore::refusing()));
    let exported = Arc::clone(&services.exported);
    let mut executor = ComputeGraphExecutor::new(services, forest_request().with_inspect(true));

    let failure = expect_failure(executor.tick());
    assert_eq!(failure.phase, Phase::DebugAndInspection);
    assert_eq!(backend.scheduler.kernels_dispatched(), 2);
    assert!(exported.lock().unwrap().is_empty());
}

#[test]
fn test_refused_inspection_fails_debug_phase() {
    let backend = TestBackend::inline(&ForestGraphBuilder::new().build());
    let services = backend
        .services()
        .with_inspection(Arc::new(RecordingInspectionStore::refusing()));
    let mut executor = ComputeGraphExecutor::new(services, forest_request().with_inspect(true));

    let failure = expect_failure(executor.tick());
    assert_eq!(failure.phase, Phase::DebugAndInspection);
}
