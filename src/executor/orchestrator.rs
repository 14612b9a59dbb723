use super::context::{ExecutionContext, ExecutionRequest, ExecutionStats, ExecutorServices};
use super::phase::{ExecutionFailure, Phase, PhaseResult};
use super::task::BackgroundTask;
use crate::binding::StringTable;
use crate::debug::{DebugPreparation, InspectionSnapshot};
use crate::description::compute_descriptions;
use crate::error::{PcgError, Result, ResultExt};
use crate::gpu::{lock, SubmitFailureCallback};
use crate::graph::{CompileMessage, CompiledKernelGraph};
use crate::pool::GraphInstanceKey;
use crate::provider::ProviderContext;
use crate::readback::MainThreadMessage;
use crate::types::{DataCollection, GridSize};
use std::sync::Arc;

/// What a phase handler asks the executor to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Fall through to the next phase within the same tick
    Next(Phase),
    /// Stay in the current phase until the next tick
    Suspend,
    /// Move to a phase but wait for the next tick before running it
    Yield(Phase),
    /// The execution succeeded
    Finish,
}

/// Drives one execution of a compute graph through its phases.
///
/// Call [`tick`](Self::tick) once per engine tick until it returns a
/// terminal [`PhaseResult`]. Terminal results are sticky: ticking again
/// returns the same result without doing any work. Resources are torn down
/// as soon as the execution finishes, fails or is cancelled, and at the
/// latest when the executor is dropped.
///
/// Teardown runs on whichever thread triggers it, so an executor that has
/// not finished must be cancelled or dropped on the thread that ticks it.
#[derive(Debug)]
pub struct ComputeGraphExecutor {
    services: ExecutorServices,
    request: ExecutionRequest,
    ctx: ExecutionContext,
    outcome: Option<PhaseResult>,
}

impl ComputeGraphExecutor {
    pub fn new(services: ExecutorServices, request: ExecutionRequest) -> Self {
        let ctx = ExecutionContext::new(&services);
        Self {
            services,
            request,
            ctx,
            outcome: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.ctx.phase
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.ctx.stats
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn request(&self) -> &ExecutionRequest {
        &self.request
    }

    /// The terminal result, once there is one
    pub fn outcome(&self) -> Option<&PhaseResult> {
        self.outcome.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn has_pending_async_operations(&self) -> bool {
        self.ctx.has_pending_async_operations()
    }

    pub fn graph_submit_failed(&self) -> bool {
        self.ctx.graph_submit_failed()
    }

    /// Run phases until one suspends or the execution ends.
    pub fn tick(&mut self) -> PhaseResult {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }

        self.ctx.stats.ticks += 1;
        let result = loop {
            if let Some(result) = self.advance() {
                break result;
            }
        };
        self.ctx.stats.readbacks_issued = self.ctx.readbacks.issued();
        result
    }

    /// Run a single phase step.
    ///
    /// Returns [`PhaseResult::Suspended`] whenever the execution has not
    /// ended, including when the step moved on to the next phase.
    pub fn step(&mut self) -> PhaseResult {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let result = self.advance().unwrap_or(PhaseResult::Suspended);
        self.ctx.stats.readbacks_issued = self.ctx.readbacks.issued();
        result
    }

    /// Abort the execution and release everything it holds.
    pub fn cancel(&mut self) -> PhaseResult {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        tracing::info!("Execution of '{}' cancelled in {}", self.request.top_level, self.ctx.phase);
        self.fail(PcgError::Cancelled)
    }

    /// Run one phase handler. `None` means fall through to the next phase.
    fn advance(&mut self) -> Option<PhaseResult> {
        let phase = self.ctx.phase;
        self.ctx.stats.record(phase);

        let flow = match phase {
            Phase::GetComputeGraph => self.get_compute_graph(),
            Phase::InitializeDataBindingAndComputeGraph => self.initialize_data_binding(),
            Phase::PreExecuteReadbacks => self.pre_execute_readbacks(),
            Phase::PrimeDataDescriptionsAndValidateData => self.prime_data_descriptions(),
            Phase::PrepareForExecute => self.prepare_for_execute(),
            Phase::ValidateComputeGraphCompilation => self.validate_compilation(),
            Phase::ScheduleComputeGraph => self.schedule_compute_graph(),
            Phase::WaitForExecutionComplete => self.wait_for_execution_complete(),
            Phase::PostExecute => self.post_execute(),
            Phase::DebugAndInspection => self.debug_and_inspection(),
        };

        match flow {
            Ok(Flow::Next(next)) => {
                tracing::debug!("{} -> {}", phase, next);
                self.ctx.phase = next;
                None
            }
            Ok(Flow::Suspend) => {
                self.ctx.stats.suspensions += 1;
                Some(PhaseResult::Suspended)
            }
            Ok(Flow::Yield(next)) => {
                tracing::debug!("{} -> {} (next tick)", phase, next);
                self.ctx.phase = next;
                self.ctx.stats.suspensions += 1;
                Some(PhaseResult::Suspended)
            }
            Ok(Flow::Finish) => Some(self.finish()),
            Err(error) => Some(self.fail(error)),
        }
    }

    fn finish(&mut self) -> PhaseResult {
        let output = self.ctx.deliver_output();
        tracing::info!(
            "Execution of '{}' finished after {} tick(s) with {} output item(s)",
            self.request.top_level,
            self.ctx.stats.ticks,
            output.len()
        );
        self.ctx.teardown();
        let result = PhaseResult::Done(output);
        self.outcome = Some(result.clone());
        result
    }

    fn fail(&mut self, error: PcgError) -> PhaseResult {
        let phase = self.ctx.phase;
        if !matches!(error, PcgError::Cancelled) {
            tracing::info!("Execution of '{}' failed in {}: {}", self.request.top_level, phase, error);
        }
        self.ctx.teardown();
        let result = PhaseResult::Failed(ExecutionFailure {
            phase,
            error: Arc::new(error),
        });
        self.outcome = Some(result.clone());
        result
    }

    fn graph(&self) -> Result<Arc<CompiledKernelGraph>> {
        self.ctx
            .graph
            .clone()
            .ok_or_else(|| PcgError::Arena("no compiled graph selected".to_string()))
    }

    // ── Phases ──

    fn get_compute_graph(&mut self) -> Result<Flow> {
        let request = &self.request;
        let grid = GridSize::for_extent(request.generation_extent, &self.services.grid_sizes);

        let graph = self
            .services
            .compiler
            .compiled_graph(&request.top_level, grid, request.graph_index)
            .ok_or_else(|| PcgError::NoCompiledGraph {
                graph: request.top_level.clone(),
                grid: grid.to_string(),
                graph_index: request.graph_index,
            })?;

        if !self.services.compiler.are_graph_settings_valid(&graph) {
            return Err(PcgError::InvalidGraphSettings(graph.name.clone()));
        }

        tracing::debug!(
            "Selected graph '{}' for grid {} ({} kernel(s))",
            graph.name,
            grid,
            graph.kernels.len()
        );
        self.ctx.grid = Some(grid);
        self.ctx.graph = Some(graph);
        Ok(Flow::Next(Phase::InitializeDataBindingAndComputeGraph))
    }

    fn initialize_data_binding(&mut self) -> Result<Flow> {
        let graph = self.graph()?;
        let grid = self.ctx.grid.unwrap_or(GridSize::Unbounded);

        let strings_graph = Arc::clone(&graph);
        let strings_inputs = self.request.inputs.clone();
        self.ctx.strings_task = Some(BackgroundTask::spawn(
            "string-table",
            self.services.task_mode,
            move || Ok(StringTable::build(&strings_graph, &strings_inputs)),
        ));

        let key = GraphInstanceKey::new(self.request.top_level.clone(), grid, self.request.graph_index);
        let instance = lock(&self.services.pool, "graph instance pool")?.checkout(key, &graph);
        let binding = crate::binding::DataBinding::new(instance, std::mem::take(&mut self.request.inputs));

        for provider in binding.providers() {
            if provider.is_export_required() {
                self.ctx.pending_exports.insert(provider.id());
            }
            if provider.has_counter() {
                self.ctx.pending_counters.insert(provider.id());
            }
        }
        self.ctx.binding = Some(binding);

        let strings = match self.ctx.strings_task.take() {
            Some(task) => task.join()?,
            None => StringTable::build(&graph, &DataCollection::new()),
        };
        if let Some(binding) = self.ctx.binding.as_mut() {
            binding.set_strings(Arc::new(strings));
        }

        Ok(Flow::Next(Phase::PreExecuteReadbacks))
    }

    fn pre_execute_readbacks(&mut self) -> Result<Flow> {
        loop {
            let ctx = &mut self.ctx;
            let cx = ProviderContext::new(&ctx.arena, &self.services.exported, &ctx.readbacks);
            let binding = ctx.binding.as_mut().ok_or_else(missing_binding)?;
            if binding.poll_pre_execute_readbacks(cx)? {
                return Ok(Flow::Next(Phase::PrimeDataDescriptionsAndValidateData));
            }
            if ctx.drain_messages()? == 0 {
                return Ok(Flow::Suspend);
            }
        }
    }

    fn prime_data_descriptions(&mut self) -> Result<Flow> {
        if !self.ctx.descriptions_scheduled {
            self.ctx.descriptions_scheduled = true;

            let binding = self.ctx.binding.as_ref().ok_or_else(missing_binding)?;
            let graph = Arc::clone(binding.graph());
            let inputs = binding.resolved_inputs();
            let strings = binding.strings().cloned().unwrap_or_default();
            let compiler = Arc::clone(&self.services.compiler);

            self.ctx.descriptions_task = Some(BackgroundTask::spawn(
                "descriptions",
                self.services.task_mode,
                move || {
                    let descriptions = compute_descriptions(&graph, &inputs, &strings)?;
                    if !compiler.is_graph_data_valid(&graph, &descriptions) {
                        return Err(PcgError::InvalidGraphData(graph.name.clone()));
                    }
                    Ok(descriptions)
                },
            ));
        }

        let Some(task) = self.ctx.descriptions_task.as_mut() else {
            return Err(PcgError::TaskPanicked("descriptions".to_string()));
        };
        let Some(result) = task.poll() else {
            return Ok(Flow::Suspend);
        };
        self.ctx.descriptions_task = None;

        let descriptions = result?;
        tracing::debug!(
            "Primed descriptions for {} pin(s), {} byte(s) total",
            descriptions.pins.len(),
            descriptions.total_bytes()
        );
        let binding = self.ctx.binding.as_mut().ok_or_else(missing_binding)?;
        binding.set_descriptions(descriptions);
        self.ctx.pending_prepare = binding.provider_ids();
        Ok(Flow::Next(Phase::PrepareForExecute))
    }

    fn prepare_for_execute(&mut self) -> Result<Flow> {
        let ctx = &mut self.ctx;
        let cx = ProviderContext::new(&ctx.arena, &self.services.exported, &ctx.readbacks);
        let binding = ctx.binding.as_mut().ok_or_else(missing_binding)?;
        if binding.poll_prepare(cx, &mut ctx.pending_prepare)? {
            Ok(Flow::Next(Phase::ValidateComputeGraphCompilation))
        } else {
            Ok(Flow::Suspend)
        }
    }

    fn validate_compilation(&mut self) -> Result<Flow> {
        let graph = self.graph()?;
        let compiler = &self.services.compiler;

        if compiler.has_pending_shader_compilation(&graph) {
            return Ok(Flow::Suspend);
        }
        if !compiler.has_built_resources(&graph) {
            if !self.ctx.build_requested {
                self.ctx.build_requested = true;
                tracing::debug!("Requesting resource build for '{}'", graph.name);
                compiler.build_resources(&graph);
            }
            return Ok(Flow::Suspend);
        }

        let messages = compiler.compile_messages(&graph);
        if let Some(message) = messages.iter().find(|m| m.is_failure()) {
            return Err(PcgError::Compilation {
                kernel: message.kernel,
                message: message.text.clone(),
            });
        }
        if !messages.is_empty() {
            tracing::info!(
                "Graph '{}' compiled with {} message(s)",
                graph.name,
                messages.len()
            );
            for message in messages.iter().map(CompileMessage::to_string) {
                tracing::debug!("  {}", message);
            }
        }

        Ok(Flow::Next(Phase::ScheduleComputeGraph))
    }

    fn schedule_compute_graph(&mut self) -> Result<Flow> {
        let graph = self.graph()?;
        let name = self.services.scheduling.debug_name(&graph.name);

        let work = {
            let ctx = &self.ctx;
            let cx = ProviderContext::new(&ctx.arena, &self.services.exported, &ctx.readbacks);
            let binding = ctx.binding.as_ref().ok_or_else(missing_binding)?;
            binding.build_compute_work(cx, &name)?
        };

        let sender = self.ctx.queue.sender();
        let on_submit_failure: SubmitFailureCallback = Box::new(move |reason| {
            sender.send(MainThreadMessage::SubmitFailed { reason });
        });

        let scheduler = &self.services.scheduler;
        let accepted = scheduler.enqueue_work(
            work,
            self.request.scene,
            self.services.scheduling.execution_group,
            &name,
            on_submit_failure,
        );
        if !accepted {
            return Err(PcgError::SubmissionRejected(name));
        }
        self.ctx.work_enqueued = true;

        if scheduler.executes_inline() {
            Ok(Flow::Next(Phase::WaitForExecutionComplete))
        } else {
            Ok(Flow::Yield(Phase::WaitForExecutionComplete))
        }
    }

    fn wait_for_execution_complete(&mut self) -> Result<Flow> {
        loop {
            let applied = self.ctx.drain_messages()?;

            if self.ctx.pending_exports.is_empty() && self.ctx.pending_counters.is_empty() {
                let binding = self.ctx.binding.as_mut().ok_or_else(missing_binding)?;
                binding.roll_up_counted();
                self.ctx.pending_post = binding.provider_ids();
                return Ok(Flow::Next(Phase::PostExecute));
            }
            if applied == 0 {
                return Ok(Flow::Suspend);
            }
        }
    }

    fn post_execute(&mut self) -> Result<Flow> {
        loop {
            let ctx = &mut self.ctx;
            let cx = ProviderContext::new(&ctx.arena, &self.services.exported, &ctx.readbacks);
            let binding = ctx.binding.as_mut().ok_or_else(missing_binding)?;

            if binding.poll_post_execute(cx, &mut ctx.pending_post)? {
                // Submission failures posted after the dispatch ran must win
                ctx.drain_messages()?;
                let binding = ctx.binding.as_mut().ok_or_else(missing_binding)?;
                ctx.output = Some(binding.collect_outputs()?.clone());
                return Ok(if self.request.wants_debug_phase() {
                    Flow::Next(Phase::DebugAndInspection)
                } else {
                    Flow::Finish
                });
            }
            if ctx.drain_messages()? == 0 {
                return Ok(Flow::Suspend);
            }
        }
    }

    fn debug_and_inspection(&mut self) -> Result<Flow> {
        let ctx = &mut self.ctx;
        if ctx.debug.is_none() {
            let output = ctx.output.clone().unwrap_or_default();
            ctx.debug = Some(DebugPreparation::new(output));
        }

        loop {
            let binding = ctx.binding.as_ref().ok_or_else(missing_binding)?;
            let Some(debug) = ctx.debug.as_mut() else {
                return Err(PcgError::Arena("debug preparation missing".to_string()));
            };
            if debug.poll(binding, &ctx.readbacks, &self.services.exported) {
                break;
            }
            if ctx.drain_messages()? == 0 {
                return Ok(Flow::Suspend);
            }
        }

        let collection = ctx
            .debug
            .take()
            .map(DebugPreparation::into_collection)
            .unwrap_or_default();
        let request = &self.request;

        if request.debug {
            if let Some(visualizer) = &self.services.visualizer {
                visualizer.visualize(&request.producer, &collection);
            }
        }
        if request.inspect {
            if let Some(store) = &self.services.inspection {
                let graph = ctx.graph.as_ref().map(|g| g.name.clone()).unwrap_or_default();
                let grid = ctx.grid.unwrap_or(GridSize::Unbounded);
                store
                    .store(InspectionSnapshot::new(&request.producer, graph, grid, collection))
                    .with_context(|| format!("Failed to inspect output of '{}'", request.producer))?;
            }
        }

        Ok(Flow::Finish)
    }
}

fn missing_binding() -> PcgError {
    PcgError::Arena("data binding not initialized".to_string())
}
