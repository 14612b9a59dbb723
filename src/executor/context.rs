//! Per-execution state, the services an executor is built from and the
//! request it runs.

use super::phase::Phase;
use super::task::{BackgroundTask, TaskMode};
use crate::binding::{DataBinding, StringTable};
use crate::config::{OrchestratorConfig, SchedulingSettings};
use crate::debug::{DebugPreparation, DebugVisualizer, InspectionStore};
use crate::description::DataCollectionDescription;
use crate::error::{PcgError, Result};
use crate::gpu::{
    lock, ComputeScheduler, DeviceBudget, ExportHandle, ExportedArena, RenderQueue, ResourceArena,
    SharedArena, SharedExportedArena,
};
use crate::graph::{CompiledKernelGraph, GraphCompiler};
use crate::id::ProviderId;
use crate::pool::{checkin_shared, GraphInstancePool, SharedPool};
use crate::readback::{MainThreadMessage, MainThreadQueue, ReadbackChannel, ReadbackKind};
use crate::types::{DataCollection, GridSize, SceneHandle};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::thread::ThreadId;

// ── Services ──

/// Collaborators shared by every executor.
#[derive(Clone)]
pub struct ExecutorServices {
    pub compiler: Arc<dyn GraphCompiler>,
    pub scheduler: Arc<dyn ComputeScheduler>,
    /// Render queue readbacks and texture allocations are issued on
    pub render: RenderQueue,
    pub pool: SharedPool,
    pub exported: SharedExportedArena,
    pub inspection: Option<Arc<dyn InspectionStore>>,
    pub visualizer: Option<Arc<dyn DebugVisualizer>>,
    pub budget: DeviceBudget,
    pub grid_sizes: Vec<u32>,
    pub task_mode: TaskMode,
    pub scheduling: SchedulingSettings,
}

impl ExecutorServices {
    pub fn new(
        compiler: Arc<dyn GraphCompiler>,
        scheduler: Arc<dyn ComputeScheduler>,
        render: RenderQueue,
    ) -> Self {
        Self::from_config(&OrchestratorConfig::default(), compiler, scheduler, render)
    }

    pub fn from_config(
        config: &OrchestratorConfig,
        compiler: Arc<dyn GraphCompiler>,
        scheduler: Arc<dyn ComputeScheduler>,
        render: RenderQueue,
    ) -> Self {
        Self {
            compiler,
            scheduler,
            render,
            pool: GraphInstancePool::shared(),
            exported: ExportedArena::shared(),
            inspection: None,
            visualizer: None,
            budget: config.budget(),
            grid_sizes: config.grid_sizes.clone(),
            task_mode: TaskMode::default(),
            scheduling: config.scheduling.clone(),
        }
    }

    pub fn with_pool(mut self, pool: SharedPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_exported(mut self, exported: SharedExportedArena) -> Self {
        self.exported = exported;
        self
    }

    pub fn with_inspection(mut self, store: Arc<dyn InspectionStore>) -> Self {
        self.inspection = Some(store);
        self
    }

    pub fn with_visualizer(mut self, visualizer: Arc<dyn DebugVisualizer>) -> Self {
        self.visualizer = Some(visualizer);
        self
    }

    pub fn with_budget(mut self, budget: DeviceBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_task_mode(mut self, mode: TaskMode) -> Self {
        self.task_mode = mode;
        self
    }
}

impl fmt::Debug for ExecutorServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorServices")
            .field("render", &self.render)
            .field("budget", &self.budget)
            .field("grid_sizes", &self.grid_sizes)
            .field("task_mode", &self.task_mode)
            .field("scheduling", &self.scheduling)
            .field("inspection", &self.inspection.is_some())
            .field("visualizer", &self.visualizer.is_some())
            .finish()
    }
}

// ── Request ──

/// What to execute.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub top_level: String,
    pub graph_index: u32,
    /// World-space extent of the generation volume; picks the grid size
    pub generation_extent: f64,
    pub inputs: DataCollection,
    pub scene: SceneHandle,
    /// Send the output to the debug visualizer
    pub debug: bool,
    /// Store the output in the inspection store
    pub inspect: bool,
    /// Key the output is stored under when inspected
    pub producer: String,
}

impl ExecutionRequest {
    pub fn new(top_level: impl Into<String>, generation_extent: f64) -> Self {
        let top_level = top_level.into();
        Self {
            producer: top_level.clone(),
            top_level,
            graph_index: 0,
            generation_extent,
            inputs: DataCollection::new(),
            scene: SceneHandle::default(),
            debug: false,
            inspect: false,
        }
    }

    pub fn with_inputs(mut self, inputs: DataCollection) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_graph_index(mut self, graph_index: u32) -> Self {
        self.graph_index = graph_index;
        self
    }

    pub fn with_scene(mut self, scene: SceneHandle) -> Self {
        self.scene = scene;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_inspect(mut self, inspect: bool) -> Self {
        self.inspect = inspect;
        self
    }

    pub fn with_producer(mut self, producer: impl Into<String>) -> Self {
        self.producer = producer.into();
        self
    }

    pub fn wants_debug_phase(&self) -> bool {
        self.debug || self.inspect
    }
}

// ── Statistics ──

/// Counters collected over one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionStats {
    /// Calls to `tick` that did work
    pub ticks: u64,
    /// Ticks that ended suspended
    pub suspensions: u64,
    /// Phases in the order they were entered
    pub phase_history: Vec<Phase>,
    /// How many times each phase ran
    pub phase_ticks: BTreeMap<Phase, u64>,
    pub stale_messages_discarded: u64,
    pub readbacks_issued: u64,
    pub messages_processed: u64,
}

impl ExecutionStats {
    pub(crate) fn record(&mut self, phase: Phase) {
        if self.phase_history.last() != Some(&phase) {
            self.phase_history.push(phase);
        }
        *self.phase_ticks.entry(phase).or_insert(0) += 1;
    }
}

// ── Context ──

/// Everything one execution holds between ticks.
pub struct ExecutionContext {
    pub(crate) phase: Phase,
    pub(crate) grid: Option<GridSize>,
    pub(crate) graph: Option<Arc<CompiledKernelGraph>>,
    pub(crate) binding: Option<DataBinding>,
    pub(crate) arena: SharedArena,
    pub(crate) queue: MainThreadQueue,
    pub(crate) readbacks: ReadbackChannel,
    pub(crate) pool: SharedPool,
    pub(crate) exported: SharedExportedArena,

    pub(crate) strings_task: Option<BackgroundTask<StringTable>>,
    pub(crate) descriptions_task: Option<BackgroundTask<DataCollectionDescription>>,
    pub(crate) descriptions_scheduled: bool,

    pub(crate) pending_exports: BTreeSet<ProviderId>,
    pub(crate) pending_counters: BTreeSet<ProviderId>,
    pub(crate) pending_prepare: Vec<ProviderId>,
    pub(crate) pending_post: Vec<ProviderId>,

    pub(crate) build_requested: bool,
    pub(crate) work_enqueued: bool,
    pub(crate) graph_submit_failed: bool,
    pub(crate) submit_failure: Option<String>,
    pub(crate) async_failure: Option<PcgError>,

    pub(crate) debug: Option<DebugPreparation>,
    pub(crate) output: Option<DataCollection>,
    pub(crate) stats: ExecutionStats,
    /// Set once the output, and the exports it refers to, reached the caller
    output_delivered: bool,
    /// Thread that created the context and drives it
    owner: ThreadId,
    torn_down: bool,
}

impl ExecutionContext {
    pub fn new(services: &ExecutorServices) -> Self {
        let queue = MainThreadQueue::new();
        let readbacks = ReadbackChannel::new(services.render.clone(), queue.sender());
        Self {
            phase: Phase::GetComputeGraph,
            grid: None,
            graph: None,
            binding: None,
            arena: ResourceArena::shared(services.budget),
            queue,
            readbacks,
            pool: Arc::clone(&services.pool),
            exported: Arc::clone(&services.exported),
            strings_task: None,
            descriptions_task: None,
            descriptions_scheduled: false,
            pending_exports: BTreeSet::new(),
            pending_counters: BTreeSet::new(),
            pending_prepare: Vec::new(),
            pending_post: Vec::new(),
            build_requested: false,
            work_enqueued: false,
            graph_submit_failed: false,
            submit_failure: None,
            async_failure: None,
            debug: None,
            output: None,
            stats: ExecutionStats::default(),
            output_delivered: false,
            owner: std::thread::current().id(),
            torn_down: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> &ExecutionStats {
        &self.stats
    }

    pub fn binding(&self) -> Option<&DataBinding> {
        self.binding.as_ref()
    }

    pub fn arena(&self) -> &SharedArena {
        &self.arena
    }

    pub fn graph_submit_failed(&self) -> bool {
        self.graph_submit_failed
    }

    /// Whether any export, counter readback or background task is outstanding
    pub fn has_pending_async_operations(&self) -> bool {
        !self.pending_exports.is_empty()
            || !self.pending_counters.is_empty()
            || self.strings_task.is_some()
            || self.descriptions_task.is_some()
    }

    /// Forget every outstanding async operation.
    ///
    /// Background tasks are joined as they are dropped.
    pub fn reset_async_operations(&mut self) {
        self.pending_exports.clear();
        self.pending_counters.clear();
        self.strings_task = None;
        self.descriptions_task = None;
    }

    /// Apply every queued main-thread message. Returns how many were applied.
    ///
    /// Messages tagged with a generation that no longer matches their
    /// provider are counted and dropped without touching anything.
    pub(crate) fn drain_messages(&mut self) -> Result<usize> {
        let mut applied = 0;

        for message in self.queue.drain() {
            self.stats.messages_processed += 1;

            if let MainThreadMessage::SubmitFailed { reason } = message {
                tracing::warn!("Dispatch submission failed: {}", reason);
                self.graph_submit_failed = true;
                self.submit_failure = Some(reason);
                self.reset_async_operations();
                applied += 1;
                continue;
            }

            let Some((provider, generation)) = message.tag() else {
                continue;
            };
            let live = self
                .binding
                .as_ref()
                .and_then(|b| b.provider(provider))
                .map(|p| p.generation());
            if live != Some(generation) {
                self.stats.stale_messages_discarded += 1;
                if let MainThreadMessage::ExportComplete { handle, .. } = message {
                    self.release_export(handle);
                }
                tracing::trace!(
                    "Discarding stale message for {} ({} vs live {:?})",
                    provider,
                    generation,
                    live
                );
                continue;
            }

            let Some(binding) = self.binding.as_mut() else {
                continue;
            };
            match message {
                MainThreadMessage::ReadbackComplete {
                    kind: ReadbackKind::Debug { slot },
                    bytes,
                    ..
                } => {
                    if let Some(debug) = self.debug.as_mut() {
                        debug.on_readback(slot, bytes);
                    }
                }
                MainThreadMessage::ReadbackComplete {
                    kind,
                    bytes,
                    counter,
                    ..
                } => {
                    binding.apply_readback(provider, kind, bytes, counter);
                    if kind == ReadbackKind::Counter {
                        self.pending_counters.remove(&provider);
                    }
                }
                MainThreadMessage::ExportComplete { handle, .. } => {
                    binding.record_export(provider, handle);
                    self.pending_exports.remove(&provider);
                }
                MainThreadMessage::AsyncFailure { reason, .. } => {
                    self.async_failure = Some(PcgError::AsyncOperation {
                        provider: provider.0,
                        reason,
                    });
                }
                MainThreadMessage::SubmitFailed { .. } => {}
            }
            applied += 1;
        }

        if self.graph_submit_failed {
            let reason = self.submit_failure.clone().unwrap_or_default();
            return Err(PcgError::SubmissionFailed(reason));
        }
        if let Some(error) = self.async_failure.take() {
            return Err(error);
        }
        Ok(applied)
    }

    /// Take the finished output; its exports now belong to the caller.
    pub(crate) fn deliver_output(&mut self) -> DataCollection {
        self.output_delivered = true;
        self.output.take().unwrap_or_default()
    }

    fn release_export(&self, handle: ExportHandle) {
        match lock(&self.exported, "exported arena") {
            Ok(mut exported) => {
                if exported.release(handle) {
                    tracing::debug!("Released undelivered export {}", handle.id);
                }
            }
            Err(e) => tracing::warn!("Could not release export {}: {}", handle.id, e),
        }
    }

    /// Release every resource of the execution and return the instance.
    ///
    /// Exports that never reached the caller are released as well. Runs
    /// once; later calls are no-ops.
    ///
    /// The executor owning this context must be dropped on the thread that
    /// drives it: teardown runs wherever it is triggered and does not hop
    /// threads.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        if !self.is_on_owner_thread() {
            tracing::warn!(
                "Execution torn down on {:?} instead of its owning thread {:?}",
                std::thread::current().id(),
                self.owner
            );
        }

        self.reset_async_operations();

        match lock(&self.arena, "resource arena") {
            Ok(mut arena) => {
                let released = arena.release_all();
                if released > 0 {
                    tracing::debug!("Released {} transient resource(s)", released);
                }
            }
            Err(e) => tracing::warn!("Could not release execution resources: {}", e),
        }

        // Exports posted before the arena was released are still queued
        for message in self.queue.drain() {
            if let MainThreadMessage::ExportComplete { handle, .. } = message {
                self.release_export(handle);
            }
        }
        if !self.output_delivered {
            if let Some(binding) = self.binding.as_ref() {
                for handle in binding.received_exports().values() {
                    self.release_export(*handle);
                }
            }
        }

        if let Some(binding) = self.binding.take() {
            if let Err(e) = checkin_shared(&self.pool, binding.into_instance()) {
                tracing::warn!("Could not return graph instance to the pool: {}", e);
            }
        }
        self.debug = None;
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Thread the context was created on
    pub fn owner_thread(&self) -> ThreadId {
        self.owner
    }

    pub fn is_on_owner_thread(&self) -> bool {
        std::thread::current().id() == self.owner
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("phase", &self.phase)
            .field("grid", &self.grid)
            .field("pending_exports", &self.pending_exports)
            .field("pending_counters", &self.pending_counters)
            .field("pending_prepare", &self.pending_prepare)
            .field("pending_post", &self.pending_post)
            .field("graph_submit_failed", &self.graph_submit_failed)
            .field("torn_down", &self.torn_down)
            .finish()
    }
}
