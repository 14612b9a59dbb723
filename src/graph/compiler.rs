//! Kernel graph compilation and the compiler seam used by the executor.
//!
//! [`KernelGraphCompiler`] turns a [`GraphDeclaration`] into a
//! [`CompiledKernelGraph`] using bidirectional reachability analysis: a
//! kernel is kept only if it is fed from graph inputs (or reads nothing)
//! and its results reach at least one output pin. Kept kernels are
//! ordered with Kahn's algorithm.
//!
//! [`StaticGraphCompiler`] holds precompiled graphs and simulates the
//! shader compilation status the executor polls before dispatch.

use super::compiled::{CompileMessage, CompileSeverity, CompileStats, CompiledKernel, CompiledKernelGraph};
use super::declaration::{GraphDeclaration, PinDirection, PinSizing};
use crate::description::{self, DataCollectionDescription};
use crate::error::{PcgError, Result};
use crate::id::{KernelId, PinId};
use crate::types::GridSize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Source of compiled graphs and their compilation status.
pub trait GraphCompiler: Send + Sync {
    /// Look up the compiled graph for a top-level graph, grid and graph index.
    fn compiled_graph(
        &self,
        top_level: &str,
        grid: GridSize,
        graph_index: u32,
    ) -> Option<Arc<CompiledKernelGraph>>;

    fn are_graph_settings_valid(&self, graph: &CompiledKernelGraph) -> bool;

    fn is_graph_data_valid(
        &self,
        graph: &CompiledKernelGraph,
        descriptions: &DataCollectionDescription,
    ) -> bool;

    /// Polled once per tick while kernels are still being compiled.
    fn has_pending_shader_compilation(&self, graph: &CompiledKernelGraph) -> bool;

    fn has_built_resources(&self, graph: &CompiledKernelGraph) -> bool;

    /// Request the static resources of the graph be built.
    fn build_resources(&self, graph: &CompiledKernelGraph);

    fn compile_messages(&self, graph: &CompiledKernelGraph) -> Vec<CompileMessage>;
}

/// Compiles graph declarations into kernel execution orders
pub struct KernelGraphCompiler;

impl KernelGraphCompiler {
    /// Compile a declaration for one grid size and graph index.
    ///
    /// Fails with [`PcgError::Declaration`] when a kernel references an
    /// undeclared pin, writes a graph input, or the kept kernels form a cycle.
    pub fn compile(
        decl: &GraphDeclaration,
        grid_size: GridSize,
        graph_index: u32,
    ) -> Result<CompiledKernelGraph> {
        let start_time = std::time::Instant::now();

        let pin_ids = Self::index_pins(decl)?;
        let (reads, writes) = Self::resolve_kernel_pins(decl, &pin_ids)?;

        let n = decl.kernels.len();
        let (fwd_adj, bwd_adj) = Self::build_adjacency(&reads, &writes, n);

        // Sources read nothing produced by another kernel
        let sources: Vec<usize> = (0..n)
            .filter(|&k| {
                reads[k]
                    .iter()
                    .all(|pin| decl.pins[pin.index()].direction == PinDirection::Input)
            })
            .collect();

        // Sinks write at least one output pin
        let sinks: Vec<usize> = (0..n)
            .filter(|&k| {
                writes[k]
                    .iter()
                    .any(|pin| decl.pins[pin.index()].direction == PinDirection::Output)
            })
            .collect();

        let fwd_reachable = Self::reachability(&sources, &fwd_adj, n);
        let bwd_reachable = Self::reachability(&sinks, &bwd_adj, n);
        let active: Vec<bool> = (0..n).map(|k| fwd_reachable[k] && bwd_reachable[k]).collect();

        let order = Self::topological_sort_active(&fwd_adj, &active);
        let active_count = active.iter().filter(|&&a| a).count();
        if order.len() != active_count {
            return Err(PcgError::Declaration(format!(
                "kernel graph '{}' contains a cycle",
                decl.name
            )));
        }

        let pruned_kernels: Vec<String> = (0..n)
            .filter(|&k| !active[k])
            .map(|k| decl.kernels[k].name.clone())
            .collect();
        for name in &pruned_kernels {
            tracing::warn!(
                "Kernel '{}' in graph '{}' does not contribute to any output and was pruned",
                name,
                decl.name
            );
        }

        let kernels = order
            .iter()
            .enumerate()
            .map(|(position, &k)| {
                let source = &decl.kernels[k];
                CompiledKernel {
                    id: KernelId::from_index(position),
                    name: source.name.clone(),
                    reads: reads[k].clone(),
                    writes: writes[k].clone(),
                    program: Arc::clone(&source.program),
                    max_elements: source.max_elements,
                }
            })
            .collect::<Vec<_>>();

        let stats = CompileStats {
            declared_kernels: n,
            active_kernels: kernels.len(),
            pruned_kernels: pruned_kernels.len(),
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        tracing::debug!(
            "Compiled graph '{}' for grid {}: {} of {} kernels active",
            decl.name,
            grid_size,
            stats.active_kernels,
            stats.declared_kernels
        );

        Ok(CompiledKernelGraph {
            name: decl.name.clone(),
            grid_size,
            graph_index,
            pins: decl.pins.clone(),
            kernels,
            settings: decl.settings.clone(),
            stats,
            pruned_kernels,
        })
    }

    /// Map pin labels to ids, rejecting duplicates and dangling size references
    fn index_pins(decl: &GraphDeclaration) -> Result<HashMap<&str, PinId>> {
        let mut ids = HashMap::with_capacity(decl.pins.len());
        for (idx, pin) in decl.pins.iter().enumerate() {
            if ids.insert(pin.label.as_str(), PinId::from_index(idx)).is_some() {
                return Err(PcgError::Declaration(format!(
                    "pin '{}' declared twice in graph '{}'",
                    pin.label, decl.name
                )));
            }
        }

        for pin in &decl.pins {
            if let PinSizing::FromInput { pin: source, .. } = &pin.sizing {
                if !ids.contains_key(source.as_str()) {
                    return Err(PcgError::Declaration(format!(
                        "pin '{}' is sized from undeclared pin '{}'",
                        pin.label, source
                    )));
                }
            }
        }

        Ok(ids)
    }

    #[allow(clippy::type_complexity)]
    fn resolve_kernel_pins(
        decl: &GraphDeclaration,
        pin_ids: &HashMap<&str, PinId>,
    ) -> Result<(Vec<Vec<PinId>>, Vec<Vec<PinId>>)> {
        let lookup = |kernel: &str, label: &str| {
            pin_ids.get(label).copied().ok_or_else(|| {
                PcgError::Declaration(format!(
                    "kernel '{}' references undeclared pin '{}'",
                    kernel, label
                ))
            })
        };

        let mut reads = Vec::with_capacity(decl.kernels.len());
        let mut writes = Vec::with_capacity(decl.kernels.len());
        for kernel in &decl.kernels {
            let kernel_reads = kernel
                .reads
                .iter()
                .map(|label| lookup(&kernel.name, label.as_str()))
                .collect::<Result<Vec<_>>>()?;
            let kernel_writes = kernel
                .writes
                .iter()
                .map(|label| lookup(&kernel.name, label.as_str()))
                .collect::<Result<Vec<_>>>()?;

            if let Some(input) = kernel_writes
                .iter()
                .find(|pin| decl.pins[pin.index()].direction == PinDirection::Input)
            {
                return Err(PcgError::Declaration(format!(
                    "kernel '{}' writes graph input '{}'",
                    kernel.name,
                    decl.pins[input.index()].label
                )));
            }

            reads.push(kernel_reads);
            writes.push(kernel_writes);
        }

        Ok((reads, writes))
    }

    /// Build forward and backward adjacency lists between kernels.
    /// An edge runs from every writer of a pin to every reader of it.
    fn build_adjacency(
        reads: &[Vec<PinId>],
        writes: &[Vec<PinId>],
        n: usize,
    ) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
        let mut fwd_adj = vec![Vec::new(); n];
        let mut bwd_adj = vec![Vec::new(); n];

        for from in 0..n {
            for to in 0..n {
                if from == to {
                    continue;
                }
                let feeds = writes[from].iter().any(|pin| reads[to].contains(pin));
                if feeds {
                    fwd_adj[from].push(to);
                    bwd_adj[to].push(from);
                }
            }
        }

        (fwd_adj, bwd_adj)
    }

    /// DFS from `roots` along `adj`
    fn reachability(roots: &[usize], adj: &[Vec<usize>], n: usize) -> Vec<bool> {
        let mut reachable = vec![false; n];
        let mut stack = Vec::new();

        for &root in roots {
            reachable[root] = true;
            stack.push(root);
        }

        while let Some(node) = stack.pop() {
            for &neighbor in &adj[node] {
                if !reachable[neighbor] {
                    reachable[neighbor] = true;
                    stack.push(neighbor);
                }
            }
        }

        reachable
    }

    /// Topological sort of active kernels using Kahn's algorithm.
    /// Ties keep declaration order.
    fn topological_sort_active(fwd_adj: &[Vec<usize>], active: &[bool]) -> Vec<usize> {
        let n = active.len();
        let mut in_degree = vec![0usize; n];

        for from in (0..n).filter(|&k| active[k]) {
            for &to in &fwd_adj[from] {
                if active[to] {
                    in_degree[to] += 1;
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&k| active[k] && in_degree[k] == 0).collect();
        let mut result = Vec::new();

        while let Some(node) = queue.pop_front() {
            result.push(node);
            for &neighbor in &fwd_adj[node] {
                if !active[neighbor] {
                    continue;
                }
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    queue.push_back(neighbor);
                }
            }
        }

        result
    }
}

// ── Static compiler ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GraphKey {
    top_level: String,
    grid: GridSize,
    graph_index: u32,
}

impl GraphKey {
    fn of(graph: &CompiledKernelGraph) -> Self {
        Self {
            top_level: graph.name.clone(),
            grid: graph.grid_size,
            graph_index: graph.graph_index,
        }
    }
}

/// Simulated shader compilation status of one compiled graph
#[derive(Debug, Default)]
struct CompileStatus {
    pending_polls: AtomicU32,
    built: AtomicBool,
    build_requests: AtomicU32,
    messages: Mutex<Vec<CompileMessage>>,
}

struct Entry {
    graph: Arc<CompiledKernelGraph>,
    status: Arc<CompileStatus>,
}

/// In-memory [`GraphCompiler`] over graphs registered up front.
#[derive(Default)]
pub struct StaticGraphCompiler {
    graphs: RwLock<HashMap<GraphKey, Entry>>,
}

impl StaticGraphCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register a declaration for one grid size.
    pub fn register(
        &self,
        decl: &GraphDeclaration,
        grid: GridSize,
        graph_index: u32,
    ) -> Result<Arc<CompiledKernelGraph>> {
        let graph = Arc::new(KernelGraphCompiler::compile(decl, grid, graph_index)?);

        let status = CompileStatus {
            built: AtomicBool::new(true),
            ..Default::default()
        };
        {
            let mut messages = status.messages.lock().map_err(|_| PcgError::LockPoisoned {
                what: "compile messages",
            })?;
            messages.extend(graph.pruned_kernels.iter().map(|name| {
                CompileMessage::new(
                    None,
                    CompileSeverity::Warning,
                    format!("kernel '{}' pruned: no path to an output pin", name),
                )
            }));
        }

        let mut graphs = self
            .graphs
            .write()
            .map_err(|_| PcgError::LockPoisoned { what: "graph registry" })?;
        graphs.insert(
            GraphKey::of(&graph),
            Entry {
                graph: Arc::clone(&graph),
                status: Arc::new(status),
            },
        );

        Ok(graph)
    }

    /// Register a declaration for several grid sizes at once.
    pub fn register_for_grids(
        &self,
        decl: &GraphDeclaration,
        grids: impl IntoIterator<Item = GridSize>,
        graph_index: u32,
    ) -> Result<()> {
        for grid in grids {
            self.register(decl, grid, graph_index)?;
        }
        Ok(())
    }

    /// Keep reporting pending shader compilation for the next `polls` queries.
    pub fn set_pending_shader_polls(&self, graph: &CompiledKernelGraph, polls: u32) {
        if let Some(status) = self.status(graph) {
            status.pending_polls.store(polls, Ordering::SeqCst);
        }
    }

    pub fn set_resources_built(&self, graph: &CompiledKernelGraph, built: bool) {
        if let Some(status) = self.status(graph) {
            status.built.store(built, Ordering::SeqCst);
        }
    }

    pub fn push_message(&self, graph: &CompiledKernelGraph, message: CompileMessage) {
        if let Some(status) = self.status(graph) {
            if let Ok(mut messages) = status.messages.lock() {
                messages.push(message);
            }
        }
    }

    /// Number of times `build_resources` was called for `graph`
    pub fn build_requests(&self, graph: &CompiledKernelGraph) -> u32 {
        self.status(graph)
            .map(|s| s.build_requests.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn status(&self, graph: &CompiledKernelGraph) -> Option<Arc<CompileStatus>> {
        let graphs = self.graphs.read().ok()?;
        graphs.get(&GraphKey::of(graph)).map(|e| Arc::clone(&e.status))
    }
}

impl GraphCompiler for StaticGraphCompiler {
    fn compiled_graph(
        &self,
        top_level: &str,
        grid: GridSize,
        graph_index: u32,
    ) -> Option<Arc<CompiledKernelGraph>> {
        let graphs = self.graphs.read().ok()?;
        let key = GraphKey {
            top_level: top_level.to_string(),
            grid,
            graph_index,
        };
        graphs.get(&key).map(|e| Arc::clone(&e.graph))
    }

    fn are_graph_settings_valid(&self, graph: &CompiledKernelGraph) -> bool {
        let settings = &graph.settings;
        if settings.max_elements_per_pin == 0 || settings.max_texture_extent == 0 {
            return false;
        }

        let mut labels = HashSet::new();
        graph.pins.iter().all(|pin| {
            let within_limits = match pin.sizing {
                PinSizing::Fixed { elements } => elements <= settings.max_elements_per_pin,
                PinSizing::Extent { width, height } => {
                    width <= settings.max_texture_extent && height <= settings.max_texture_extent
                }
                PinSizing::FromInput { multiplier, .. } => multiplier > 0,
                PinSizing::FromData => pin.direction == PinDirection::Input,
            };
            within_limits && labels.insert(pin.label.as_str())
        })
    }

    fn is_graph_data_valid(
        &self,
        graph: &CompiledKernelGraph,
        descriptions: &DataCollectionDescription,
    ) -> bool {
        match description::validate_against(graph, descriptions) {
            Ok(()) => true,
            Err(reason) => {
                tracing::warn!("Graph data for '{}' rejected: {}", graph.name, reason);
                false
            }
        }
    }

    fn has_pending_shader_compilation(&self, graph: &CompiledKernelGraph) -> bool {
        let Some(status) = self.status(graph) else {
            return false;
        };
        status
            .pending_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| p.checked_sub(1))
            .is_ok()
    }

    fn has_built_resources(&self, graph: &CompiledKernelGraph) -> bool {
        self.status(graph)
            .map(|s| s.built.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn build_resources(&self, graph: &CompiledKernelGraph) {
        if let Some(status) = self.status(graph) {
            status.build_requests.fetch_add(1, Ordering::SeqCst);
            status.built.store(true, Ordering::SeqCst);
            tracing::debug!("Built static resources for graph '{}'", graph.name);
        }
    }

    fn compile_messages(&self, graph: &CompiledKernelGraph) -> Vec<CompileMessage> {
        self.status(graph)
            .and_then(|s| s.messages.lock().ok().map(|m| m.clone()))
            .unwrap_or_default()
    }
}
