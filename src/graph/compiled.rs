use super::declaration::{GraphSettings, KernelProgram, PinDirection, PinSpec};
use crate::id::{KernelId, PinId};
use crate::types::{GridSize, PinLabel};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Severity of a compiler message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CompileSeverity {
    Info,
    Warning,
    Error,
}

/// A diagnostic emitted while compiling a graph or its kernels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileMessage {
    pub kernel: Option<KernelId>,
    pub severity: CompileSeverity,
    pub text: String,
}

impl CompileMessage {
    pub fn new(kernel: Option<KernelId>, severity: CompileSeverity, text: impl Into<String>) -> Self {
        Self {
            kernel,
            severity,
            text: text.into(),
        }
    }

    /// Whether this message fails the execution.
    ///
    /// Besides `Error` severity, any message mentioning "failed" counts.
    /// NOTE: the substring match is suspect; an informational message that
    /// happens to contain the word also aborts the execution.
    pub fn is_failure(&self) -> bool {
        self.severity == CompileSeverity::Error || self.text.to_lowercase().contains("failed")
    }
}

impl fmt::Display for CompileMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kernel {
            Some(kernel) => write!(f, "[{:?}] {}: {}", self.severity, kernel, self.text),
            None => write!(f, "[{:?}] {}", self.severity, self.text),
        }
    }
}

/// A kernel after ordering, with pin labels resolved to ids.
#[derive(Clone)]
pub struct CompiledKernel {
    pub id: KernelId,
    pub name: String,
    pub reads: Vec<PinId>,
    pub writes: Vec<PinId>,
    pub program: Arc<dyn KernelProgram>,
    pub max_elements: Option<u32>,
}

impl fmt::Debug for CompiledKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledKernel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish()
    }
}

/// Statistics about a compiled graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileStats {
    /// Kernels in the declaration
    pub declared_kernels: usize,

    /// Kernels kept in the execution order
    pub active_kernels: usize,

    /// Kernels that contribute to no output pin
    pub pruned_kernels: usize,

    /// Compilation time in microseconds
    pub compile_time_us: u64,
}

/// Compiled kernel graph for one grid size and graph index.
/// Kernels are stored in execution order; `KernelId` indexes `kernels`.
#[derive(Debug, Clone)]
pub struct CompiledKernelGraph {
    pub name: String,
    pub grid_size: GridSize,
    pub graph_index: u32,

    /// Pin declarations, indexed by `PinId`
    pub pins: Vec<PinSpec>,

    /// Active kernels in topological order
    pub kernels: Vec<CompiledKernel>,

    pub settings: GraphSettings,
    pub stats: CompileStats,

    /// Names of kernels dropped from the execution order
    pub pruned_kernels: Vec<String>,
}

impl CompiledKernelGraph {
    pub fn pin_id(&self, label: &PinLabel) -> Option<PinId> {
        self.pins
            .iter()
            .position(|p| &p.label == label)
            .map(PinId::from_index)
    }

    pub fn pin(&self, id: PinId) -> Option<&PinSpec> {
        self.pins.get(id.index())
    }

    pub fn kernel(&self, id: KernelId) -> Option<&CompiledKernel> {
        self.kernels.get(id.index())
    }

    /// Pins with the given direction, with their ids
    pub fn pins_with_direction(
        &self,
        direction: PinDirection,
    ) -> impl Iterator<Item = (PinId, &PinSpec)> + '_ {
        self.pins
            .iter()
            .enumerate()
            .filter(move |(_, p)| p.direction == direction)
            .map(|(i, p)| (PinId::from_index(i), p))
    }

    /// Kernels that write `pin`, in execution order
    pub fn writers_of(&self, pin: PinId) -> impl Iterator<Item = &CompiledKernel> + '_ {
        self.kernels.iter().filter(move |k| k.writes.contains(&pin))
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}
