//! Declarative kernel graphs.
//!
//! A [`GraphDeclaration`] lists the pins of a graph and the kernels that
//! read and write them. It is the input to [`KernelGraphCompiler`](super::KernelGraphCompiler),
//! which orders and prunes the kernels into a [`CompiledKernelGraph`](super::CompiledKernelGraph).

use crate::error::Result;
use crate::gpu::KernelIo;
use crate::types::{DataKind, ExportMode, PinLabel, TextureFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Role of a pin within the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PinDirection {
    /// Fed from the caller's input collection
    Input,
    /// Produced by the graph and returned to the caller
    Output,
    /// Produced and consumed by kernels only
    Intermediate,
}

/// How many elements a pin needs, resolved when descriptions are primed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinSizing {
    /// Sized from the data the caller supplied on the pin
    FromData,
    /// Constant element count
    Fixed { elements: u32 },
    /// `multiplier` elements for every element on another pin
    FromInput { pin: PinLabel, multiplier: u32 },
    /// Texture extent in texels
    Extent { width: u32, height: u32 },
}

/// Declaration of one graph pin.
#[derive(Debug, Clone)]
pub struct PinSpec {
    pub label: PinLabel,
    pub direction: PinDirection,
    pub kind: DataKind,
    pub sizing: PinSizing,
    pub export_mode: ExportMode,
    /// Kernels writing this pin report how many elements they produced
    pub counted: bool,
    /// Input pins only: the execution is invalid without data on this pin
    pub required: bool,
    /// Attribute names carried by each element
    pub attributes: Vec<String>,
}

impl PinSpec {
    pub fn input_buffer(label: impl Into<String>, stride: u32) -> Self {
        Self {
            label: PinLabel::new(label),
            direction: PinDirection::Input,
            kind: DataKind::Buffer { stride },
            sizing: PinSizing::FromData,
            export_mode: ExportMode::NoExport,
            counted: false,
            required: true,
            attributes: Vec::new(),
        }
    }

    pub fn input_texture(label: impl Into<String>, format: TextureFormat) -> Self {
        Self {
            kind: DataKind::Texture { format },
            ..Self::input_buffer(label, 0)
        }
    }

    pub fn output_buffer(label: impl Into<String>, stride: u32, sizing: PinSizing) -> Self {
        Self {
            label: PinLabel::new(label),
            direction: PinDirection::Output,
            kind: DataKind::Buffer { stride },
            sizing,
            export_mode: ExportMode::NoExport,
            counted: false,
            required: false,
            attributes: Vec::new(),
        }
    }

    pub fn output_texture(
        label: impl Into<String>,
        format: TextureFormat,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            kind: DataKind::Texture { format },
            ..Self::output_buffer(label, 0, PinSizing::Extent { width, height })
        }
    }

    pub fn intermediate_buffer(label: impl Into<String>, stride: u32, sizing: PinSizing) -> Self {
        Self {
            direction: PinDirection::Intermediate,
            ..Self::output_buffer(label, stride, sizing)
        }
    }

    pub fn with_export(mut self, mode: ExportMode) -> Self {
        self.export_mode = mode;
        self
    }

    pub fn counted(mut self) -> Self {
        self.counted = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }
}

/// The body of a compute kernel.
///
/// Kernels run on the render side with exclusive access to the execution's
/// resources for the duration of the call.
pub trait KernelProgram: Send + Sync {
    fn execute(&self, io: &mut KernelIo<'_>) -> Result<()>;
}

impl<F> KernelProgram for F
where
    F: Fn(&mut KernelIo<'_>) -> Result<()> + Send + Sync,
{
    fn execute(&self, io: &mut KernelIo<'_>) -> Result<()> {
        self(io)
    }
}

/// Declaration of one compute kernel.
#[derive(Clone)]
pub struct KernelDecl {
    pub name: String,
    pub reads: Vec<PinLabel>,
    pub writes: Vec<PinLabel>,
    pub program: Arc<dyn KernelProgram>,
    /// Upper bound on the elements this kernel can process per pin
    pub max_elements: Option<u32>,
}

impl KernelDecl {
    pub fn new(name: impl Into<String>, program: impl KernelProgram + 'static) -> Self {
        Self {
            name: name.into(),
            reads: Vec::new(),
            writes: Vec::new(),
            program: Arc::new(program),
            max_elements: None,
        }
    }

    pub fn reads(mut self, pin: impl Into<PinLabel>) -> Self {
        self.reads.push(pin.into());
        self
    }

    pub fn writes(mut self, pin: impl Into<PinLabel>) -> Self {
        self.writes.push(pin.into());
        self
    }

    pub fn max_elements(mut self, max: u32) -> Self {
        self.max_elements = Some(max);
        self
    }
}

impl fmt::Debug for KernelDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelDecl")
            .field("name", &self.name)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .field("max_elements", &self.max_elements)
            .finish()
    }
}

/// Per-graph limits checked before and after descriptions are primed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphSettings {
    pub max_elements_per_pin: u32,
    pub max_texture_extent: u32,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self {
            max_elements_per_pin: 1 << 24,
            max_texture_extent: 8192,
        }
    }
}

/// A kernel graph as authored, before ordering and pruning.
#[derive(Debug, Clone)]
pub struct GraphDeclaration {
    pub name: String,
    pub pins: Vec<PinSpec>,
    pub kernels: Vec<KernelDecl>,
    pub settings: GraphSettings,
}

impl GraphDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pins: Vec::new(),
            kernels: Vec::new(),
            settings: GraphSettings::default(),
        }
    }

    pub fn pin(mut self, pin: PinSpec) -> Self {
        self.pins.push(pin);
        self
    }

    pub fn kernel(mut self, kernel: KernelDecl) -> Self {
        self.kernels.push(kernel);
        self
    }

    pub fn settings(mut self, settings: GraphSettings) -> Self {
        self.settings = settings;
        self
    }
}
