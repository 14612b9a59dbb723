//! Core data types for pcg-dispatch
//!
//! This module contains the data structures shared by the orchestrator,
//! the providers and the simulated render backend.
//!
//! # Main Types
//!
//! - [`GridSize`] - Grid variant selected from the generation extent
//! - [`DataKind`] - Shape of the data flowing through a pin (buffer or texture)
//! - [`PcgData`] - A single piece of data, CPU-resident or exported GPU-resident
//! - [`DataCollection`] - Pin-tagged data handed into and out of an execution
//!
//! # Element Layout
//!
//! Buffers are flat arrays of fixed-stride elements. The orchestrator only
//! reasons about element counts and strides; the byte layout inside an
//! element belongs to the kernels.

use crate::gpu::ExportHandle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Grid variant a compiled graph was built for.
///
/// Larger grids cover more world space per execution. `Unbounded` is used
/// when no configured grid covers the requested extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GridSize {
    /// Grid cell edge length in world units
    Cells(u32),
    /// No partitioning
    Unbounded,
}

impl GridSize {
    /// Pick the smallest configured grid that covers `extent`.
    ///
    /// Non-finite extents, and extents larger than every configured grid,
    /// resolve to [`GridSize::Unbounded`].
    pub fn for_extent(extent: f64, grid_sizes: &[u32]) -> GridSize {
        if !extent.is_finite() {
            return GridSize::Unbounded;
        }

        grid_sizes
            .iter()
            .copied()
            .filter(|&size| size > 0 && f64::from(size) >= extent)
            .min()
            .map(GridSize::Cells)
            .unwrap_or(GridSize::Unbounded)
    }
}

impl fmt::Display for GridSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GridSize::Cells(size) => write!(f, "{}", size),
            GridSize::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// Execution group a dispatch is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExecutionGroup {
    /// Submitted with the next render command flush
    #[default]
    Immediate,
    /// Deferred until the end of the render frame
    EndOfFrame,
}

/// Opaque handle to the scene the dispatch renders into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SceneHandle(pub u64);

/// How the result on an output pin leaves the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExportMode {
    /// Data is read back to the CPU after the dispatch
    #[default]
    NoExport,
    /// The GPU resource is moved out of the execution and handed to the caller
    ComputeGraphOutput,
}

/// Texel format of texture pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R8,
    Rgba8,
    R32F,
}

impl TextureFormat {
    /// Size of one texel in bytes
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::R8 => 1,
            TextureFormat::Rgba8 | TextureFormat::R32F => 4,
        }
    }

    /// Bytes of a `width` x `height` texture in this format
    pub fn size_bytes(self, width: u32, height: u32) -> u64 {
        u64::from(width) * u64::from(height) * u64::from(self.bytes_per_texel())
    }
}

/// Shape of the data flowing through a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataKind {
    /// Packed attribute buffer with a fixed element stride in bytes
    Buffer { stride: u32 },
    /// 2D texture
    Texture { format: TextureFormat },
}

impl DataKind {
    /// Bytes occupied by a single element (texel for textures)
    pub fn element_size(self) -> u32 {
        match self {
            DataKind::Buffer { stride } => stride,
            DataKind::Texture { format } => format.bytes_per_texel(),
        }
    }
}

/// Label identifying a pin on the kernel graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinLabel(pub String);

impl PinLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PinLabel {
    fn from(label: &str) -> Self {
        Self(label.to_string())
    }
}

impl fmt::Display for PinLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// CPU-resident packed attribute buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferData {
    pub element_count: u32,
    pub stride: u32,
    /// Attribute names carried by each element, in layout order
    pub attributes: Vec<String>,
    pub bytes: Vec<u8>,
}

impl BufferData {
    /// Build a buffer from raw bytes, deriving the element count from the stride.
    pub fn from_bytes(stride: u32, attributes: Vec<String>, bytes: Vec<u8>) -> Self {
        let element_count = if stride == 0 {
            0
        } else {
            (bytes.len() / stride as usize) as u32
        };
        Self {
            element_count,
            stride,
            attributes,
            bytes,
        }
    }

    /// Build a buffer of `f32` elements, `components` floats per element.
    pub fn from_f32s(components: u32, attributes: Vec<String>, values: &[f32]) -> Self {
        let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::from_bytes(components * 4, attributes, bytes)
    }

    /// Decode the buffer as little-endian `f32` values.
    pub fn to_f32s(&self) -> Vec<f32> {
        self.bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// Keep only the first `count` elements.
    pub fn truncate_elements(&mut self, count: u32) {
        let count = count.min(self.element_count);
        self.bytes.truncate(count as usize * self.stride as usize);
        self.element_count = count;
    }
}

/// CPU-resident texture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub pixels: Vec<u8>,
}

/// Data that still lives on the GPU, exported by an earlier execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuResidentData {
    pub handle: ExportHandle,
    pub kind: DataKind,
    pub element_count: u32,
    /// Texture extent, when `kind` is a texture
    pub extent: Option<(u32, u32)>,
    pub attributes: Vec<String>,
}

impl GpuResidentData {
    /// Turn read-back bytes into the equivalent CPU data.
    pub fn to_cpu(&self, bytes: Vec<u8>) -> PcgData {
        match self.kind {
            DataKind::Buffer { stride } => {
                PcgData::Buffer(BufferData::from_bytes(stride, self.attributes.clone(), bytes))
            }
            DataKind::Texture { format } => {
                let (width, height) = self.extent.unwrap_or((0, 0));
                PcgData::Texture(TextureData {
                    width,
                    height,
                    format,
                    pixels: bytes,
                })
            }
        }
    }
}

/// One piece of data flowing in or out of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PcgData {
    Buffer(BufferData),
    Texture(TextureData),
    GpuResident(GpuResidentData),
}

impl PcgData {
    /// Number of elements (texels for textures)
    pub fn element_count(&self) -> u32 {
        match self {
            PcgData::Buffer(b) => b.element_count,
            PcgData::Texture(t) => t.width * t.height,
            PcgData::GpuResident(g) => g.element_count,
        }
    }

    pub fn is_gpu_resident(&self) -> bool {
        matches!(self, PcgData::GpuResident(_))
    }

    /// Raw bytes of CPU-resident data
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            PcgData::Buffer(b) => Some(&b.bytes),
            PcgData::Texture(t) => Some(&t.pixels),
            PcgData::GpuResident(_) => None,
        }
    }

    /// Attribute names carried by the data
    pub fn attributes(&self) -> &[String] {
        match self {
            PcgData::Buffer(b) => &b.attributes,
            PcgData::GpuResident(g) => &g.attributes,
            PcgData::Texture(_) => &[],
        }
    }
}

/// Data tagged with the pin it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaggedData {
    pub pin: PinLabel,
    pub data: PcgData,
}

/// Ordered collection of pin-tagged data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataCollection {
    pub tagged: Vec<TaggedData>,
}

impl DataCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pin: impl Into<PinLabel>, data: PcgData) {
        self.tagged.push(TaggedData {
            pin: pin.into(),
            data,
        });
    }

    /// Builder-style [`push`](Self::push)
    pub fn with(mut self, pin: impl Into<PinLabel>, data: PcgData) -> Self {
        self.push(pin, data);
        self
    }

    pub fn len(&self) -> usize {
        self.tagged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tagged.is_empty()
    }

    /// All data tagged with `pin`, in insertion order
    pub fn for_pin<'a>(&'a self, pin: &'a PinLabel) -> impl Iterator<Item = &'a PcgData> + 'a {
        self.tagged
            .iter()
            .filter(move |t| &t.pin == pin)
            .map(|t| &t.data)
    }

    /// Total element count across all data on `pin`
    pub fn element_count_for_pin(&self, pin: &PinLabel) -> u32 {
        self.for_pin(pin).map(PcgData::element_count).sum()
    }

    /// Pins present in the collection, deduplicated in first-seen order
    pub fn pins(&self) -> Vec<PinLabel> {
        let mut pins: Vec<PinLabel> = Vec::new();
        for tagged in &self.tagged {
            if !pins.contains(&tagged.pin) {
                pins.push(tagged.pin.clone());
            }
        }
        pins
    }
}
