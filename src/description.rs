//! Size and shape plans for every pin of an execution.
//!
//! Descriptions are primed after pre-execute readbacks complete, because a
//! pin sized from an input can only be resolved once GPU-resident inputs
//! are back on the CPU. Counted pins are narrowed again after the dispatch,
//! once their counters have been read back.

use crate::binding::StringTable;
use crate::error::{PcgError, Result};
use crate::gpu::ResourceDesc;
use crate::graph::{CompiledKernelGraph, PinDirection, PinSizing, PinSpec};
use crate::id::PinId;
use crate::types::{DataCollection, DataKind, ExportMode, PcgData, PinLabel};
use serde::{Deserialize, Serialize};

/// Planned shape of one pin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinDescription {
    pub pin: PinLabel,
    pub pin_id: PinId,
    pub direction: PinDirection,
    pub kind: DataKind,
    pub element_count: u32,
    /// Texture extent for texture pins
    pub extent: Option<(u32, u32)>,
    pub attributes: Vec<String>,
    /// String table ids of `attributes`, in the same order
    pub attribute_ids: Vec<u32>,
    pub export_mode: ExportMode,
    pub counted: bool,
    /// Data items supplied on an input pin
    pub supplied_items: usize,
    /// An input item's shape disagrees with the pin declaration
    pub kind_mismatch: bool,
}

impl PinDescription {
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.element_count) * u64::from(self.kind.element_size())
    }

    pub fn resource_desc(&self) -> ResourceDesc {
        ResourceDesc {
            label: self.pin.to_string(),
            kind: self.kind,
            element_count: self.element_count,
            extent: self.extent,
            attributes: self.attributes.clone(),
        }
    }
}

/// Descriptions of every pin, indexed by `PinId`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCollectionDescription {
    pub pins: Vec<PinDescription>,
}

impl DataCollectionDescription {
    pub fn get(&self, pin: PinId) -> Option<&PinDescription> {
        self.pins.get(pin.index())
    }

    pub fn by_label(&self, label: &PinLabel) -> Option<&PinDescription> {
        self.pins.iter().find(|d| &d.pin == label)
    }

    /// Narrow counted pins to the element counts their kernels reported.
    /// Counts never grow a pin.
    pub fn roll_up_counted(&mut self, counts: &[(PinId, u32)]) {
        for &(pin, count) in counts {
            if let Some(desc) = self.pins.get_mut(pin.index()) {
                if desc.counted {
                    desc.element_count = desc.element_count.min(count);
                }
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.pins.iter().map(PinDescription::size_bytes).sum()
    }
}

/// The primed descriptions of one execution.
#[derive(Debug, Clone, Default)]
pub struct DataDescriptionCache {
    primed: Option<DataCollectionDescription>,
}

impl DataDescriptionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute and store descriptions for every pin of `graph`.
    pub fn prime(
        &mut self,
        graph: &CompiledKernelGraph,
        inputs: &DataCollection,
        strings: &StringTable,
    ) -> Result<&DataCollectionDescription> {
        let computed = compute_descriptions(graph, inputs, strings)?;
        Ok(self.primed.insert(computed))
    }

    /// Store descriptions computed elsewhere
    pub fn set(&mut self, descriptions: DataCollectionDescription) {
        self.primed = Some(descriptions);
    }

    pub fn get(&self) -> Option<&DataCollectionDescription> {
        self.primed.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut DataCollectionDescription> {
        self.primed.as_mut()
    }

    pub fn is_primed(&self) -> bool {
        self.primed.is_some()
    }

    pub fn clear(&mut self) {
        self.primed = None;
    }
}

/// Compute the description of every pin from the graph and resolved inputs.
///
/// `inputs` must no longer contain GPU-resident items on pins that are
/// sized from data; their element counts are taken as-is otherwise.
pub fn compute_descriptions(
    graph: &CompiledKernelGraph,
    inputs: &DataCollection,
    strings: &StringTable,
) -> Result<DataCollectionDescription> {
    let mut counts: Vec<Option<u32>> = vec![None; graph.pins.len()];
    for idx in 0..graph.pins.len() {
        resolve_count(graph, inputs, idx, &mut counts, 0)?;
    }

    let pins = graph
        .pins
        .iter()
        .enumerate()
        .map(|(idx, spec)| {
            let items: Vec<&PcgData> = inputs.for_pin(&spec.label).collect();
            let extent = resolve_extent(spec, &items);
            let attributes = pin_attributes(spec, &items);
            let attribute_ids = attributes.iter().filter_map(|a| strings.id(a)).collect();
            let is_input = spec.direction == PinDirection::Input;

            PinDescription {
                pin: spec.label.clone(),
                pin_id: PinId::from_index(idx),
                direction: spec.direction,
                kind: spec.kind,
                element_count: counts[idx].unwrap_or(0),
                extent,
                attributes,
                attribute_ids,
                export_mode: spec.export_mode,
                counted: spec.counted,
                supplied_items: if is_input { items.len() } else { 0 },
                kind_mismatch: is_input && items.iter().any(|d| !shape_matches(spec.kind, d)),
            }
        })
        .collect();

    Ok(DataCollectionDescription { pins })
}

const MAX_SIZING_DEPTH: usize = 64;

fn resolve_count(
    graph: &CompiledKernelGraph,
    inputs: &DataCollection,
    idx: usize,
    counts: &mut Vec<Option<u32>>,
    depth: usize,
) -> Result<u32> {
    if let Some(count) = counts[idx] {
        return Ok(count);
    }
    if depth > MAX_SIZING_DEPTH {
        return Err(PcgError::Declaration(format!(
            "pin '{}' has a circular size dependency",
            graph.pins[idx].label
        )));
    }

    let spec = &graph.pins[idx];
    let count = match &spec.sizing {
        PinSizing::FromData => inputs.element_count_for_pin(&spec.label),
        PinSizing::Fixed { elements } => *elements,
        PinSizing::Extent { width, height } => width.checked_mul(*height).ok_or_else(|| {
            PcgError::Declaration(format!(
                "pin '{}' extent {}x{} has more texels than an element count can hold",
                spec.label, width, height
            ))
        })?,
        PinSizing::FromInput { pin, multiplier } => {
            let source = graph.pin_id(pin).ok_or_else(|| {
                PcgError::Declaration(format!(
                    "pin '{}' is sized from undeclared pin '{}'",
                    spec.label, pin
                ))
            })?;
            resolve_count(graph, inputs, source.index(), counts, depth + 1)?
                .saturating_mul(*multiplier)
        }
    };

    counts[idx] = Some(count);
    Ok(count)
}

fn resolve_extent(spec: &PinSpec, items: &[&PcgData]) -> Option<(u32, u32)> {
    if !matches!(spec.kind, DataKind::Texture { .. }) {
        return None;
    }
    match spec.sizing {
        PinSizing::Extent { width, height } => Some((width, height)),
        _ => items.iter().find_map(|d| match d {
            PcgData::Texture(t) => Some((t.width, t.height)),
            PcgData::GpuResident(g) => g.extent,
            PcgData::Buffer(_) => None,
        }),
    }
}

/// Declared attributes first, then any new ones carried by input data
fn pin_attributes(spec: &PinSpec, items: &[&PcgData]) -> Vec<String> {
    let mut attributes = spec.attributes.clone();
    for item in items {
        for name in item.attributes() {
            if !attributes.contains(name) {
                attributes.push(name.clone());
            }
        }
    }
    attributes
}

fn shape_matches(kind: DataKind, data: &PcgData) -> bool {
    match (kind, data) {
        (DataKind::Buffer { stride }, PcgData::Buffer(b)) => b.stride == stride,
        (DataKind::Texture { format }, PcgData::Texture(t)) => t.format == format,
        (kind, PcgData::GpuResident(g)) => g.kind == kind,
        _ => false,
    }
}

/// Check primed descriptions against the graph's declared limits.
pub fn validate_against(
    graph: &CompiledKernelGraph,
    descriptions: &DataCollectionDescription,
) -> std::result::Result<(), String> {
    if descriptions.pins.len() != graph.pins.len() {
        return Err(format!(
            "{} descriptions for {} pins",
            descriptions.pins.len(),
            graph.pins.len()
        ));
    }

    for (spec, desc) in graph.pins.iter().zip(&descriptions.pins) {
        if spec.direction == PinDirection::Input && spec.required && desc.supplied_items == 0 {
            return Err(format!("required input pin '{}' has no data", spec.label));
        }
        if desc.kind_mismatch {
            return Err(format!("data on pin '{}' does not match its declared shape", spec.label));
        }
        if desc.element_count > graph.settings.max_elements_per_pin {
            return Err(format!(
                "pin '{}' needs {} elements, limit is {}",
                spec.label, desc.element_count, graph.settings.max_elements_per_pin
            ));
        }
        if let Some((width, height)) = desc.extent {
            let limit = graph.settings.max_texture_extent;
            if width > limit || height > limit {
                return Err(format!(
                    "texture pin '{}' extent {}x{} exceeds {}",
                    spec.label, width, height, limit
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::KernelIo;
    use crate::graph::{GraphDeclaration, KernelDecl, KernelGraphCompiler};
    use crate::types::{BufferData, GridSize, TextureData, TextureFormat};
    use proptest::prelude::*;

    fn noop(_io: &mut KernelIo<'_>) -> Result<()> {
        Ok(())
    }

    fn graph(multiplier: u32) -> CompiledKernelGraph {
        let decl = GraphDeclaration::new("forest")
            .pin(PinSpec::input_buffer("Surface", 8).with_attributes(["height"]))
            .pin(PinSpec::input_texture("Mask", TextureFormat::R8).optional())
            .pin(
                PinSpec::output_buffer(
                    "Points",
                    12,
                    PinSizing::FromInput {
                        pin: "Surface".into(),
                        multiplier,
                    },
                )
                .counted(),
            )
            .kernel(
                KernelDecl::new("scatter", noop)
                    .reads("Surface")
                    .reads("Mask")
                    .writes("Points"),
            );
        KernelGraphCompiler::compile(&decl, GridSize::Cells(400), 0).unwrap()
    }

    fn surface(elements: usize) -> PcgData {
        PcgData::Buffer(BufferData::from_f32s(
            2,
            vec!["height".into(), "slope".into()],
            &vec![0.5; elements * 2],
        ))
    }

    #[test]
    fn test_descriptions_follow_inputs() {
        let graph = graph(4);
        let inputs = DataCollection::new()
            .with("Surface", surface(3))
            .with("Surface", surface(2))
            .with(
                "Mask",
                PcgData::Texture(TextureData {
                    width: 16,
                    height: 8,
                    format: TextureFormat::R8,
                    pixels: vec![0; 128],
                }),
            );
        let strings = StringTable::build(&graph, &inputs);
        let descriptions = compute_descriptions(&graph, &inputs, &strings).unwrap();

        let surface = descriptions.get(PinId(0)).unwrap();
        assert_eq!(surface.element_count, 5);
        assert_eq!(surface.supplied_items, 2);
        assert_eq!(surface.attributes, vec!["height".to_string(), "slope".to_string()]);
        assert_eq!(surface.attribute_ids.len(), 2);

        let mask = descriptions.get(PinId(1)).unwrap();
        assert_eq!(mask.extent, Some((16, 8)));
        assert_eq!(mask.element_count, 128);

        let points = descriptions.get(PinId(2)).unwrap();
        assert_eq!(points.element_count, 20);
        assert_eq!(points.size_bytes(), 240);
        assert!(validate_against(&graph, &descriptions).is_ok());
    }

    #[test]
    fn test_missing_required_input_is_invalid() {
        let graph = graph(1);
        let inputs = DataCollection::new();
        let strings = StringTable::build(&graph, &inputs);
        let descriptions = compute_descriptions(&graph, &inputs, &strings).unwrap();
        let err = validate_against(&graph, &descriptions).unwrap_err();
        assert!(err.contains("Surface"));
    }

    #[test]
    fn test_mismatched_stride_is_invalid() {
        let graph = graph(1);
        let inputs = DataCollection::new().with(
            "Surface",
            PcgData::Buffer(BufferData::from_f32s(3, vec![], &[0.0; 6])),
        );
        let strings = StringTable::build(&graph, &inputs);
        let descriptions = compute_descriptions(&graph, &inputs, &strings).unwrap();
        assert!(descriptions.get(PinId(0)).unwrap().kind_mismatch);
        assert!(validate_against(&graph, &descriptions).is_err());
    }

    #[test]
    fn test_roll_up_only_touches_counted_pins() {
        let graph = graph(4);
        let inputs = DataCollection::new().with("Surface", surface(10));
        let strings = StringTable::build(&graph, &inputs);
        let mut descriptions = compute_descriptions(&graph, &inputs, &strings).unwrap();

        descriptions.roll_up_counted(&[(PinId(0), 1), (PinId(2), 7)]);
        assert_eq!(descriptions.get(PinId(0)).unwrap().element_count, 10);
        assert_eq!(descriptions.get(PinId(2)).unwrap().element_count, 7);
    }

    #[test]
    fn test_cache_prime() {
        let graph = graph(2);
        let inputs = DataCollection::new().with("Surface", surface(4));
        let strings = StringTable::build(&graph, &inputs);
        let mut cache = DataDescriptionCache::new();
        assert!(!cache.is_primed());

        let points = cache.prime(&graph, &inputs, &strings).unwrap().get(PinId(2)).cloned();
        assert_eq!(points.unwrap().element_count, 8);
        assert!(cache.is_primed());

        cache.clear();
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_oversized_extent_is_rejected() {
        let decl = GraphDeclaration::new("terrain")
            .pin(PinSpec::output_texture("Height", TextureFormat::R32F, 70_000, 70_000))
            .kernel(KernelDecl::new("erode", noop).writes("Height"));
        let graph = KernelGraphCompiler::compile(&decl, GridSize::Cells(400), 0).unwrap();
        let inputs = DataCollection::new();
        let strings = StringTable::build(&graph, &inputs);

        let err = compute_descriptions(&graph, &inputs, &strings).unwrap_err();
        assert!(matches!(err, PcgError::Declaration(ref m) if m.contains("70000x70000")));
    }

    proptest! {
        #[test]
        fn test_from_input_sizing_scales(elements in 0usize..256, multiplier in 1u32..16) {
            let graph = graph(multiplier);
            let inputs = DataCollection::new().with("Surface", surface(elements));
            let strings = StringTable::build(&graph, &inputs);
            let descriptions = compute_descriptions(&graph, &inputs, &strings).unwrap();
            prop_assert_eq!(
                descriptions.get(PinId(2)).unwrap().element_count,
                elements as u32 * multiplier
            );
        }

        #[test]
        fn test_roll_up_never_grows(elements in 1usize..128, count in 0u32..1024) {
            let graph = graph(2);
            let inputs = DataCollection::new().with("Surface", surface(elements));
            let strings = StringTable::build(&graph, &inputs);
            let mut descriptions = compute_descriptions(&graph, &inputs, &strings).unwrap();
            let before = descriptions.get(PinId(2)).unwrap().element_count;
            descriptions.roll_up_counted(&[(PinId(2), count)]);
            let after = descriptions.get(PinId(2)).unwrap().element_count;
            prop_assert!(after <= before);
            prop_assert_eq!(after, before.min(count));
        }
    }
}
