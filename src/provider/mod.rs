//! Data providers: one per graph pin, owning that pin's transient resources.
//!
//! # Contract
//!
//! The executor polls providers through four methods, each returning
//! `Ok(true)` once the provider is ready to move on:
//!
//! - [`DataProvider::perform_pre_execute_readbacks`] brings GPU-resident
//!   inputs back to the CPU so descriptions can be primed
//! - [`DataProvider::prepare_for_execute`] allocates or uploads the pin's resource
//! - [`DataProvider::post_execute`] reads non-exported outputs back
//! - [`DataProvider::is_export_required`] tells the executor to wait for an export
//!
//! Providers never see the executor. Render-side continuations they issue
//! capture the provider's [`Generation`] and are discarded once it advances.

mod data_collection;
mod texture;

pub use data_collection::DataCollectionProvider;
pub use texture::TextureProvider;

use crate::description::{DataCollectionDescription, PinDescription};
use crate::error::{PcgError, Result};
use crate::gpu::{lock, ExportHandle, SharedArena, SharedExportedArena};
use crate::graph::{PinDirection, PinSpec};
use crate::id::{PinId, ProviderId, ResourceId};
use crate::readback::{
    Completion, Generation, GenerationCell, ReadbackChannel, ReadbackKind, ReadbackSource,
};
use crate::types::{BufferData, DataKind, ExportMode, GpuResidentData, PcgData, PinLabel, TextureData};

/// Everything a provider may touch while being polled.
#[derive(Clone, Copy)]
pub struct ProviderContext<'a> {
    pub arena: &'a SharedArena,
    pub exported: &'a SharedExportedArena,
    pub readbacks: &'a ReadbackChannel,
    /// Present once descriptions have been primed
    pub descriptions: Option<&'a DataCollectionDescription>,
}

impl<'a> ProviderContext<'a> {
    pub fn new(
        arena: &'a SharedArena,
        exported: &'a SharedExportedArena,
        readbacks: &'a ReadbackChannel,
    ) -> Self {
        Self {
            arena,
            exported,
            readbacks,
            descriptions: None,
        }
    }

    pub fn with_descriptions(self, descriptions: Option<&'a DataCollectionDescription>) -> Self {
        Self {
            descriptions,
            ..self
        }
    }

    pub fn description(&self, pin: PinId) -> Result<&'a PinDescription> {
        self.descriptions
            .and_then(|d| d.get(pin))
            .ok_or_else(|| PcgError::Arena(format!("no description primed for {}", pin)))
    }
}

/// Input items of a pin, with GPU-resident items read back before use.
#[derive(Debug, Default)]
pub struct InputSlots {
    items: Vec<PcgData>,
    requested: bool,
}

impl InputSlots {
    pub fn assign(&mut self, items: Vec<PcgData>) {
        self.items = items;
        self.requested = false;
    }

    /// Issue one readback per GPU-resident item, the first time only.
    /// Returns true once every item is CPU-resident.
    pub fn request_readbacks(
        &mut self,
        provider: ProviderId,
        live: &GenerationCell,
        cx: &ProviderContext<'_>,
    ) -> bool {
        if !self.requested {
            self.requested = true;
            for (slot, item) in self.items.iter().enumerate() {
                if let PcgData::GpuResident(gpu) = item {
                    let request = cx.readbacks.readback(
                        provider,
                        live,
                        ReadbackSource::Exported {
                            arena: std::sync::Arc::clone(cx.exported),
                            handle: gpu.handle,
                        },
                        ReadbackKind::PreExecute { slot: slot as u32 },
                    );
                    cx.readbacks.request(request);
                }
            }
        }
        self.is_resolved()
    }

    pub fn resolve(&mut self, slot: u32, bytes: Vec<u8>) {
        let Some(item) = self.items.get_mut(slot as usize) else {
            return;
        };
        let resolved = match item {
            PcgData::GpuResident(gpu) => gpu.to_cpu(bytes),
            _ => return,
        };
        *item = resolved;
    }

    pub fn is_resolved(&self) -> bool {
        !self.items.iter().any(PcgData::is_gpu_resident)
    }

    pub fn items(&self) -> &[PcgData] {
        &self.items
    }

    /// Concatenated bytes of every CPU-resident item
    pub fn concatenated_bytes(&self) -> Vec<u8> {
        self.items
            .iter()
            .filter_map(PcgData::bytes)
            .flat_map(|b| b.iter().copied())
            .collect()
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.requested = false;
    }
}

/// State shared by every provider kind.
#[derive(Debug)]
pub struct ProviderState {
    pub id: ProviderId,
    pub pin: PinId,
    pub label: PinLabel,
    pub direction: PinDirection,
    pub kind: DataKind,
    pub export_mode: ExportMode,
    pub counted: bool,
    generation: GenerationCell,
    resource: Option<ResourceId>,
    inputs: InputSlots,
    counter: Option<Option<u32>>,
    export: Option<ExportHandle>,
    output_bytes: Option<Vec<u8>>,
    output_requested: bool,
}

impl ProviderState {
    fn new(id: ProviderId, pin: PinId, spec: &PinSpec) -> Self {
        Self {
            id,
            pin,
            label: spec.label.clone(),
            direction: spec.direction,
            kind: spec.kind,
            export_mode: spec.export_mode,
            counted: spec.counted,
            generation: GenerationCell::new(),
            resource: None,
            inputs: InputSlots::default(),
            counter: None,
            export: None,
            output_bytes: None,
            output_requested: false,
        }
    }

    fn is_export_required(&self) -> bool {
        self.direction == PinDirection::Output && self.export_mode != ExportMode::NoExport
    }

    fn perform_pre_execute_readbacks(&mut self, cx: &ProviderContext<'_>) -> Result<bool> {
        if self.direction != PinDirection::Input {
            return Ok(true);
        }
        Ok(self.inputs.request_readbacks(self.id, &self.generation, cx))
    }

    fn register_completions(&self, cx: &ProviderContext<'_>) -> Result<Vec<Completion>> {
        let mut completions = Vec::new();
        if !self.counted && !self.is_export_required() {
            return Ok(completions);
        }

        let resource = self.resource.ok_or_else(|| {
            PcgError::Arena(format!("provider for '{}' has no resource", self.label))
        })?;

        // Counters are read before the export moves the resource away
        if self.counted {
            completions.push(Completion::Readback(cx.readbacks.readback(
                self.id,
                &self.generation,
                ReadbackSource::Arena {
                    arena: std::sync::Arc::clone(cx.arena),
                    resource,
                },
                ReadbackKind::Counter,
            )));
        }
        if self.is_export_required() {
            completions.push(Completion::Export(cx.readbacks.export(
                self.id,
                &self.generation,
                cx.arena,
                resource,
                cx.exported,
            )));
        }
        Ok(completions)
    }

    fn post_execute(&mut self, cx: &ProviderContext<'_>) -> Result<bool> {
        if self.direction != PinDirection::Output {
            return Ok(true);
        }
        if self.is_export_required() {
            return Ok(self.export.is_some());
        }
        if self.output_bytes.is_some() {
            return Ok(true);
        }

        if !self.output_requested {
            let resource = self.resource.ok_or_else(|| {
                PcgError::Arena(format!("provider for '{}' has no resource", self.label))
            })?;
            let request = cx.readbacks.readback(
                self.id,
                &self.generation,
                ReadbackSource::Arena {
                    arena: std::sync::Arc::clone(cx.arena),
                    resource,
                },
                ReadbackKind::Output,
            );
            cx.readbacks.request(request);
            self.output_requested = true;
        }
        Ok(false)
    }

    fn on_readback(&mut self, kind: ReadbackKind, bytes: Vec<u8>, counter: Option<u32>) {
        match kind {
            ReadbackKind::PreExecute { slot } => self.inputs.resolve(slot, bytes),
            ReadbackKind::Counter => self.counter = Some(counter),
            ReadbackKind::Output => self.output_bytes = Some(bytes),
            ReadbackKind::Debug { .. } => {}
        }
    }

    fn output_data(&self, desc: &PinDescription) -> Option<PcgData> {
        if self.direction != PinDirection::Output {
            return None;
        }

        if let Some(handle) = self.export {
            return Some(PcgData::GpuResident(GpuResidentData {
                handle,
                kind: self.kind,
                element_count: desc.element_count,
                extent: desc.extent,
                attributes: desc.attributes.clone(),
            }));
        }

        let bytes = self.output_bytes.clone()?;
        Some(match self.kind {
            DataKind::Buffer { stride } => {
                let mut buffer = BufferData::from_bytes(stride, desc.attributes.clone(), bytes);
                buffer.truncate_elements(desc.element_count);
                PcgData::Buffer(buffer)
            }
            DataKind::Texture { format } => {
                let (width, height) = desc.extent.unwrap_or((0, 0));
                let mut pixels = bytes;
                pixels.resize(format.size_bytes(width, height) as usize, 0);
                PcgData::Texture(TextureData {
                    width,
                    height,
                    format,
                    pixels,
                })
            }
        })
    }

    /// Advance the generation and forget every per-execution resource.
    fn reset(&mut self) {
        self.generation.advance();
        self.resource = None;
        self.inputs.clear();
        self.counter = None;
        self.export = None;
        self.output_bytes = None;
        self.output_requested = false;
    }

    fn upload_bytes(&self) -> Vec<u8> {
        self.inputs.concatenated_bytes()
    }
}

/// A provider of data on one graph pin.
#[derive(Debug)]
pub enum DataProvider {
    DataCollection(DataCollectionProvider),
    Texture(TextureProvider),
}

impl DataProvider {
    /// Create the provider matching the pin's data kind.
    pub fn for_pin(pin: PinId, spec: &PinSpec) -> Self {
        let state = ProviderState::new(ProviderId::from(pin), pin, spec);
        match spec.kind {
            DataKind::Buffer { .. } => DataProvider::DataCollection(DataCollectionProvider::new(state)),
            DataKind::Texture { .. } => DataProvider::Texture(TextureProvider::new(state)),
        }
    }

    fn state(&self) -> &ProviderState {
        match self {
            DataProvider::DataCollection(p) => &p.state,
            DataProvider::Texture(p) => &p.state,
        }
    }

    fn state_mut(&mut self) -> &mut ProviderState {
        match self {
            DataProvider::DataCollection(p) => &mut p.state,
            DataProvider::Texture(p) => &mut p.state,
        }
    }

    pub fn prepare_for_execute(&mut self, cx: &ProviderContext<'_>) -> Result<bool> {
        match self {
            DataProvider::DataCollection(p) => p.prepare_for_execute(cx),
            DataProvider::Texture(p) => p.prepare_for_execute(cx),
        }
    }

    pub fn perform_pre_execute_readbacks(&mut self, cx: &ProviderContext<'_>) -> Result<bool> {
        self.state_mut().perform_pre_execute_readbacks(cx)
    }

    pub fn post_execute(&mut self, cx: &ProviderContext<'_>) -> Result<bool> {
        self.state_mut().post_execute(cx)
    }

    pub fn is_export_required(&self) -> bool {
        self.state().is_export_required()
    }

    pub fn has_counter(&self) -> bool {
        self.state().counted
    }

    pub fn id(&self) -> ProviderId {
        self.state().id
    }

    pub fn pin(&self) -> PinId {
        self.state().pin
    }

    pub fn label(&self) -> &PinLabel {
        &self.state().label
    }

    pub fn direction(&self) -> PinDirection {
        self.state().direction
    }

    pub fn generation(&self) -> Generation {
        self.state().generation.get()
    }

    pub fn generation_cell(&self) -> &GenerationCell {
        &self.state().generation
    }

    pub fn resource(&self) -> Option<ResourceId> {
        self.state().resource
    }

    /// Counter read back after the dispatch, once received
    pub fn counter(&self) -> Option<Option<u32>> {
        self.state().counter
    }

    pub fn export_handle(&self) -> Option<ExportHandle> {
        self.state().export
    }

    pub fn assign_inputs(&mut self, items: Vec<PcgData>) {
        self.state_mut().inputs.assign(items);
    }

    /// Input items, with GPU-resident ones replaced once read back
    pub fn input_items(&self) -> &[PcgData] {
        self.state().inputs.items()
    }

    pub fn register_completions(&self, cx: &ProviderContext<'_>) -> Result<Vec<Completion>> {
        self.state().register_completions(cx)
    }

    pub fn on_readback(&mut self, kind: ReadbackKind, bytes: Vec<u8>, counter: Option<u32>) {
        self.state_mut().on_readback(kind, bytes, counter);
    }

    pub fn on_exported(&mut self, handle: ExportHandle) {
        self.state_mut().export = Some(handle);
    }

    pub fn output_data(&self, desc: &PinDescription) -> Option<PcgData> {
        self.state().output_data(desc)
    }

    pub fn reset(&mut self) {
        if let DataProvider::Texture(p) = self {
            p.cancel_pending_allocation();
        }
        self.state_mut().reset();
    }
}

/// Allocate or upload the pin's resource in the execution arena.
fn allocate_for(
    direction: PinDirection,
    bytes: Vec<u8>,
    desc: &PinDescription,
    arena: &SharedArena,
) -> Result<ResourceId> {
    let mut arena = lock(arena, "resource arena")?;
    if direction == PinDirection::Input {
        arena.upload(desc.resource_desc(), bytes)
    } else {
        arena.allocate(desc.resource_desc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{DeviceBudget, ExportedArena, RenderQueue, ResourceArena, ResourceDesc};
    use crate::graph::PinSizing;
    use crate::readback::{MainThreadMessage, MainThreadQueue};
    use crate::types::TextureFormat;

    pub(crate) struct Harness {
        pub arena: SharedArena,
        pub exported: SharedExportedArena,
        pub readbacks: ReadbackChannel,
        pub queue: MainThreadQueue,
    }

    impl Harness {
        pub fn new(render: RenderQueue) -> Self {
            let queue = MainThreadQueue::new();
            Self {
                arena: ResourceArena::shared(DeviceBudget::new(1 << 20, 1.0)),
                exported: ExportedArena::shared(),
                readbacks: ReadbackChannel::new(render, queue.sender()),
                queue,
            }
        }

        pub fn cx<'a>(&'a self, descriptions: Option<&'a DataCollectionDescription>) -> ProviderContext<'a> {
            ProviderContext::new(&self.arena, &self.exported, &self.readbacks).with_descriptions(descriptions)
        }

        /// Deliver queued messages to `provider` as the executor would
        pub fn deliver(&self, provider: &mut DataProvider) -> usize {
            let mut delivered = 0;
            for message in self.queue.drain() {
                if let MainThreadMessage::ReadbackComplete {
                    generation,
                    kind,
                    bytes,
                    counter,
                    ..
                } = message
                {
                    if generation == provider.generation() {
                        provider.on_readback(kind, bytes, counter);
                        delivered += 1;
                    }
                }
            }
            delivered
        }
    }

    pub(crate) fn description(spec: &PinSpec, element_count: u32) -> DataCollectionDescription {
        DataCollectionDescription {
            pins: vec![PinDescription {
                pin: spec.label.clone(),
                pin_id: PinId(0),
                direction: spec.direction,
                kind: spec.kind,
                element_count,
                extent: match spec.sizing {
                    PinSizing::Extent { width, height } => Some((width, height)),
                    _ => None,
                },
                attributes: vec![],
                attribute_ids: vec![],
                export_mode: spec.export_mode,
                counted: spec.counted,
                supplied_items: 0,
                kind_mismatch: false,
            }],
        }
    }

    #[test]
    fn test_for_pin_picks_kind() {
        let buffer = DataProvider::for_pin(PinId(0), &PinSpec::input_buffer("In", 4));
        assert!(matches!(buffer, DataProvider::DataCollection(_)));

        let texture = DataProvider::for_pin(PinId(1), &PinSpec::input_texture("Mask", TextureFormat::R8));
        assert!(matches!(texture, DataProvider::Texture(_)));
        assert_eq!(texture.id(), ProviderId(1));
    }

    #[test]
    fn test_pre_execute_readback_issued_once() {
        let harness = Harness::new(RenderQueue::deferred());
        let handle = harness.exported.lock().unwrap().insert(
            Generation(1),
            crate::gpu::GpuResource {
                desc: ResourceDesc {
                    label: "In".into(),
                    kind: DataKind::Buffer { stride: 4 },
                    element_count: 2,
                    extent: None,
                    attributes: vec![],
                },
                bytes: vec![1, 0, 0, 0, 2, 0, 0, 0],
                counter: None,
            },
        );

        let mut provider = DataProvider::for_pin(PinId(0), &PinSpec::input_buffer("In", 4));
        provider.assign_inputs(vec![PcgData::GpuResident(GpuResidentData {
            handle,
            kind: DataKind::Buffer { stride: 4 },
            element_count: 2,
            extent: None,
            attributes: vec![],
        })]);

        let cx = harness.cx(None);
        assert!(!provider.perform_pre_execute_readbacks(&cx).unwrap());
        assert!(!provider.perform_pre_execute_readbacks(&cx).unwrap());
        assert_eq!(harness.readbacks.issued(), 1);

        harness.readbacks.render().pump();
        assert_eq!(harness.deliver(&mut provider), 1);
        assert!(provider.perform_pre_execute_readbacks(&cx).unwrap());
        assert!(matches!(provider.input_items()[0], PcgData::Buffer(ref b) if b.element_count == 2));
    }

    #[test]
    fn test_reset_advances_generation_and_forgets_state() {
        let harness = Harness::new(RenderQueue::inline());
        let spec = PinSpec::output_buffer("Out", 4, PinSizing::Fixed { elements: 4 });
        let descriptions = description(&spec, 4);
        let mut provider = DataProvider::for_pin(PinId(0), &spec);

        assert!(provider.prepare_for_execute(&harness.cx(Some(&descriptions))).unwrap());
        assert!(provider.resource().is_some());

        let before = provider.generation();
        provider.reset();
        assert!(provider.generation() > before);
        assert!(provider.resource().is_none());
    }

    #[test]
    fn test_output_readback_in_post_execute() {
        let harness = Harness::new(RenderQueue::inline());
        let spec = PinSpec::output_buffer("Out", 4, PinSizing::Fixed { elements: 2 });
        let descriptions = description(&spec, 2);
        let mut provider = DataProvider::for_pin(PinId(0), &spec);
        let cx = harness.cx(Some(&descriptions));

        provider.prepare_for_execute(&cx).unwrap();
        assert!(!provider.post_execute(&cx).unwrap());
        assert_eq!(harness.deliver(&mut provider), 1);
        assert!(provider.post_execute(&cx).unwrap());

        let data = provider.output_data(&descriptions.pins[0]).unwrap();
        assert_eq!(data.element_count(), 2);
    }

    #[test]
    fn test_export_completion_registered_for_exported_output() {
        let harness = Harness::new(RenderQueue::inline());
        let spec = PinSpec::output_buffer("Out", 4, PinSizing::Fixed { elements: 2 })
            .with_export(ExportMode::ComputeGraphOutput)
            .counted();
        let descriptions = description(&spec, 2);
        let mut provider = DataProvider::for_pin(PinId(0), &spec);
        let cx = harness.cx(Some(&descriptions));

        assert!(provider.register_completions(&cx).is_err());
        provider.prepare_for_execute(&cx).unwrap();
        let completions = provider.register_completions(&cx).unwrap();
        assert_eq!(completions.len(), 2);
        assert!(matches!(completions[0], Completion::Readback(_)));
        assert!(matches!(completions[1], Completion::Export(_)));
        assert!(provider.is_export_required());
        assert!(provider.has_counter());
    }
}
