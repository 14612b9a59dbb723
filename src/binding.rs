//! Data binding: the providers of one execution and what flows through them.
//!
//! [`DataBinding`] owns the checked-out [`GraphInstance`] (and through it the
//! providers, indexed by `ProviderId`), the caller's input collection, the
//! attribute [`StringTable`], the primed descriptions, the exports received
//! from the render side and finally the output collection.

use crate::description::{DataCollectionDescription, DataDescriptionCache};
use crate::error::{PcgError, Result};
use crate::gpu::{BoundPin, ComputeWork, ExportHandle, KernelBinding};
use crate::graph::{CompiledKernelGraph, PinDirection};
use crate::id::{PinId, ProviderId};
use crate::pool::GraphInstance;
use crate::provider::{DataProvider, ProviderContext};
use crate::readback::ReadbackKind;
use crate::types::DataCollection;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Interned attribute names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringTable {
    names: Vec<String>,
    index: HashMap<String, u32>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every attribute declared on the graph's pins, then every
    /// attribute carried by the input data, in first-seen order.
    pub fn build(graph: &CompiledKernelGraph, inputs: &DataCollection) -> Self {
        let mut table = Self::new();
        for pin in &graph.pins {
            for name in &pin.attributes {
                table.intern(name);
            }
        }
        for tagged in &inputs.tagged {
            for name in tagged.data.attributes() {
                table.intern(name);
            }
        }
        table
    }

    pub fn intern(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.index.get(name) {
            return id;
        }
        let id = self.names.len() as u32;
        self.names.push(name.to_string());
        self.index.insert(name.to_string(), id);
        id
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.index.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// Providers and data of one execution.
#[derive(Debug)]
pub struct DataBinding {
    instance: GraphInstance,
    inputs: DataCollection,
    strings: Option<Arc<StringTable>>,
    descriptions: DataDescriptionCache,
    received_exports: BTreeMap<ProviderId, ExportHandle>,
    output: Option<DataCollection>,
}

impl DataBinding {
    /// Bind `inputs` to the input providers of a checked-out instance.
    pub fn new(mut instance: GraphInstance, inputs: DataCollection) -> Self {
        for provider in instance.providers_mut() {
            if provider.direction() == PinDirection::Input {
                let items = inputs.for_pin(provider.label()).cloned().collect();
                provider.assign_inputs(items);
            }
        }

        Self {
            instance,
            inputs,
            strings: None,
            descriptions: DataDescriptionCache::new(),
            received_exports: BTreeMap::new(),
            output: None,
        }
    }

    pub fn graph(&self) -> &Arc<CompiledKernelGraph> {
        self.instance.graph()
    }

    pub fn providers(&self) -> &[DataProvider] {
        self.instance.providers()
    }

    pub fn provider(&self, id: ProviderId) -> Option<&DataProvider> {
        self.instance.provider(id)
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers().iter().map(DataProvider::id).collect()
    }

    pub fn inputs(&self) -> &DataCollection {
        &self.inputs
    }

    pub fn set_strings(&mut self, strings: Arc<StringTable>) {
        self.strings = Some(strings);
    }

    pub fn strings(&self) -> Option<&Arc<StringTable>> {
        self.strings.as_ref()
    }

    pub fn descriptions(&self) -> Option<&DataCollectionDescription> {
        self.descriptions.get()
    }

    pub fn set_descriptions(&mut self, descriptions: DataCollectionDescription) {
        self.descriptions.set(descriptions);
    }

    /// The input collection with GPU-resident items on graph input pins
    /// replaced by their read-back CPU copies.
    pub fn resolved_inputs(&self) -> DataCollection {
        let mut resolved = DataCollection::new();
        let graph = self.graph();
        for tagged in &self.inputs.tagged {
            let is_input_pin = graph
                .pin_id(&tagged.pin)
                .and_then(|pin| graph.pin(pin))
                .map(|spec| spec.direction == PinDirection::Input)
                .unwrap_or(false);
            if !is_input_pin {
                resolved.push(tagged.pin.clone(), tagged.data.clone());
            }
        }
        for provider in self.providers() {
            if provider.direction() == PinDirection::Input {
                for item in provider.input_items() {
                    resolved.push(provider.label().clone(), item.clone());
                }
            }
        }
        resolved
    }

    fn context<'a>(&'a self, cx: ProviderContext<'a>) -> ProviderContext<'a> {
        cx.with_descriptions(self.descriptions.get())
    }

    /// Poll every provider's pre-execute readbacks. True once all are ready.
    pub fn poll_pre_execute_readbacks(&mut self, cx: ProviderContext<'_>) -> Result<bool> {
        let mut ready = true;
        for provider in self.instance.providers_mut() {
            ready &= provider.perform_pre_execute_readbacks(&cx)?;
        }
        Ok(ready)
    }

    /// Poll the providers in `pending`, removing the ones that are prepared.
    pub fn poll_prepare(&mut self, cx: ProviderContext<'_>, pending: &mut Vec<ProviderId>) -> Result<bool> {
        let cx = cx.with_descriptions(self.descriptions.get());
        let providers = self.instance.providers_mut();
        let mut still_pending = Vec::with_capacity(pending.len());
        for &id in pending.iter() {
            let provider = providers
                .get_mut(id.index())
                .ok_or_else(|| PcgError::Arena(format!("unknown {}", id)))?;
            if !provider.prepare_for_execute(&cx)? {
                still_pending.push(id);
            }
        }
        *pending = still_pending;
        Ok(pending.is_empty())
    }

    /// Poll `post_execute` on the providers in `pending`, removing finished ones.
    pub fn poll_post_execute(
        &mut self,
        cx: ProviderContext<'_>,
        pending: &mut Vec<ProviderId>,
    ) -> Result<bool> {
        let cx = cx.with_descriptions(self.descriptions.get());
        let providers = self.instance.providers_mut();
        let mut still_pending = Vec::with_capacity(pending.len());
        for &id in pending.iter() {
            let provider = providers
                .get_mut(id.index())
                .ok_or_else(|| PcgError::Arena(format!("unknown {}", id)))?;
            if !provider.post_execute(&cx)? {
                still_pending.push(id);
            }
        }
        *pending = still_pending;
        Ok(pending.is_empty())
    }

    /// Bind every kernel to its resources and gather provider completions.
    pub fn build_compute_work(&self, cx: ProviderContext<'_>, name: &str) -> Result<ComputeWork> {
        let cx = self.context(cx);
        let graph = self.graph();
        let mut work = ComputeWork::new(name, Arc::clone(cx.arena));

        let bind = |pin: PinId| -> Result<BoundPin> {
            let provider = self
                .provider(ProviderId::from(pin))
                .ok_or_else(|| PcgError::Arena(format!("no provider for {}", pin)))?;
            let resource = provider.resource().ok_or_else(|| {
                PcgError::Arena(format!("pin '{}' has no resource", provider.label()))
            })?;
            Ok(BoundPin {
                pin,
                label: provider.label().clone(),
                resource,
            })
        };

        for kernel in &graph.kernels {
            work.add_kernel(KernelBinding {
                kernel: kernel.id,
                name: kernel.name.clone(),
                program: Arc::clone(&kernel.program),
                reads: kernel.reads.iter().map(|&p| bind(p)).collect::<Result<_>>()?,
                writes: kernel.writes.iter().map(|&p| bind(p)).collect::<Result<_>>()?,
                max_elements: kernel.max_elements,
            });
        }

        for provider in self.providers() {
            work.guard(provider.generation_cell());
            for completion in provider.register_completions(&cx)? {
                work.add_completion(completion);
            }
        }

        Ok(work)
    }

    /// Fan a read-back payload out to its provider.
    pub fn apply_readback(
        &mut self,
        provider: ProviderId,
        kind: ReadbackKind,
        bytes: Vec<u8>,
        counter: Option<u32>,
    ) {
        if let Some(provider) = self.instance.provider_mut(provider) {
            provider.on_readback(kind, bytes, counter);
        }
    }

    /// Record an export delivered by the render side.
    pub fn record_export(&mut self, provider: ProviderId, handle: ExportHandle) {
        self.received_exports.insert(provider, handle);
        if let Some(provider) = self.instance.provider_mut(provider) {
            provider.on_exported(handle);
        }
    }

    pub fn received_exports(&self) -> &BTreeMap<ProviderId, ExportHandle> {
        &self.received_exports
    }

    /// Element counts reported by counted pins
    pub fn counted_elements(&self) -> Vec<(PinId, u32)> {
        self.providers()
            .iter()
            .filter_map(|p| p.counter().flatten().map(|count| (p.pin(), count)))
            .collect()
    }

    /// Narrow counted pins on the primed descriptions.
    pub fn roll_up_counted(&mut self) {
        let counts = self.counted_elements();
        if let Some(descriptions) = self.descriptions.get_mut() {
            descriptions.roll_up_counted(&counts);
        }
    }

    /// Assemble the output collection from every output provider.
    pub fn collect_outputs(&mut self) -> Result<&DataCollection> {
        let descriptions = self
            .descriptions
            .get()
            .ok_or_else(|| PcgError::Arena("descriptions were never primed".to_string()))?;

        let mut output = DataCollection::new();
        for provider in self.instance.providers() {
            if provider.direction() != PinDirection::Output {
                continue;
            }
            let desc = descriptions
                .get(provider.pin())
                .ok_or_else(|| PcgError::Arena(format!("no description for {}", provider.pin())))?;
            match provider.output_data(desc) {
                Some(data) => output.push(provider.label().clone(), data),
                None => {
                    return Err(PcgError::Arena(format!(
                        "output pin '{}' produced no data",
                        provider.label()
                    )))
                }
            }
        }

        Ok(self.output.insert(output))
    }

    pub fn output(&self) -> Option<&DataCollection> {
        self.output.as_ref()
    }

    /// Give the instance back for check-in.
    pub fn into_instance(self) -> GraphInstance {
        self.instance
    }
}
