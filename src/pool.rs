//! Pool of reusable graph instances.
//!
//! A [`GraphInstance`] pairs a compiled graph with one provider per pin.
//! Instances are checked out for the duration of an execution and checked
//! back in afterwards; check-in resets every provider, advancing its
//! generation so late render-side continuations of the previous execution
//! can never touch the next one.

use crate::error::Result;
use crate::gpu::lock;
use crate::graph::CompiledKernelGraph;
use crate::id::{PinId, ProviderId};
use crate::provider::DataProvider;
use crate::types::GridSize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Identity of a pooled instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct GraphInstanceKey {
    pub top_level: String,
    pub grid_size: GridSize,
    pub graph_index: u32,
}

impl GraphInstanceKey {
    pub fn new(top_level: impl Into<String>, grid_size: GridSize, graph_index: u32) -> Self {
        Self {
            top_level: top_level.into(),
            grid_size,
            graph_index,
        }
    }
}

/// A compiled graph with its bound providers.
#[derive(Debug)]
pub struct GraphInstance {
    key: GraphInstanceKey,
    graph: Arc<CompiledKernelGraph>,
    providers: Vec<DataProvider>,
    executions: u64,
}

impl GraphInstance {
    fn new(key: GraphInstanceKey, graph: Arc<CompiledKernelGraph>) -> Self {
        let providers = graph
            .pins
            .iter()
            .enumerate()
            .map(|(idx, spec)| DataProvider::for_pin(PinId::from_index(idx), spec))
            .collect();
        Self {
            key,
            graph,
            providers,
            executions: 0,
        }
    }

    pub fn key(&self) -> &GraphInstanceKey {
        &self.key
    }

    pub fn graph(&self) -> &Arc<CompiledKernelGraph> {
        &self.graph
    }

    pub fn providers(&self) -> &[DataProvider] {
        &self.providers
    }

    pub fn providers_mut(&mut self) -> &mut [DataProvider] {
        &mut self.providers
    }

    pub fn provider(&self, id: ProviderId) -> Option<&DataProvider> {
        self.providers.get(id.index())
    }

    pub fn provider_mut(&mut self, id: ProviderId) -> Option<&mut DataProvider> {
        self.providers.get_mut(id.index())
    }

    /// Executions this instance has been checked out for
    pub fn executions(&self) -> u64 {
        self.executions
    }

    fn reset(&mut self) {
        for provider in &mut self.providers {
            provider.reset();
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub checked_in: u64,
    /// Instances dropped because their graph was recompiled
    pub discarded: u64,
}

/// Reusable instances keyed by [`GraphInstanceKey`].
#[derive(Debug, Default)]
pub struct GraphInstancePool {
    available: HashMap<GraphInstanceKey, Vec<GraphInstance>>,
    checked_out: usize,
    stats: PoolStats,
}

pub type SharedPool = Arc<Mutex<GraphInstancePool>>;

impl GraphInstancePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedPool {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Reuse an available instance for `key`, or create one.
    ///
    /// Instances built from an older compilation of the graph are dropped.
    pub fn checkout(&mut self, key: GraphInstanceKey, graph: &Arc<CompiledKernelGraph>) -> GraphInstance {
        self.checked_out += 1;

        if let Some(instances) = self.available.get_mut(&key) {
            let before = instances.len();
            instances.retain(|i| Arc::ptr_eq(&i.graph, graph));
            self.stats.discarded += (before - instances.len()) as u64;

            if let Some(mut instance) = instances.pop() {
                self.stats.reused += 1;
                instance.reset();
                instance.executions += 1;
                tracing::debug!("Reusing graph instance for {:?}", key);
                return instance;
            }
        }

        self.stats.created += 1;
        tracing::debug!("Creating graph instance for {:?}", key);
        let mut instance = GraphInstance::new(key, Arc::clone(graph));
        instance.executions = 1;
        instance
    }

    /// Reset an instance and make it available again.
    pub fn checkin(&mut self, mut instance: GraphInstance) {
        instance.reset();
        self.checked_out = self.checked_out.saturating_sub(1);
        self.stats.checked_in += 1;
        self.available
            .entry(instance.key.clone())
            .or_default()
            .push(instance);
    }

    pub fn available(&self, key: &GraphInstanceKey) -> usize {
        self.available.get(key).map(Vec::len).unwrap_or(0)
    }

    pub fn checked_out(&self) -> usize {
        self.checked_out
    }

    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Drop every available instance. Checked-out instances are unaffected.
    pub fn clear(&mut self) {
        self.available.clear();
    }
}

/// Check an instance back into a shared pool.
pub fn checkin_shared(pool: &SharedPool, instance: GraphInstance) -> Result<()> {
    lock(pool, "graph instance pool")?.checkin(instance);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::KernelIo;
    use crate::graph::{GraphDeclaration, KernelDecl, KernelGraphCompiler, PinSizing, PinSpec};

    fn noop(_io: &mut KernelIo<'_>) -> Result<()> {
        Ok(())
    }

    fn graph() -> Arc<CompiledKernelGraph> {
        let decl = GraphDeclaration::new("forest")
            .pin(PinSpec::input_buffer("In", 4))
            .pin(PinSpec::output_buffer("Out", 4, PinSizing::Fixed { elements: 4 }))
            .kernel(KernelDecl::new("copy", noop).reads("In").writes("Out"));
        Arc::new(KernelGraphCompiler::compile(&decl, GridSize::Cells(400), 0).unwrap())
    }

    fn key() -> GraphInstanceKey {
        GraphInstanceKey::new("forest", GridSize::Cells(400), 0)
    }

    #[test]
    fn test_checkout_creates_one_provider_per_pin() {
        let mut pool = GraphInstancePool::new();
        let instance = pool.checkout(key(), &graph());
        assert_eq!(instance.providers().len(), 2);
        assert_eq!(instance.provider(ProviderId(1)).unwrap().pin(), PinId(1));
        assert_eq!(pool.checked_out(), 1);
        assert_eq!(pool.stats().created, 1);
    }

    #[test]
    fn test_checkin_then_reuse() {
        let mut pool = GraphInstancePool::new();
        let graph = graph();
        let instance = pool.checkout(key(), &graph);
        let generation = instance.provider(ProviderId(0)).unwrap().generation();

        pool.checkin(instance);
        assert_eq!(pool.available(&key()), 1);
        assert_eq!(pool.checked_out(), 0);

        let instance = pool.checkout(key(), &graph);
        assert_eq!(pool.stats().reused, 1);
        assert_eq!(instance.executions(), 2);
        assert!(instance.provider(ProviderId(0)).unwrap().generation() > generation);
    }

    #[test]
    fn test_recompiled_graph_discards_stale_instances() {
        let mut pool = GraphInstancePool::new();
        let instance = pool.checkout(key(), &graph());
        pool.checkin(instance);

        let _fresh = pool.checkout(key(), &graph());
        assert_eq!(pool.stats().discarded, 1);
        assert_eq!(pool.stats().created, 2);
        assert_eq!(pool.available(&key()), 0);
    }

    #[test]
    fn test_clear() {
        let mut pool = GraphInstancePool::new();
        let graph = graph();
        let a = pool.checkout(key(), &graph);
        let b = pool.checkout(key(), &graph);
        pool.checkin(a);
        pool.clear();
        assert_eq!(pool.available(&key()), 0);
        assert_eq!(pool.checked_out(), 1);
        pool.checkin(b);
        assert_eq!(pool.available(&key()), 1);
    }
}
