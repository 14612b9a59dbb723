//! Debug visualization and inspection of execution outputs.
//!
//! After a successful execution with debug or inspection enabled, the
//! executor reads GPU-resident outputs back through a [`DebugPreparation`],
//! hands the CPU copy to a [`DebugVisualizer`] and stores it in an
//! [`InspectionStore`] keyed by the producer that requested the execution.

use crate::binding::DataBinding;
use crate::error::Result;
use crate::gpu::{lock, SharedExportedArena};
use crate::readback::{ReadbackChannel, ReadbackKind, ReadbackSource};
use crate::types::{DataCollection, GridSize, PcgData};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One captured output collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InspectionSnapshot {
    /// Key of the producer that requested the execution
    pub producer: String,
    pub graph: String,
    pub grid: GridSize,
    pub captured_at: DateTime<Utc>,
    pub collection: DataCollection,
}

impl InspectionSnapshot {
    pub fn new(
        producer: impl Into<String>,
        graph: impl Into<String>,
        grid: GridSize,
        collection: DataCollection,
    ) -> Self {
        Self {
            producer: producer.into(),
            graph: graph.into(),
            grid,
            captured_at: Utc::now(),
            collection,
        }
    }
}

/// Sink for inspection snapshots.
#[cfg_attr(test, mockall::automock)]
pub trait InspectionStore: Send + Sync {
    fn store(&self, snapshot: InspectionSnapshot) -> Result<()>;
}

/// Consumer of debug output.
#[cfg_attr(test, mockall::automock)]
pub trait DebugVisualizer: Send + Sync {
    fn visualize(&self, producer: &str, collection: &DataCollection);
}

/// In-memory [`InspectionStore`] keeping the most recent snapshots.
#[derive(Debug)]
pub struct MemoryInspectionStore {
    snapshots: Mutex<VecDeque<InspectionSnapshot>>,
    /// Maximum number of snapshots kept (0 = unlimited)
    max_snapshots: usize,
}

impl Default for MemoryInspectionStore {
    fn default() -> Self {
        Self::new(0)
    }
}

impl MemoryInspectionStore {
    pub fn new(max_snapshots: usize) -> Self {
        Self {
            snapshots: Mutex::new(VecDeque::new()),
            max_snapshots,
        }
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent snapshot stored for `producer`
    pub fn latest(&self, producer: &str) -> Option<InspectionSnapshot> {
        let snapshots = self.snapshots.lock().ok()?;
        snapshots.iter().rev().find(|s| s.producer == producer).cloned()
    }

    pub fn snapshots(&self) -> Result<Vec<InspectionSnapshot>> {
        Ok(lock(&self.snapshots, "inspection store")?.iter().cloned().collect())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshots()?)?)
    }

    /// Write every snapshot to `path` as JSON.
    pub fn dump_json(&self, path: &Path) -> Result<()> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        tracing::info!("Wrote {} inspection snapshot(s) to {:?}", self.len(), path);
        Ok(())
    }
}

impl InspectionStore for MemoryInspectionStore {
    fn store(&self, snapshot: InspectionSnapshot) -> Result<()> {
        let mut snapshots = lock(&self.snapshots, "inspection store")?;
        if self.max_snapshots > 0 {
            while snapshots.len() >= self.max_snapshots {
                snapshots.pop_front();
            }
        }
        snapshots.push_back(snapshot);
        Ok(())
    }
}

/// [`DebugVisualizer`] that logs a summary of every collection it sees.
#[derive(Debug, Default)]
pub struct LogVisualizer {
    visualized: AtomicU64,
}

impl LogVisualizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn visualized(&self) -> u64 {
        self.visualized.load(Ordering::Relaxed)
    }
}

impl DebugVisualizer for LogVisualizer {
    fn visualize(&self, producer: &str, collection: &DataCollection) {
        self.visualized.fetch_add(1, Ordering::Relaxed);
        for tagged in &collection.tagged {
            tracing::info!(
                "[{}] {}: {} element(s){}",
                producer,
                tagged.pin,
                tagged.data.element_count(),
                if tagged.data.is_gpu_resident() { " (gpu)" } else { "" }
            );
        }
    }
}

/// CPU copy of an output collection, built for debug and inspection.
///
/// GPU-resident items are read back from the exported arena; the collection
/// is ready once every one of them has arrived.
#[derive(Debug)]
pub struct DebugPreparation {
    collection: DataCollection,
    pending: BTreeSet<u32>,
    requested: bool,
}

impl DebugPreparation {
    pub fn new(collection: DataCollection) -> Self {
        Self {
            collection,
            pending: BTreeSet::new(),
            requested: false,
        }
    }

    /// Request readbacks for GPU-resident items, the first time only.
    /// Returns true once the collection is fully CPU-resident.
    pub fn poll(
        &mut self,
        binding: &DataBinding,
        readbacks: &ReadbackChannel,
        exported: &SharedExportedArena,
    ) -> bool {
        if !self.requested {
            self.requested = true;
            for (slot, tagged) in self.collection.tagged.iter().enumerate() {
                let PcgData::GpuResident(gpu) = &tagged.data else {
                    continue;
                };
                let Some(provider) = binding
                    .graph()
                    .pin_id(&tagged.pin)
                    .and_then(|pin| binding.provider(pin.into()))
                else {
                    continue;
                };

                let slot = slot as u32;
                self.pending.insert(slot);
                let request = readbacks.readback(
                    provider.id(),
                    provider.generation_cell(),
                    ReadbackSource::Exported {
                        arena: Arc::clone(exported),
                        handle: gpu.handle,
                    },
                    ReadbackKind::Debug { slot },
                );
                readbacks.request(request);
            }
        }
        self.is_ready()
    }

    pub fn on_readback(&mut self, slot: u32, bytes: Vec<u8>) {
        if !self.pending.remove(&slot) {
            return;
        }
        if let Some(tagged) = self.collection.tagged.get_mut(slot as usize) {
            if let PcgData::GpuResident(gpu) = &tagged.data {
                tagged.data = gpu.to_cpu(bytes);
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.requested && self.pending.is_empty()
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn collection(&self) -> &DataCollection {
        &self.collection
    }

    pub fn into_collection(self) -> DataCollection {
        self.collection
    }
}
