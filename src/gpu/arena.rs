//! Resource storage for executions.
//!
//! Each execution owns a [`ResourceArena`] holding the transient resources
//! its providers allocate. Exporting a resource moves it out of the
//! execution arena into the process-wide [`ExportedArena`], where it lives
//! until the consumer releases it.

use crate::error::{PcgError, Result};
use crate::id::{ExportId, ResourceId};
use crate::readback::Generation;
use crate::types::DataKind;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Lock a shared structure, mapping poisoning to [`PcgError::LockPoisoned`].
pub fn lock<'a, T>(mutex: &'a Mutex<T>, what: &'static str) -> Result<MutexGuard<'a, T>> {
    mutex.lock().map_err(|_| PcgError::LockPoisoned { what })
}

/// Shape of a resource allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDesc {
    pub label: String,
    pub kind: DataKind,
    pub element_count: u32,
    /// Texture extent, when `kind` is a texture
    pub extent: Option<(u32, u32)>,
    pub attributes: Vec<String>,
}

impl ResourceDesc {
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.element_count) * u64::from(self.kind.element_size())
    }
}

/// A simulated device resource.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuResource {
    pub desc: ResourceDesc,
    pub bytes: Vec<u8>,
    /// Element count reported by the kernel that wrote the resource
    pub counter: Option<u32>,
}

impl GpuResource {
    /// Elements holding valid data: the counter if set, else the full allocation
    pub fn valid_elements(&self) -> u32 {
        self.counter
            .map(|c| c.min(self.desc.element_count))
            .unwrap_or(self.desc.element_count)
    }
}

/// Fraction of device memory a single allocation may use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceBudget {
    pub total_bytes: u64,
    pub fraction: f64,
}

impl DeviceBudget {
    pub fn new(total_bytes: u64, fraction: f64) -> Self {
        Self {
            total_bytes,
            fraction,
        }
    }

    pub fn budget_bytes(&self) -> u64 {
        (self.total_bytes as f64 * self.fraction.clamp(0.0, 1.0)) as u64
    }

    /// Reject a request larger than the budget.
    pub fn check(&self, pin: &str, requested: u64) -> Result<()> {
        let budget = self.budget_bytes();
        if requested > budget {
            tracing::warn!(
                "Allocation for pin '{}' rejected: {} bytes exceeds budget of {} bytes",
                pin,
                requested,
                budget
            );
            return Err(PcgError::ResourceBudget {
                pin: pin.to_string(),
                requested,
                budget,
            });
        }
        Ok(())
    }
}

/// Per-execution resource storage indexed by [`ResourceId`].
#[derive(Debug)]
pub struct ResourceArena {
    slots: Vec<Option<GpuResource>>,
    budget: DeviceBudget,
    allocated_bytes: u64,
}

pub type SharedArena = Arc<Mutex<ResourceArena>>;

impl ResourceArena {
    pub fn new(budget: DeviceBudget) -> Self {
        Self {
            slots: Vec::new(),
            budget,
            allocated_bytes: 0,
        }
    }

    pub fn shared(budget: DeviceBudget) -> SharedArena {
        Arc::new(Mutex::new(Self::new(budget)))
    }

    /// Allocate a zero-filled resource.
    pub fn allocate(&mut self, desc: ResourceDesc) -> Result<ResourceId> {
        let size = desc.size_bytes();
        self.budget.check(&desc.label, size)?;
        let bytes = vec![0u8; size as usize];
        Ok(self.insert(GpuResource {
            desc,
            bytes,
            counter: None,
        }))
    }

    /// Allocate a resource initialised from CPU bytes.
    ///
    /// `bytes` is truncated or zero-padded to the size of `desc`.
    pub fn upload(&mut self, desc: ResourceDesc, mut bytes: Vec<u8>) -> Result<ResourceId> {
        let size = desc.size_bytes();
        self.budget.check(&desc.label, size)?;
        bytes.resize(size as usize, 0);
        Ok(self.insert(GpuResource {
            desc,
            bytes,
            counter: None,
        }))
    }

    fn insert(&mut self, resource: GpuResource) -> ResourceId {
        self.allocated_bytes += resource.bytes.len() as u64;
        let id = ResourceId::from_index(self.slots.len());
        self.slots.push(Some(resource));
        id
    }

    pub fn get(&self, id: ResourceId) -> Result<&GpuResource> {
        self.slots
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| PcgError::Arena(format!("{} is not live", id)))
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Result<&mut GpuResource> {
        self.slots
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| PcgError::Arena(format!("{} is not live", id)))
    }

    /// Move a resource out of the arena.
    pub fn take(&mut self, id: ResourceId) -> Result<GpuResource> {
        let resource = self
            .slots
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or_else(|| PcgError::Arena(format!("{} is not live", id)))?;
        self.allocated_bytes -= resource.bytes.len() as u64;
        Ok(resource)
    }

    /// Drop every resource. Returns how many were live.
    pub fn release_all(&mut self) -> usize {
        let live = self.live_count();
        self.slots.clear();
        self.allocated_bytes = 0;
        live
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn budget(&self) -> DeviceBudget {
        self.budget
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }
}

/// Handle to an exported resource.
///
/// Carries the generation of the provider at the time the dispatch was
/// scheduled, so consumers can tell which execution produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExportHandle {
    pub id: ExportId,
    pub generation: Generation,
}

/// Process-wide storage for resources that outlive their execution.
///
/// Released slots are reused; the generation in an [`ExportHandle`] keeps a
/// handle to a recycled slot from resolving to the new resource.
#[derive(Debug, Default)]
pub struct ExportedArena {
    slots: Vec<Option<(Generation, GpuResource)>>,
    free: Vec<usize>,
}

pub type SharedExportedArena = Arc<Mutex<ExportedArena>>;

impl ExportedArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedExportedArena {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn insert(&mut self, generation: Generation, resource: GpuResource) -> ExportHandle {
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some((generation, resource));
                index
            }
            None => {
                self.slots.push(Some((generation, resource)));
                self.slots.len() - 1
            }
        };
        ExportHandle {
            id: ExportId::from_index(index),
            generation,
        }
    }

    pub fn get(&self, handle: ExportHandle) -> Option<&GpuResource> {
        match self.slots.get(handle.id.index()) {
            Some(Some((generation, resource))) if *generation == handle.generation => Some(resource),
            _ => None,
        }
    }

    /// Release an exported resource. Returns false if the handle was not live.
    pub fn release(&mut self, handle: ExportHandle) -> bool {
        if self.get(handle).is_none() {
            return false;
        }
        let index = handle.id.index();
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = None;
            self.free.push(index);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Slots ever allocated, live or free
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
