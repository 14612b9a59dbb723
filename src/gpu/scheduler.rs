//! Compute work submission.
//!
//! The executor hands a [`ComputeWork`] to a [`ComputeScheduler`]. The work
//! carries the kernel bindings in execution order, a generation guard for
//! every provider it touches, and the completions providers registered
//! (counter readbacks and exports) to run once the kernels finish.

use super::arena::{lock, GpuResource, ResourceArena, SharedArena};
use super::render_queue::RenderQueue;
use crate::error::{PcgError, Result};
use crate::graph::KernelProgram;
use crate::id::{KernelId, PinId, ResourceId};
use crate::readback::{Completion, CompletionOutcome, Generation, GenerationCell};
use crate::types::{ExecutionGroup, PinLabel, SceneHandle};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// A pin bound to the resource backing it for one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundPin {
    pub pin: PinId,
    pub label: PinLabel,
    pub resource: ResourceId,
}

/// A kernel with its pins resolved to resources.
#[derive(Clone)]
pub struct KernelBinding {
    pub kernel: KernelId,
    pub name: String,
    pub program: Arc<dyn KernelProgram>,
    pub reads: Vec<BoundPin>,
    pub writes: Vec<BoundPin>,
    pub max_elements: Option<u32>,
}

impl fmt::Debug for KernelBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelBinding")
            .field("kernel", &self.kernel)
            .field("name", &self.name)
            .field("reads", &self.reads)
            .field("writes", &self.writes)
            .finish()
    }
}

/// Access a kernel program has to its bound resources while it runs.
pub struct KernelIo<'a> {
    arena: &'a mut ResourceArena,
    binding: &'a KernelBinding,
}

impl<'a> KernelIo<'a> {
    pub fn new(arena: &'a mut ResourceArena, binding: &'a KernelBinding) -> Self {
        Self { arena, binding }
    }

    pub fn kernel_name(&self) -> &str {
        &self.binding.name
    }

    fn error(&self, message: String) -> PcgError {
        PcgError::Kernel {
            kernel: self.binding.name.clone(),
            message,
        }
    }

    fn bound(&self, pins: &[BoundPin], label: &str) -> Result<ResourceId> {
        pins.iter()
            .find(|b| b.label.as_str() == label)
            .map(|b| b.resource)
            .ok_or_else(|| self.error(format!("pin '{}' is not bound", label)))
    }

    pub fn input(&self, label: &str) -> Result<&GpuResource> {
        let id = self.bound(&self.binding.reads, label)?;
        self.arena.get(id)
    }

    /// Elements holding valid data on an input pin
    pub fn input_elements(&self, label: &str) -> Result<u32> {
        Ok(self.input(label)?.valid_elements())
    }

    /// Valid bytes of an input pin
    pub fn input_bytes(&self, label: &str) -> Result<&[u8]> {
        let resource = self.input(label)?;
        let end = resource.valid_elements() as usize * resource.desc.kind.element_size() as usize;
        Ok(&resource.bytes[..end.min(resource.bytes.len())])
    }

    pub fn input_f32s(&self, label: &str) -> Result<Vec<f32>> {
        Ok(self
            .input_bytes(label)?
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn output(&mut self, label: &str) -> Result<&mut GpuResource> {
        let id = self.bound(&self.binding.writes, label)?;
        self.arena.get_mut(id)
    }

    /// Elements the kernel may write to an output pin
    pub fn output_capacity(&mut self, label: &str) -> Result<u32> {
        let limit = self.binding.max_elements.unwrap_or(u32::MAX);
        Ok(self.output(label)?.desc.element_count.min(limit))
    }

    /// Texture extent of an output pin
    pub fn output_extent(&mut self, label: &str) -> Result<(u32, u32)> {
        let resource = self.output(label)?;
        resource
            .desc
            .extent
            .ok_or_else(|| PcgError::Arena(format!("pin '{}' is not a texture", label)))
    }

    /// Write bytes at the start of an output pin. Returns the elements written.
    pub fn write_bytes(&mut self, label: &str, bytes: &[u8]) -> Result<u32> {
        let capacity = self.output_capacity(label)?;
        let name = self.binding.name.clone();
        let resource = self.output(label)?;
        let element_size = resource.desc.kind.element_size().max(1) as usize;
        let capacity_bytes = capacity as usize * element_size;
        if bytes.len() > capacity_bytes {
            return Err(PcgError::Kernel {
                kernel: name,
                message: format!(
                    "wrote {} bytes to '{}' with capacity {}",
                    bytes.len(),
                    label,
                    capacity_bytes
                ),
            });
        }
        resource.bytes[..bytes.len()].copy_from_slice(bytes);
        Ok((bytes.len() / element_size) as u32)
    }

    pub fn write_f32s(&mut self, label: &str, values: &[f32]) -> Result<u32> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_bytes(label, &bytes)
    }

    /// Report how many elements of a counted output hold valid data.
    pub fn set_counter(&mut self, label: &str, count: u32) -> Result<()> {
        let capacity = self.output_capacity(label)?;
        self.output(label)?.counter = Some(count.min(capacity));
        Ok(())
    }
}

/// What happened to a piece of compute work on the render side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Completed {
        kernels: usize,
        completions_delivered: usize,
    },
    /// A provider's generation moved on before the work ran
    Discarded,
}

/// Kernels plus the continuations to run after them.
pub struct ComputeWork {
    pub name: String,
    arena: SharedArena,
    bindings: Vec<KernelBinding>,
    guards: Vec<(GenerationCell, Generation)>,
    completions: Vec<Completion>,
}

impl ComputeWork {
    pub fn new(name: impl Into<String>, arena: SharedArena) -> Self {
        Self {
            name: name.into(),
            arena,
            bindings: Vec::new(),
            guards: Vec::new(),
            completions: Vec::new(),
        }
    }

    pub fn add_kernel(&mut self, binding: KernelBinding) {
        self.bindings.push(binding);
    }

    /// Skip the whole work if `cell` advances before it runs.
    pub fn guard(&mut self, cell: &GenerationCell) {
        self.guards.push((cell.clone(), cell.get()));
    }

    pub fn add_completion(&mut self, completion: Completion) {
        self.completions.push(completion);
    }

    pub fn kernel_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn completion_count(&self) -> usize {
        self.completions.len()
    }

    pub fn is_current(&self) -> bool {
        self.guards.iter().all(|(cell, generation)| cell.matches(*generation))
    }

    /// Run the kernels in order, then the completions.
    pub fn execute(self) -> Result<WorkOutcome> {
        if !self.is_current() {
            tracing::trace!("Discarding stale compute work '{}'", self.name);
            return Ok(WorkOutcome::Discarded);
        }

        {
            let mut arena = lock(&self.arena, "resource arena")?;
            for binding in &self.bindings {
                let mut io = KernelIo::new(&mut arena, binding);
                binding.program.execute(&mut io)?;
            }
        }

        let kernels = self.bindings.len();
        let completions_delivered = self
            .completions
            .into_iter()
            .map(Completion::complete)
            .filter(|outcome| *outcome == CompletionOutcome::Delivered)
            .count();

        Ok(WorkOutcome::Completed {
            kernels,
            completions_delivered,
        })
    }
}

impl fmt::Debug for ComputeWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeWork")
            .field("name", &self.name)
            .field("kernels", &self.bindings.len())
            .field("completions", &self.completions.len())
            .finish()
    }
}

/// Invoked on the render side if an accepted dispatch fails to submit
pub type SubmitFailureCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Scheduling API the executor submits compute work through.
#[cfg_attr(test, mockall::automock)]
pub trait ComputeScheduler: Send + Sync {
    /// Enqueue work for dispatch. `false` means the work was rejected outright.
    fn enqueue_work(
        &self,
        work: ComputeWork,
        scene: SceneHandle,
        group: ExecutionGroup,
        debug_name: &str,
        on_submit_failure: SubmitFailureCallback,
    ) -> bool;

    /// Whether enqueued work has already run when `enqueue_work` returns.
    fn executes_inline(&self) -> bool {
        false
    }
}

/// [`ComputeScheduler`] that runs work on a [`RenderQueue`].
#[derive(Debug)]
pub struct SimulatedScheduler {
    queue: RenderQueue,
    reject_submissions: AtomicBool,
    fail_on_submit: AtomicBool,
    submitted: AtomicU64,
    kernels_dispatched: Arc<AtomicU64>,
}

impl SimulatedScheduler {
    pub fn new(queue: RenderQueue) -> Self {
        Self {
            queue,
            reject_submissions: AtomicBool::new(false),
            fail_on_submit: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            kernels_dispatched: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Reject every following `enqueue_work` call.
    pub fn set_reject_submissions(&self, reject: bool) {
        self.reject_submissions.store(reject, Ordering::SeqCst);
    }

    /// Accept work but fail it on the render side instead of running it.
    pub fn set_fail_on_submit(&self, fail: bool) {
        self.fail_on_submit.store(fail, Ordering::SeqCst);
    }

    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn kernels_dispatched(&self) -> u64 {
        self.kernels_dispatched.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &RenderQueue {
        &self.queue
    }
}

impl ComputeScheduler for SimulatedScheduler {
    fn enqueue_work(
        &self,
        work: ComputeWork,
        scene: SceneHandle,
        group: ExecutionGroup,
        debug_name: &str,
        on_submit_failure: SubmitFailureCallback,
    ) -> bool {
        if self.reject_submissions.load(Ordering::SeqCst) {
            tracing::warn!("Rejected dispatch '{}'", debug_name);
            return false;
        }

        self.submitted.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            "Enqueued dispatch '{}' ({} kernels) for scene {:?} in {:?}",
            debug_name,
            work.kernel_count(),
            scene,
            group
        );

        let fail = self.fail_on_submit.load(Ordering::SeqCst);
        let dispatched = Arc::clone(&self.kernels_dispatched);
        let name = debug_name.to_string();
        self.queue.enqueue(move || {
            if fail {
                on_submit_failure(format!("submission of '{}' failed", name));
                return;
            }
            match work.execute() {
                Ok(WorkOutcome::Completed { kernels, .. }) => {
                    dispatched.fetch_add(kernels as u64, Ordering::SeqCst);
                }
                Ok(WorkOutcome::Discarded) => {}
                Err(e) => {
                    tracing::error!("Dispatch '{}' failed: {}", name, e);
                    on_submit_failure(e.to_string());
                }
            }
        });

        true
    }

    fn executes_inline(&self) -> bool {
        self.queue.is_inline()
    }
}
