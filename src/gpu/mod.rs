//! Simulated render backend.
//!
//! The orchestrator never talks to a device directly. It allocates through
//! a [`ResourceArena`], records work as [`ComputeWork`] and submits it
//! through the [`ComputeScheduler`] seam. [`SimulatedScheduler`] runs that
//! work on a [`RenderQueue`], which stands in for the render thread.

pub mod arena;
pub mod render_queue;
pub mod scheduler;

pub use arena::{
    lock, DeviceBudget, ExportHandle, ExportedArena, GpuResource, ResourceArena, ResourceDesc,
    SharedArena, SharedExportedArena,
};
pub use render_queue::{RenderCommand, RenderQueue};
pub use scheduler::{
    BoundPin, ComputeScheduler, ComputeWork, KernelBinding, KernelIo, SimulatedScheduler,
    SubmitFailureCallback, WorkOutcome,
};

#[cfg(test)]
pub use scheduler::MockComputeScheduler;
