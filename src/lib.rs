//! # pcg-dispatch: Compute-graph execution orchestrator
//!
//! Turns a declarative graph of compute kernels into a scheduled dispatch
//! whose results may come back over many engine ticks. A
//! [`ComputeGraphExecutor`] walks an execution through ordered phases,
//! suspending whenever it has to wait on the render side, and hands back a
//! [`DataCollection`] once every output has been read back or exported.
//!
//! ## Architecture
//!
//! - **Executor**: the phased state machine, polled once per tick
//! - **Binding / Providers**: one provider per graph pin, owning that pin's
//!   transient resources for a single execution
//! - **Readback**: generation-guarded GPU→CPU transfers posted back to the
//!   executor's thread through a crossbeam channel
//! - **GPU**: a simulated render backend (resource arenas, render queue,
//!   scheduler) standing in for the engine
//! - **Debug**: visualization and inspection hooks over finished outputs
//!
//! ## Example
//!
//! ```ignore
//! use pcg_dispatch::{
//!     executor::{ComputeGraphExecutor, ExecutionRequest, ExecutorServices},
//!     gpu::{RenderQueue, SimulatedScheduler},
//!     graph::StaticGraphCompiler,
//! };
//!
//! let render = RenderQueue::threaded();
//! let compiler = Arc::new(StaticGraphCompiler::new());
//! compiler.register(&forest_graph(), GridSize::Cells(400), 0)?;
//!
//! let services = ExecutorServices::new(
//!     compiler,
//!     Arc::new(SimulatedScheduler::new(render.clone())),
//!     render,
//! );
//! let mut executor = ComputeGraphExecutor::new(services, ExecutionRequest::new("forest", 350.0));
//!
//! loop {
//!     match executor.tick() {
//!         PhaseResult::Suspended => continue,
//!         PhaseResult::Done(output) => break output,
//!         PhaseResult::Failed(failure) => return Err(failure.into()),
//!     }
//! }
//! ```

pub mod binding;
pub mod config;
pub mod debug;
pub mod description;
pub mod error;
pub mod executor;
pub mod gpu;
pub mod graph;
pub mod id;
pub mod pool;
pub mod provider;
pub mod readback;
pub mod types;

// Re-export commonly used types
pub use config::OrchestratorConfig;
pub use error::{PcgError, Result};
pub use executor::{
    ComputeGraphExecutor, ExecutionFailure, ExecutionRequest, ExecutorServices, Phase, PhaseResult,
};
pub use types::{DataCollection, GridSize, PcgData};
