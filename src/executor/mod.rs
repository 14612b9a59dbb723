//! The phased execution state machine.
//!
//! # Architecture
//!
//! ```text
//!  tick() ──► GetComputeGraph
//!              │ compiled graph for (top level, grid, index)
//!              ▼
//!             InitializeDataBindingAndComputeGraph
//!              │ pool checkout, providers, string table task
//!              ▼
//!             PreExecuteReadbacks ◄──────┐ GPU-resident inputs back to CPU
//!              ▼                         │ suspends until all arrive
//!             PrimeDataDescriptionsAndValidateData  (background task)
//!              ▼
//!             PrepareForExecute               allocate / upload per pin
//!              ▼
//!             ValidateComputeGraphCompilation shader status, compile messages
//!              ▼
//!             ScheduleComputeGraph ──enqueue_work──► render side
//!              ▼                                        │
//!             WaitForExecutionComplete ◄── exports, counters, submit failures
//!              ▼
//!             PostExecute                     output readbacks, output collection
//!              ▼
//!             DebugAndInspection              (debug or inspect requested)
//! ```
//!
//! Every phase either falls through to the next within the same `tick`, or
//! suspends until the next one. Main-thread messages are drained by the
//! phases that wait on the render side.

pub mod context;
pub mod orchestrator;
pub mod phase;
pub mod task;

pub use context::{ExecutionContext, ExecutionRequest, ExecutionStats, ExecutorServices};
pub use orchestrator::ComputeGraphExecutor;
pub use phase::{ExecutionFailure, Phase, PhaseResult};
pub use task::{BackgroundTask, TaskMode};
