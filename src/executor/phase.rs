use crate::error::PcgError;
use crate::types::DataCollection;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Execution phases, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    GetComputeGraph,
    InitializeDataBindingAndComputeGraph,
    PreExecuteReadbacks,
    PrimeDataDescriptionsAndValidateData,
    PrepareForExecute,
    ValidateComputeGraphCompilation,
    ScheduleComputeGraph,
    WaitForExecutionComplete,
    PostExecute,
    DebugAndInspection,
}

impl Phase {
    pub const ALL: [Phase; 10] = [
        Phase::GetComputeGraph,
        Phase::InitializeDataBindingAndComputeGraph,
        Phase::PreExecuteReadbacks,
        Phase::PrimeDataDescriptionsAndValidateData,
        Phase::PrepareForExecute,
        Phase::ValidateComputeGraphCompilation,
        Phase::ScheduleComputeGraph,
        Phase::WaitForExecutionComplete,
        Phase::PostExecute,
        Phase::DebugAndInspection,
    ];

    /// The phase that follows this one, if any
    pub fn next(self) -> Option<Phase> {
        let idx = Phase::ALL.iter().position(|p| *p == self)?;
        Phase::ALL.get(idx + 1).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::GetComputeGraph => "GetComputeGraph",
            Phase::InitializeDataBindingAndComputeGraph => "InitializeDataBindingAndComputeGraph",
            Phase::PreExecuteReadbacks => "PreExecuteReadbacks",
            Phase::PrimeDataDescriptionsAndValidateData => "PrimeDataDescriptionsAndValidateData",
            Phase::PrepareForExecute => "PrepareForExecute",
            Phase::ValidateComputeGraphCompilation => "ValidateComputeGraphCompilation",
            Phase::ScheduleComputeGraph => "ScheduleComputeGraph",
            Phase::WaitForExecutionComplete => "WaitForExecutionComplete",
            Phase::PostExecute => "PostExecute",
            Phase::DebugAndInspection => "DebugAndInspection",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why an execution stopped.
#[derive(Debug, Clone)]
pub struct ExecutionFailure {
    /// Phase that was running when the execution failed
    pub phase: Phase,
    pub error: Arc<PcgError>,
}

impl fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.phase, self.error)
    }
}

/// Outcome of polling the executor.
#[derive(Debug, Clone)]
pub enum PhaseResult {
    /// Waiting on the render side or a background task; poll again next tick
    Suspended,
    Done(DataCollection),
    Failed(ExecutionFailure),
}

impl PhaseResult {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PhaseResult::Suspended)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, PhaseResult::Done(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, PhaseResult::Failed(_))
    }

    pub fn output(&self) -> Option<&DataCollection> {
        match self {
            PhaseResult::Done(output) => Some(output),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&ExecutionFailure> {
        match self {
            PhaseResult::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}
