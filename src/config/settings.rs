//! Scheduling and debug settings carried by [`OrchestratorConfig`](super::OrchestratorConfig).

use crate::types::ExecutionGroup;
use serde::{Deserialize, Serialize};

/// How dispatches are submitted to the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingSettings {
    /// Execution group every dispatch is enqueued in
    pub execution_group: ExecutionGroup,

    /// Prefix of the debug name passed with each dispatch
    pub debug_name_prefix: String,
}

impl Default for SchedulingSettings {
    fn default() -> Self {
        Self {
            execution_group: ExecutionGroup::default(),
            debug_name_prefix: "PCG".to_string(),
        }
    }
}

impl SchedulingSettings {
    /// Debug name for a dispatch of `graph`
    pub fn debug_name(&self, graph: &str) -> String {
        if self.debug_name_prefix.is_empty() {
            graph.to_string()
        } else {
            format!("{}:{}", self.debug_name_prefix, graph)
        }
    }
}

/// Defaults for debug visualization and inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    /// Send outputs to the debug visualizer
    pub visualize: bool,

    /// Store outputs in the inspection store
    pub inspect: bool,

    /// Snapshots kept by the in-memory inspection store (0 = unlimited)
    pub max_snapshots: usize,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            visualize: false,
            inspect: false,
            max_snapshots: 64,
        }
    }
}

impl DebugSettings {
    pub fn any_enabled(&self) -> bool {
        self.visualize || self.inspect
    }
}
