//! Error handling for pcg-dispatch
//!
//! This module defines the error taxonomy of the orchestrator and a Result
//! alias for use throughout the crate.
//!
//! Stale async callbacks are deliberately absent from this enum: a readback
//! whose generation no longer matches is dropped and counted, never reported.

use crate::id::KernelId;
use thiserror::Error;

/// Main error type for pcg-dispatch operations
#[derive(Error, Debug)]
pub enum PcgError {
    /// No compiled graph exists for the requested key
    #[error("No compiled graph for '{graph}' (grid {grid}, index {graph_index})")]
    NoCompiledGraph {
        graph: String,
        grid: String,
        graph_index: u32,
    },

    /// The compiled graph declares settings that cannot be executed
    #[error("Invalid graph settings for '{0}'")]
    InvalidGraphSettings(String),

    /// Graph data failed validation against the primed descriptions
    #[error("Invalid graph data for '{0}'")]
    InvalidGraphData(String),

    /// A kernel reported a compilation error
    #[error("Kernel {kernel:?} failed to compile: {message}")]
    Compilation {
        kernel: Option<KernelId>,
        message: String,
    },

    /// Graph declaration could not be compiled into a kernel order
    #[error("Graph declaration error: {0}")]
    Declaration(String),

    /// The scheduler rejected the dispatch immediately
    #[error("Scheduler rejected dispatch '{0}'")]
    SubmissionRejected(String),

    /// The submission pipeline failed after the dispatch was accepted
    #[error("Dispatch submission failed: {0}")]
    SubmissionFailed(String),

    /// A resource request exceeded the device memory budget
    #[error("Allocation for pin '{pin}' of {requested} bytes exceeds budget of {budget} bytes")]
    ResourceBudget {
        pin: String,
        requested: u64,
        budget: u64,
    },

    /// A resource handle did not resolve in its arena
    #[error("Arena error: {0}")]
    Arena(String),

    /// An asynchronous render-side operation could not complete
    #[error("Async operation failed for provider {provider}: {reason}")]
    AsyncOperation { provider: u32, reason: String },

    /// A kernel program failed while executing
    #[error("Kernel '{kernel}' failed: {message}")]
    Kernel { kernel: String, message: String },

    /// A shared lock was poisoned by a panicking thread
    #[error("Lock poisoned: {what}")]
    LockPoisoned { what: &'static str },

    /// A background task panicked or was dropped before reporting
    #[error("Background task '{0}' did not complete")]
    TaskPanicked(String),

    /// The execution was cancelled by the caller
    #[error("Execution cancelled")]
    Cancelled,

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<PcgError>,
    },
}

impl PcgError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        PcgError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Strip any context wrappers and return the underlying error
    pub fn root(&self) -> &PcgError {
        match self {
            PcgError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error belongs to the configuration class (no retry helps)
    pub fn is_configuration(&self) -> bool {
        matches!(
            self.root(),
            PcgError::NoCompiledGraph { .. }
                | PcgError::InvalidGraphSettings(_)
                | PcgError::InvalidGraphData(_)
        )
    }
}

impl From<serde_json::Error> for PcgError {
    fn from(err: serde_json::Error) -> Self {
        PcgError::Serialization(err.to_string())
    }
}

/// Result type alias for pcg-dispatch operations
pub type Result<T> = std::result::Result<T, PcgError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PcgError::InvalidGraphSettings("forest".to_string());
        assert_eq!(err.to_string(), "Invalid graph settings for 'forest'");
    }

    #[test]
    fn test_error_with_context() {
        let err = PcgError::Arena("missing resource".to_string());
        let with_ctx = err.with_context("Failed to upload input");
        assert!(with_ctx.to_string().contains("Failed to upload input"));
        assert!(matches!(with_ctx.root(), PcgError::Arena(_)));
    }

    #[test]
    fn test_budget_error() {
        let err = PcgError::ResourceBudget {
            pin: "Points".to_string(),
            requested: 4096,
            budget: 1024,
        };
        assert!(err.to_string().contains("Points"));
        assert!(err.to_string().contains("4096"));
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_configuration_class_sees_through_context() {
        let err = PcgError::InvalidGraphData("g".into()).with_context("priming");
        assert!(err.is_configuration());
    }
}
