//! Hand-written collaborators for integration tests
//!
//! The `mockall` mocks are only generated for unit tests, so integration
//! tests record calls through these instead.

use pcg_dispatch::debug::{DebugVisualizer, InspectionSnapshot, InspectionStore};
use pcg_dispatch::gpu::{ComputeScheduler, ComputeWork, SimulatedScheduler, SubmitFailureCallback};
use pcg_dispatch::types::{DataCollection, ExecutionGroup, SceneHandle};
use pcg_dispatch::{PcgError, Result};
use std::sync::{Arc, Mutex};

/// Scheduler that records every dispatch before forwarding it
pub struct RecordingScheduler {
    inner: Arc<SimulatedScheduler>,
    dispatches: Mutex<Vec<(String, SceneHandle, ExecutionGroup)>>,
}

impl RecordingScheduler {
    pub fn new(inner: Arc<SimulatedScheduler>) -> Self {
        Self {
            inner,
            dispatches: Mutex::new(Vec::new()),
        }
    }

    /// Debug names of the dispatches seen so far
    pub fn debug_names(&self) -> Vec<String> {
        self.dispatches
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _, _)| name.clone())
            .collect()
    }

    pub fn dispatches(&self) -> Vec<(String, SceneHandle, ExecutionGroup)> {
        self.dispatches.lock().unwrap().clone()
    }
}

impl ComputeScheduler for RecordingScheduler {
    fn enqueue_work(
        &self,
        work: ComputeWork,
        scene: SceneHandle,
        group: ExecutionGroup,
        debug_name: &str,
        on_submit_failure: SubmitFailureCallback,
    ) -> bool {
        self.dispatches
            .lock()
            .unwrap()
            .push((debug_name.to_string(), scene, group));
        self.inner
            .enqueue_work(work, scene, group, debug_name, on_submit_failure)
    }

    fn executes_inline(&self) -> bool {
        self.inner.executes_inline()
    }
}

/// Scheduler that fails every dispatch on the render side with `reason`
pub struct FailingScheduler {
    pub reason: String,
}

impl ComputeScheduler for FailingScheduler {
    fn enqueue_work(
        &self,
        _work: ComputeWork,
        _scene: SceneHandle,
        _group: ExecutionGroup,
        _debug_name: &str,
        on_submit_failure: SubmitFailureCallback,
    ) -> bool {
        on_submit_failure(self.reason.clone());
        true
    }
}

/// Inspection store keeping every snapshot, optionally refusing them
#[derive(Default)]
pub struct RecordingInspectionStore {
    snapshots: Mutex<Vec<InspectionSnapshot>>,
    refuse: bool,
}

impl RecordingInspectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that fails every `store` call
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::default()
        }
    }

    pub fn snapshots(&self) -> Vec<InspectionSnapshot> {
        self.snapshots.lock().unwrap().clone()
    }
}

impl InspectionStore for RecordingInspectionStore {
    fn store(&self, snapshot: InspectionSnapshot) -> Result<()> {
        if self.refuse {
            return Err(PcgError::Serialization("store is read-only".to_string()));
        }
        self.snapshots.lock().unwrap().push(snapshot);
        Ok(())
    }
}

/// Visualizer remembering what it was shown
#[derive(Default)]
pub struct RecordingVisualizer {
    shown: Mutex<Vec<(String, DataCollection)>>,
}

impl RecordingVisualizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shown(&self) -> Vec<(String, DataCollection)> {
        self.shown.lock().unwrap().clone()
    }
}

impl DebugVisualizer for RecordingVisualizer {
    fn visualize(&self, producer: &str, collection: &DataCollection) {
        self.shown
            .lock()
            .unwrap()
            .push((producer.to_string(), collection.clone()));
    }
}
