//! One-shot background work with a pollable result.

use crate::error::{PcgError, Result};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Where a [`BackgroundTask`] runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskMode {
    /// Run on the calling thread when spawned
    Inline,
    /// Run on a named worker thread
    #[default]
    Threaded,
}

/// A unit of work reporting its result through a one-shot channel.
#[derive(Debug)]
pub struct BackgroundTask<T> {
    name: String,
    rx: Receiver<Result<T>>,
    handle: Option<JoinHandle<()>>,
    finished: bool,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn spawn<F>(name: impl Into<String>, mode: TaskMode, f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = bounded(1);

        let handle = match mode {
            TaskMode::Inline => {
                let _ = tx.send(f());
                None
            }
            TaskMode::Threaded => {
                let job = Arc::new(Mutex::new(Some(f)));
                let worker_job = Arc::clone(&job);
                let worker_tx = tx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("pcg-{}", name))
                    .spawn(move || {
                        if let Some(f) = worker_job.lock().ok().and_then(|mut j| j.take()) {
                            let _ = worker_tx.send(f());
                        }
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        tracing::warn!("Failed to spawn background task '{}', running inline: {}", name, e);
                        if let Some(f) = job.lock().ok().and_then(|mut j| j.take()) {
                            let _ = tx.send(f());
                        }
                        None
                    }
                }
            }
        };

        Self {
            name,
            rx,
            handle,
            finished: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The task's result, once. `None` while it is still running.
    pub fn poll(&mut self) -> Option<Result<T>> {
        if self.finished {
            return None;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.finished = true;
                self.reap();
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.finished = true;
                self.reap();
                Some(Err(PcgError::TaskPanicked(self.name.clone())))
            }
        }
    }

    /// Block until the task finishes.
    pub fn join(mut self) -> Result<T> {
        let result = self
            .rx
            .recv()
            .unwrap_or_else(|_| Err(PcgError::TaskPanicked(self.name.clone())));
        self.finished = true;
        self.reap();
        result
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn reap(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Background task '{}' panicked", self.name);
            }
        }
    }
}

impl<T> Drop for BackgroundTask<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
