//! Render-side command queue.
//!
//! Commands enqueued here stand in for work recorded on the render thread:
//! kernel dispatches, readback copies and export moves. Three modes exist:
//!
//! - **inline**: commands run inside `enqueue`, on the caller's thread
//! - **deferred**: commands are held until [`RenderQueue::pump`] is called
//! - **threaded**: commands run in order on a dedicated render thread
//!
//! Commands must not enqueue further commands and then wait on them.

use crossbeam_channel::{bounded, unbounded, Sender};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A unit of render-side work
pub type RenderCommand = Box<dyn FnOnce() + Send + 'static>;

enum Mode {
    Inline,
    Deferred(Mutex<VecDeque<RenderCommand>>),
    Threaded {
        sender: Mutex<Option<Sender<RenderCommand>>>,
        thread: Mutex<Option<JoinHandle<()>>>,
    },
}

struct Inner {
    mode: Mode,
    executed: Arc<AtomicU64>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Mode::Threaded { sender, thread } = &self.mode {
            // Closing the channel ends the render loop once it drains
            if let Ok(mut sender) = sender.lock() {
                sender.take();
            }
            let handle = thread.lock().ok().and_then(|mut t| t.take());
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    tracing::error!("Render thread panicked");
                }
            }
        }
    }
}

/// Cloneable handle to a render command queue.
#[derive(Clone)]
pub struct RenderQueue {
    inner: Arc<Inner>,
}

impl RenderQueue {
    /// Commands run immediately inside `enqueue`.
    pub fn inline() -> Self {
        Self::with_mode(Mode::Inline)
    }

    /// Commands wait for an explicit [`pump`](Self::pump).
    pub fn deferred() -> Self {
        Self::with_mode(Mode::Deferred(Mutex::new(VecDeque::new())))
    }

    /// Commands run on a dedicated render thread.
    pub fn threaded() -> Self {
        let (tx, rx) = unbounded::<RenderCommand>();
        let executed = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&executed);

        let spawned = std::thread::Builder::new()
            .name("pcg-render".to_string())
            .spawn(move || {
                tracing::debug!("Render thread started");
                for command in rx.iter() {
                    command();
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                tracing::debug!("Render thread stopped");
            });

        match spawned {
            Ok(handle) => Self {
                inner: Arc::new(Inner {
                    mode: Mode::Threaded {
                        sender: Mutex::new(Some(tx)),
                        thread: Mutex::new(Some(handle)),
                    },
                    executed,
                }),
            },
            Err(e) => {
                tracing::error!("Failed to spawn render thread, running inline: {}", e);
                Self::inline()
            }
        }
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            inner: Arc::new(Inner {
                mode,
                executed: Arc::new(AtomicU64::new(0)),
            }),
        }
    }

    pub fn is_inline(&self) -> bool {
        matches!(self.inner.mode, Mode::Inline)
    }

    pub fn enqueue(&self, command: impl FnOnce() + Send + 'static) {
        match &self.inner.mode {
            Mode::Inline => {
                command();
                self.inner.executed.fetch_add(1, Ordering::Relaxed);
            }
            Mode::Deferred(queue) => match queue.lock() {
                Ok(mut queue) => queue.push_back(Box::new(command)),
                Err(_) => tracing::error!("Render queue lock poisoned, command dropped"),
            },
            Mode::Threaded { sender, .. } => {
                let sent = sender
                    .lock()
                    .ok()
                    .and_then(|s| s.as_ref().map(|s| s.send(Box::new(command)).is_ok()));
                if sent != Some(true) {
                    tracing::error!("Render thread gone, command dropped");
                }
            }
        }
    }

    /// Run every queued command of a deferred queue, including commands
    /// enqueued while pumping. Returns the number executed.
    pub fn pump(&self) -> usize {
        let Mode::Deferred(queue) = &self.inner.mode else {
            return 0;
        };

        let mut executed = 0;
        loop {
            // The lock is released before running the command
            let next = match queue.lock() {
                Ok(mut queue) => queue.pop_front(),
                Err(_) => None,
            };
            let Some(command) = next else {
                break;
            };
            command();
            executed += 1;
            self.inner.executed.fetch_add(1, Ordering::Relaxed);
        }
        executed
    }

    /// Block until everything enqueued so far has run.
    pub fn flush(&self) {
        match &self.inner.mode {
            Mode::Inline => {}
            Mode::Deferred(_) => {
                self.pump();
            }
            Mode::Threaded { .. } => {
                let (done_tx, done_rx) = bounded::<()>(1);
                self.enqueue(move || {
                    let _ = done_tx.send(());
                });
                let _ = done_rx.recv();
            }
        }
    }

    /// Commands queued but not yet run (deferred mode only)
    pub fn pending(&self) -> usize {
        match &self.inner.mode {
            Mode::Deferred(queue) => queue.lock().map(|q| q.len()).unwrap_or(0),
            _ => 0,
        }
    }

    /// Total commands executed by this queue
    pub fn executed(&self) -> u64 {
        self.inner.executed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RenderQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mode = match self.inner.mode {
            Mode::Inline => "inline",
            Mode::Deferred(_) => "deferred",
            Mode::Threaded { .. } => "threaded",
        };
        f.debug_struct("RenderQueue").field("mode", &mode).finish()
    }
}
