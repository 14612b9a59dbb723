use super::generation::Generation;
use crate::gpu::ExportHandle;
use crate::id::ProviderId;
use crossbeam_channel::{unbounded, Receiver, Sender};

/// What a readback was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadbackKind {
    /// GPU-resident input item `slot` needed before descriptions are primed
    PreExecute { slot: u32 },
    /// Element counter written by the dispatch
    Counter,
    /// Output data read back after the dispatch
    Output,
    /// GPU-resident output item `slot` read back for debug and inspection
    Debug { slot: u32 },
}

/// Message posted from the render side to the executor's thread.
#[derive(Debug, Clone, PartialEq)]
pub enum MainThreadMessage {
    ReadbackComplete {
        provider: ProviderId,
        generation: Generation,
        kind: ReadbackKind,
        bytes: Vec<u8>,
        counter: Option<u32>,
    },
    ExportComplete {
        provider: ProviderId,
        generation: Generation,
        handle: ExportHandle,
    },
    /// The submission pipeline failed after the dispatch was accepted
    SubmitFailed { reason: String },
    /// A render-side continuation could not read its source
    AsyncFailure {
        provider: ProviderId,
        generation: Generation,
        reason: String,
    },
}

impl MainThreadMessage {
    /// Provider and generation the message is tagged with, if any
    pub fn tag(&self) -> Option<(ProviderId, Generation)> {
        match self {
            MainThreadMessage::ReadbackComplete {
                provider,
                generation,
                ..
            }
            | MainThreadMessage::ExportComplete {
                provider,
                generation,
                ..
            }
            | MainThreadMessage::AsyncFailure {
                provider,
                generation,
                ..
            } => Some((*provider, *generation)),
            MainThreadMessage::SubmitFailed { .. } => None,
        }
    }
}

/// Single-consumer queue drained by the executor once per tick.
#[derive(Debug)]
pub struct MainThreadQueue {
    sender: Sender<MainThreadMessage>,
    receiver: Receiver<MainThreadMessage>,
}

impl MainThreadQueue {
    pub fn new() -> Self {
        let (sender, receiver) = unbounded();
        Self { sender, receiver }
    }

    pub fn sender(&self) -> MainThreadSender {
        MainThreadSender(self.sender.clone())
    }

    /// Take every message posted so far
    pub fn drain(&self) -> Vec<MainThreadMessage> {
        self.receiver.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl Default for MainThreadQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable producer side of a [`MainThreadQueue`].
#[derive(Debug, Clone)]
pub struct MainThreadSender(Sender<MainThreadMessage>);

impl MainThreadSender {
    /// Post a message. Returns false if the executor is gone.
    pub fn send(&self, message: MainThreadMessage) -> bool {
        match self.0.send(message) {
            Ok(()) => true,
            Err(_) => {
                tracing::trace!("Main thread queue closed, message dropped");
                false
            }
        }
    }
}
