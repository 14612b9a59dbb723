//! Generation-guarded asynchronous GPU→CPU readback.
//!
//! # Protocol
//!
//! ```text
//! main thread                      render side
//! ───────────                      ───────────
//! snapshot Generation ──request──► live cell == snapshot?
//!                                    no  → discard silently
//!                                    yes → copy bytes out of the arena
//!                                          post MainThreadMessage
//! drain queue (once per tick) ◄─────────┘
//!   live cell == message generation?
//!     no  → count as stale, touch nothing
//!     yes → fan out to the provider, clear its pending entry
//! ```
//!
//! Exports follow the same shape: the render side moves the resource from
//! the execution arena into the [`ExportedArena`](crate::gpu::ExportedArena)
//! and posts the handle back.

mod generation;
mod message;

pub use generation::{Generation, GenerationCell};
pub use message::{MainThreadMessage, MainThreadQueue, MainThreadSender, ReadbackKind};

use crate::error::Result;
use crate::gpu::{lock, ExportHandle, RenderQueue, SharedArena, SharedExportedArena};
use crate::id::{ProviderId, ResourceId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where a readback copies its bytes from.
#[derive(Debug, Clone)]
pub enum ReadbackSource {
    /// A resource of the execution's own arena
    Arena {
        arena: SharedArena,
        resource: ResourceId,
    },
    /// A resource exported by an earlier execution
    Exported {
        arena: SharedExportedArena,
        handle: ExportHandle,
    },
}

impl ReadbackSource {
    /// Copy the valid bytes and counter out of the source.
    fn read(&self, kind: ReadbackKind) -> Result<(Vec<u8>, Option<u32>)> {
        let copy = |resource: &crate::gpu::GpuResource| {
            if kind == ReadbackKind::Counter {
                return (Vec::new(), resource.counter);
            }
            let valid = resource.valid_elements() as usize
                * resource.desc.kind.element_size() as usize;
            let end = valid.min(resource.bytes.len());
            (resource.bytes[..end].to_vec(), resource.counter)
        };

        match self {
            ReadbackSource::Arena { arena, resource } => {
                let arena = lock(arena, "resource arena")?;
                Ok(copy(arena.get(*resource)?))
            }
            ReadbackSource::Exported { arena, handle } => {
                let arena = lock(arena, "exported arena")?;
                let resource = arena.get(*handle).ok_or_else(|| {
                    crate::error::PcgError::Arena(format!("export {} is not live", handle.id))
                })?;
                Ok(copy(resource))
            }
        }
    }
}

/// Result of running a render-side continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Delivered,
    /// The provider's generation moved on; nothing was touched
    Stale,
    Failed,
}

/// A pending GPU→CPU transfer tied to a generation snapshot.
#[derive(Debug)]
pub struct ReadbackRequest {
    pub provider: ProviderId,
    pub generation: Generation,
    pub kind: ReadbackKind,
    live: GenerationCell,
    source: ReadbackSource,
    sender: MainThreadSender,
}

impl ReadbackRequest {
    /// Run the render-side half of the readback.
    pub fn complete(self) -> CompletionOutcome {
        if !self.live.matches(self.generation) {
            tracing::trace!(
                "Discarding stale {:?} readback for {} ({})",
                self.kind,
                self.provider,
                self.generation
            );
            return CompletionOutcome::Stale;
        }

        match self.source.read(self.kind) {
            Ok((bytes, counter)) => {
                self.sender.send(MainThreadMessage::ReadbackComplete {
                    provider: self.provider,
                    generation: self.generation,
                    kind: self.kind,
                    bytes,
                    counter,
                });
                CompletionOutcome::Delivered
            }
            Err(e) => {
                self.sender.send(MainThreadMessage::AsyncFailure {
                    provider: self.provider,
                    generation: self.generation,
                    reason: e.to_string(),
                });
                CompletionOutcome::Failed
            }
        }
    }
}

/// Render-side move of a resource into the exported arena.
#[derive(Debug)]
pub struct ExportRequest {
    pub provider: ProviderId,
    pub generation: Generation,
    live: GenerationCell,
    arena: SharedArena,
    resource: ResourceId,
    exported: SharedExportedArena,
    sender: MainThreadSender,
}

impl ExportRequest {
    pub fn complete(self) -> CompletionOutcome {
        if !self.live.matches(self.generation) {
            tracing::trace!(
                "Discarding stale export for {} ({})",
                self.provider,
                self.generation
            );
            return CompletionOutcome::Stale;
        }

        match self.move_to_exported() {
            Ok(_) => CompletionOutcome::Delivered,
            Err(e) => {
                self.sender.send(MainThreadMessage::AsyncFailure {
                    provider: self.provider,
                    generation: self.generation,
                    reason: e.to_string(),
                });
                CompletionOutcome::Failed
            }
        }
    }

    /// Move the resource and post its handle.
    ///
    /// The execution arena stays locked until the handle is posted, so a
    /// teardown that releases the arena either finds the handle queued or
    /// leaves nothing to move.
    fn move_to_exported(&self) -> Result<ExportHandle> {
        let mut arena = lock(&self.arena, "resource arena")?;
        let resource = arena.take(self.resource)?;
        let handle = lock(&self.exported, "exported arena")?.insert(self.generation, resource);
        self.sender.send(MainThreadMessage::ExportComplete {
            provider: self.provider,
            generation: self.generation,
            handle,
        });
        drop(arena);
        Ok(handle)
    }
}

/// A continuation a provider contributes to the compute work.
#[derive(Debug)]
pub enum Completion {
    Readback(ReadbackRequest),
    Export(ExportRequest),
}

impl Completion {
    pub fn complete(self) -> CompletionOutcome {
        match self {
            Completion::Readback(request) => request.complete(),
            Completion::Export(request) => request.complete(),
        }
    }

    pub fn provider(&self) -> ProviderId {
        match self {
            Completion::Readback(request) => request.provider,
            Completion::Export(request) => request.provider,
        }
    }
}

/// Issues readbacks onto the render queue on behalf of providers.
#[derive(Debug, Clone)]
pub struct ReadbackChannel {
    render: RenderQueue,
    sender: MainThreadSender,
    issued: Arc<AtomicU64>,
}

impl ReadbackChannel {
    pub fn new(render: RenderQueue, sender: MainThreadSender) -> Self {
        Self {
            render,
            sender,
            issued: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Build a readback tagged with the provider's current generation.
    pub fn readback(
        &self,
        provider: ProviderId,
        live: &GenerationCell,
        source: ReadbackSource,
        kind: ReadbackKind,
    ) -> ReadbackRequest {
        ReadbackRequest {
            provider,
            generation: live.get(),
            kind,
            live: live.clone(),
            source,
            sender: self.sender.clone(),
        }
    }

    /// Build an export tagged with the provider's current generation.
    pub fn export(
        &self,
        provider: ProviderId,
        live: &GenerationCell,
        arena: &SharedArena,
        resource: ResourceId,
        exported: &SharedExportedArena,
    ) -> ExportRequest {
        ExportRequest {
            provider,
            generation: live.get(),
            live: live.clone(),
            arena: Arc::clone(arena),
            resource,
            exported: Arc::clone(exported),
            sender: self.sender.clone(),
        }
    }

    /// Enqueue a readback on the render queue.
    pub fn request(&self, request: ReadbackRequest) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.render.enqueue(move || {
            request.complete();
        });
    }

    /// Readbacks enqueued through this channel
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn render(&self) -> &RenderQueue {
        &self.render
    }

    pub fn sender(&self) -> &MainThreadSender {
        &self.sender
    }
}
