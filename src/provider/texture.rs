use super::{allocate_for, ProviderContext, ProviderState};
use crate::error::{PcgError, Result};
use crate::gpu::lock;
use crate::id::ResourceId;
use std::sync::{Arc, Mutex};

type AllocationSlot = Arc<Mutex<Option<Result<ResourceId>>>>;

/// Provider for texture pins.
///
/// Texture creation is recorded on the render queue, so preparation can take
/// several polls: the first issues the allocation, later ones pick up the
/// result once the render side has run it.
#[derive(Debug)]
pub struct TextureProvider {
    pub(super) state: ProviderState,
    pending_allocation: Option<AllocationSlot>,
}

impl TextureProvider {
    pub(super) fn new(state: ProviderState) -> Self {
        Self {
            state,
            pending_allocation: None,
        }
    }

    pub fn prepare_for_execute(&mut self, cx: &ProviderContext<'_>) -> Result<bool> {
        if self.state.resource.is_some() {
            return Ok(true);
        }

        if self.pending_allocation.is_none() {
            self.issue_allocation(cx)?;
        }
        self.take_allocation()
    }

    fn issue_allocation(&mut self, cx: &ProviderContext<'_>) -> Result<()> {
        let desc = cx.description(self.state.pin)?;

        // Over-budget requests fail on the main thread, before anything is recorded
        let budget = lock(cx.arena, "resource arena")?.budget();
        budget.check(desc.pin.as_str(), desc.size_bytes())?;

        let slot: AllocationSlot = Arc::new(Mutex::new(None));
        let render_slot = Arc::clone(&slot);
        let arena = Arc::clone(cx.arena);
        let live = self.state.generation.clone();
        let generation = live.get();
        let desc = desc.clone();
        let direction = self.state.direction;
        let bytes = self.state.upload_bytes();

        self.pending_allocation = Some(slot);
        cx.readbacks.render().enqueue(move || {
            if !live.matches(generation) {
                tracing::trace!("Discarding stale texture allocation for '{}'", desc.pin);
                return;
            }
            let result = allocate_for(direction, bytes, &desc, &arena);
            if let Ok(mut slot) = render_slot.lock() {
                *slot = Some(result);
            }
        });
        Ok(())
    }

    fn take_allocation(&mut self) -> Result<bool> {
        let Some(slot) = &self.pending_allocation else {
            return Ok(false);
        };
        let result = lock(slot, "texture allocation")?.take();
        match result {
            None => Ok(false),
            Some(Ok(resource)) => {
                self.state.resource = Some(resource);
                self.pending_allocation = None;
                Ok(true)
            }
            Some(Err(e)) => {
                self.pending_allocation = None;
                Err(PcgError::AsyncOperation {
                    provider: self.state.id.0,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Forget an allocation still in flight; its result is never picked up.
    pub(super) fn cancel_pending_allocation(&mut self) {
        self.pending_allocation = None;
    }
}
