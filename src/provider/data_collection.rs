use super::{allocate_for, ProviderContext, ProviderState};
use crate::error::Result;

/// Provider for attribute-buffer pins.
///
/// Buffers are allocated synchronously, so preparation finishes on the
/// first poll unless the allocation is over budget.
#[derive(Debug)]
pub struct DataCollectionProvider {
    pub(super) state: ProviderState,
}

impl DataCollectionProvider {
    pub(super) fn new(state: ProviderState) -> Self {
        Self { state }
    }

    pub fn prepare_for_execute(&mut self, cx: &ProviderContext<'_>) -> Result<bool> {
        if self.state.resource.is_some() {
            return Ok(true);
        }

        let desc = cx.description(self.state.pin)?;
        let resource = allocate_for(
            self.state.direction,
            self.state.upload_bytes(),
            desc,
            cx.arena,
        )?;
        self.state.resource = Some(resource);
        Ok(true)
    }
}
