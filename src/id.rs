//! Identity types for the orchestrator.
//!
//! All IDs are newtypes over `u32` that serve as direct array indices
//! into their respective storage vectors, providing O(1) lookup.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! index_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u32);

        impl $name {
            pub const INVALID: $name = $name(u32::MAX);

            #[inline]
            pub fn is_valid(self) -> bool {
                self != Self::INVALID
            }

            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub fn from_index(index: usize) -> Self {
                Self(index as u32)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                if *self == Self::INVALID {
                    write!(f, concat!(stringify!($name), "(INVALID)"))
                } else {
                    write!(f, concat!(stringify!($name), "({})"), self.0)
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

index_id!(
    /// Index into `CompiledKernelGraph::kernels`.
    KernelId
);

index_id!(
    /// Index into `CompiledKernelGraph::pins`.
    PinId
);

index_id!(
    /// Index into a graph instance's provider list. Providers are created
    /// one per pin, so a provider shares its index with its pin.
    ProviderId
);

index_id!(
    /// Index into an execution's `ResourceArena`.
    ResourceId
);

index_id!(
    /// Index into the shared `ExportedArena`.
    ExportId
);

impl From<PinId> for ProviderId {
    fn from(pin: PinId) -> Self {
        ProviderId(pin.0)
    }
}
