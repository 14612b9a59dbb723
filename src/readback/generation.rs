use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Snapshot of a provider's generation counter.
///
/// Drawn from a process-wide counter, so a value is never reused by any
/// provider for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    pub fn next() -> Self {
        Generation(NEXT_GENERATION.fetch_add(1, Ordering::SeqCst))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Live generation of a provider, shared with render-side continuations.
///
/// Continuations capture a [`Generation`] when they are created and compare
/// it against the cell before touching anything the provider owns.
#[derive(Debug, Clone)]
pub struct GenerationCell(Arc<AtomicU64>);

impl GenerationCell {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(Generation::next().0)))
    }

    pub fn get(&self) -> Generation {
        Generation(self.0.load(Ordering::SeqCst))
    }

    /// Move to a fresh generation, invalidating every outstanding snapshot.
    pub fn advance(&self) -> Generation {
        let next = Generation::next();
        self.0.store(next.0, Ordering::SeqCst);
        next
    }

    pub fn matches(&self, generation: Generation) -> bool {
        self.get() == generation
    }
}

impl Default for GenerationCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_advance_invalidates_snapshot() {
        let cell = GenerationCell::new();
        let snapshot = cell.get();
        assert!(cell.matches(snapshot));

        let next = cell.advance();
        assert!(!cell.matches(snapshot));
        assert!(cell.matches(next));
        assert!(next > snapshot);
    }

    #[test]
    fn test_clones_share_state() {
        let cell = GenerationCell::new();
        let render_side = cell.clone();
        let snapshot = render_side.get();
        cell.advance();
        assert!(!render_side.matches(snapshot));
    }

    proptest! {
        #[test]
        fn test_generations_strictly_increase(advances in 1usize..64) {
            let cell = GenerationCell::new();
            let mut last = cell.get();
            for _ in 0..advances {
                let next = cell.advance();
                prop_assert!(next > last);
                last = next;
            }
        }
    }
}
