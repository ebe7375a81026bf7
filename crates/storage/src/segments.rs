//! Segment bundle and geometry
//!
//! The server creates the shared segments once and hands them to sessions:
//! the data segment (counters + id index + arena, always mapped shared) and
//! the locator table (read through per-transaction views).

use crate::arena::DataArena;
use crate::counters::Counters;
use crate::id_index::IdIndex;
use std::sync::Arc;
use tessera_core::{DEFAULT_ARENA_WORDS, DEFAULT_MAX_LOCATORS};

/// Sizing for the shared segments.
#[derive(Debug, Clone, Copy)]
pub struct SegmentGeometry {
    /// Number of locator slots (also the id-index overflow capacity).
    pub max_locators: usize,
    /// Arena capacity in 8-byte words.
    pub arena_words: usize,
}

impl Default for SegmentGeometry {
    fn default() -> Self {
        SegmentGeometry {
            max_locators: DEFAULT_MAX_LOCATORS,
            arena_words: DEFAULT_ARENA_WORDS,
        }
    }
}

impl SegmentGeometry {
    /// A small geometry for tests: a few thousand locators and a few
    /// megabytes of arena.
    pub fn small() -> SegmentGeometry {
        SegmentGeometry {
            max_locators: 4096,
            arena_words: 1 << 18,
        }
    }
}

/// The shared data segment: counters, id index, and object arena.
#[derive(Debug)]
pub struct DataSegment {
    /// The four shared allocation counters.
    pub counters: Counters,
    /// The id → locator index.
    pub id_index: IdIndex,
    /// The append-only object region. Shared separately so memory managers
    /// and stack allocators can hold it without the whole segment.
    pub arena: Arc<DataArena>,
}

impl DataSegment {
    /// Create a zeroed data segment with the given geometry.
    pub fn new(geometry: SegmentGeometry) -> DataSegment {
        DataSegment {
            counters: Counters::new(),
            id_index: IdIndex::new(geometry.max_locators),
            arena: Arc::new(DataArena::new(geometry.arena_words)),
        }
    }

    /// Clear all contents. Only valid while no sessions are attached.
    pub fn clear(&self) {
        self.id_index.clear();
        self.arena.reset();
        self.counters.reset_identity_counters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_geometry_matches_constants() {
        let geometry = SegmentGeometry::default();
        assert_eq!(geometry.max_locators, DEFAULT_MAX_LOCATORS);
        assert_eq!(geometry.arena_words, DEFAULT_MAX_LOCATORS * 8);
    }

    #[test]
    fn segment_construction_and_allocation() {
        let segment = DataSegment::new(SegmentGeometry::small());
        let locator = segment.counters.allocate_locator(4096).unwrap();
        assert!(locator.is_valid());
        let offset = segment.arena.allocate(64).unwrap();
        assert!(offset.is_valid());
    }
}
