//! Server-side memory grants
//!
//! Transactions allocate object versions out of stack-allocator regions
//! carved from the arena by the server. A session asks for memory at
//! transaction begin and again whenever its current region fills up
//! (`REQUEST_MEMORY` with a doubling size hint, capped at 1 MiB). Regions
//! belonging to aborted transactions return to a per-session free list;
//! regions of committed transactions simply stay part of the arena.

use crate::arena::DataArena;
use std::sync::Arc;
use tessera_core::{ArenaOffset, Result, MAX_MEMORY_REQUEST, STACK_ALLOCATOR_SIZE};

/// A contiguous byte range carved from the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// First word of the range.
    pub offset: ArenaOffset,
    /// Length in bytes (a multiple of the word size).
    pub size: u64,
}

impl MemoryRange {
    /// Length in words.
    pub fn size_words(&self) -> u64 {
        self.size / tessera_core::WORD_SIZE as u64
    }
}

/// Carves stack-allocator regions out of the arena.
#[derive(Debug)]
pub struct MemoryManager {
    arena: Arc<DataArena>,
}

impl MemoryManager {
    /// A manager over the shared arena.
    pub fn new(arena: Arc<DataArena>) -> MemoryManager {
        MemoryManager { arena }
    }

    /// Carve one fresh region of the standard size.
    pub fn carve(&self) -> Result<MemoryRange> {
        let offset = self.arena.allocate(STACK_ALLOCATOR_SIZE)?;
        Ok(MemoryRange {
            offset,
            size: region_size_bytes() as u64,
        })
    }

    /// Satisfy a memory request: reuse free-listed regions first, carve the
    /// rest. The hint is clamped to the 1 MiB request cap.
    pub fn grant(
        &self,
        free_list: &mut Vec<MemoryRange>,
        size_hint_bytes: usize,
    ) -> Result<Vec<MemoryRange>> {
        let hint = size_hint_bytes
            .max(STACK_ALLOCATOR_SIZE)
            .min(MAX_MEMORY_REQUEST);
        let count = (hint + STACK_ALLOCATOR_SIZE - 1) / STACK_ALLOCATOR_SIZE;
        let mut ranges = Vec::with_capacity(count);
        for _ in 0..count {
            match free_list.pop() {
                Some(range) => ranges.push(range),
                None => ranges.push(self.carve()?),
            }
        }
        Ok(ranges)
    }
}

/// Actual bytes in a standard region (whole words).
pub(crate) fn region_size_bytes() -> usize {
    let words = (STACK_ALLOCATOR_SIZE + tessera_core::WORD_SIZE - 1) / tessera_core::WORD_SIZE;
    words * tessera_core::WORD_SIZE
}
