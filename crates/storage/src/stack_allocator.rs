//! Per-transaction stack allocator
//!
//! A stack allocator manages one contiguous region carved from the arena.
//! Its metadata lives inside the region itself, so the server can load a
//! region a client allocated from and read the same records:
//!
//! ```text
//! base                                                           base+size
//! | allocation bytes, growing up ->   ...   <- records | next | count |
//! ```
//!
//! The last two words hold the bump cursor and the record count; allocation
//! records (four words each: slot, old offset, offset, size) grow downward
//! from just below them. Each record pairs the allocated offset with the
//! offset the slot held before, which is what rollback and reclamation need.
//! A deallocation writes a tombstone record (zero offset).

use crate::arena::DataArena;
use crate::memory_manager::MemoryRange;
use std::sync::Arc;
use tessera_core::{ArenaOffset, Locator, Result, TesseraError, WORD_SIZE};

const META_WORDS: u64 = 2;
const RECORD_WORDS: u64 = 4;

/// One allocation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRecord {
    /// The locator this allocation belongs to.
    pub slot: Locator,
    /// The offset the locator held before this allocation.
    pub old_offset: ArenaOffset,
    /// The allocated offset; zero for a deallocation tombstone.
    pub offset: ArenaOffset,
    /// Allocated length in words; zero for a tombstone.
    pub size_words: u64,
}

/// A stack allocator over one region of the arena.
#[derive(Debug, Clone)]
pub struct StackAllocator {
    arena: Arc<DataArena>,
    base: ArenaOffset,
    size_words: u64,
}

impl StackAllocator {
    /// Initialize a fresh region: zero the metadata and point the cursor at
    /// the base.
    pub fn initialize(arena: Arc<DataArena>, range: MemoryRange) -> Result<StackAllocator> {
        let this = StackAllocator::load(arena, range)?;
        this.write_meta(range.offset.get(), 0)?;
        Ok(this)
    }

    /// Attach to a region whose metadata was initialized elsewhere.
    pub fn load(arena: Arc<DataArena>, range: MemoryRange) -> Result<StackAllocator> {
        let size_words = range.size_words();
        if !range.offset.is_valid() || size_words < META_WORDS + RECORD_WORDS + 1 {
            return Err(TesseraError::protocol(format!(
                "stack allocator region at {} of {} bytes is unusable",
                range.offset, range.size
            )));
        }
        let this = StackAllocator {
            arena,
            base: range.offset,
            size_words,
        };
        // Touch the last word so a region beyond the arena fails here, not
        // on first allocation.
        this.arena.load_word(this.count_word())?;
        Ok(this)
    }

    /// The managed range.
    pub fn range(&self) -> MemoryRange {
        MemoryRange {
            offset: self.base,
            size: self.size_words * WORD_SIZE as u64,
        }
    }

    fn next_word(&self) -> ArenaOffset {
        ArenaOffset::new(self.base.get() + self.size_words - 2)
    }

    fn count_word(&self) -> ArenaOffset {
        ArenaOffset::new(self.base.get() + self.size_words - 1)
    }

    fn read_meta(&self) -> Result<(u64, u64)> {
        Ok((
            self.arena.load_word(self.next_word())?,
            self.arena.load_word(self.count_word())?,
        ))
    }

    fn write_meta(&self, next: u64, count: u64) -> Result<()> {
        self.arena.store_word(self.next_word(), next)?;
        self.arena.store_word(self.count_word(), count)
    }

    fn record_base(&self, number: u64) -> u64 {
        self.base.get() + self.size_words - META_WORDS - RECORD_WORDS * number
    }

    fn write_record(&self, number: u64, record: AllocationRecord) -> Result<()> {
        let at = self.record_base(number);
        self.arena.store_word(ArenaOffset::new(at), record.slot.get())?;
        self.arena
            .store_word(ArenaOffset::new(at + 1), record.old_offset.get())?;
        self.arena
            .store_word(ArenaOffset::new(at + 2), record.offset.get())?;
        self.arena
            .store_word(ArenaOffset::new(at + 3), record.size_words)
    }

    /// Read the `number`-th allocation record (numbers start at 1).
    pub fn allocation_record(&self, number: u64) -> Result<AllocationRecord> {
        let (_, count) = self.read_meta()?;
        if number == 0 || number > count {
            return Err(TesseraError::protocol(format!(
                "allocation record {number} out of range (count {count})"
            )));
        }
        let at = self.record_base(number);
        Ok(AllocationRecord {
            slot: Locator::new(self.arena.load_word(ArenaOffset::new(at))?),
            old_offset: ArenaOffset::new(self.arena.load_word(ArenaOffset::new(at + 1))?),
            offset: ArenaOffset::new(self.arena.load_word(ArenaOffset::new(at + 2))?),
            size_words: self.arena.load_word(ArenaOffset::new(at + 3))?,
        })
    }

    /// Number of records (allocations and tombstones) so far.
    pub fn allocation_count(&self) -> Result<u64> {
        Ok(self.read_meta()?.1)
    }

    fn push_record(&self, next: u64, count: u64, record: AllocationRecord) -> Result<()> {
        // One more record must still leave the cursor below the record area.
        let floor = self.record_base(count + 1);
        if next + record.size_words > floor {
            return Err(TesseraError::resource("stack allocator region"));
        }
        self.write_record(count + 1, record)?;
        self.write_meta(next + record.size_words, count + 1)
    }

    /// Allocate `size_bytes` for `slot`, recording the offset the slot held
    /// before. Returns the allocated offset.
    pub fn allocate(
        &self,
        slot: Locator,
        old_offset: ArenaOffset,
        size_bytes: usize,
    ) -> Result<ArenaOffset> {
        debug_assert!(size_bytes > 0, "use deallocate() for deletions");
        let words = ((size_bytes + WORD_SIZE - 1) / WORD_SIZE) as u64;
        let (next, count) = self.read_meta()?;
        self.push_record(
            next,
            count,
            AllocationRecord {
                slot,
                old_offset,
                offset: ArenaOffset::new(next),
                size_words: words,
            },
        )?;
        Ok(ArenaOffset::new(next))
    }

    /// Record a deallocation tombstone for `slot`.
    pub fn deallocate(&self, slot: Locator, old_offset: ArenaOffset) -> Result<()> {
        let (next, count) = self.read_meta()?;
        self.push_record(
            next,
            count,
            AllocationRecord {
                slot,
                old_offset,
                offset: ArenaOffset::ZERO,
                size_words: 0,
            },
        )
    }

    /// Roll back to the first `keep` records, releasing everything after.
    pub fn deallocate_to_count(&self, keep: u64) -> Result<()> {
        let (_, count) = self.read_meta()?;
        if keep > count {
            return Err(TesseraError::protocol(format!(
                "cannot keep {keep} of {count} allocations"
            )));
        }
        let mut next = self.base.get();
        for number in 1..=keep {
            let record = self.allocation_record(number)?;
            if record.offset.is_valid() {
                next = next.max(record.offset.get() + record.size_words);
            }
        }
        self.write_meta(next, keep)
    }
}
