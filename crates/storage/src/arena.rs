//! The append-only data arena
//!
//! A single word-addressed region holding every object version ever
//! published. The first word is the allocation counter: allocating `n` words
//! bumps it atomically, and the returned offset is `1 + old_count`, so offset
//! zero is never a valid object location. Offsets never move and the region
//! never shrinks; slack left by aborted transactions is reclaimed only by the
//! watermark.
//!
//! Writes go word-by-word with relaxed ordering; publication happens through
//! the locator store (release) that makes the object reachable, and readers
//! load the locator with acquire before touching the words. Offsets read
//! from shared memory are treated as untrusted: every dereference is bound
//! checked first.

use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::object::HEADER_WORDS;
use tessera_core::{
    ArenaOffset, Object, ObjectHeader, ObjectId, Result, TesseraError, MAX_OBJECT_PAYLOAD,
    WORD_SIZE,
};

/// The shared object region.
pub struct DataArena {
    words: Box<[AtomicU64]>,
}

impl DataArena {
    /// Create an arena with `capacity_words` 8-byte words (including the
    /// counter word at offset zero).
    pub fn new(capacity_words: usize) -> DataArena {
        assert!(capacity_words > 1, "arena must hold more than the counter");
        let mut words = Vec::with_capacity(capacity_words);
        words.resize_with(capacity_words, || AtomicU64::new(0));
        DataArena {
            words: words.into_boxed_slice(),
        }
    }

    /// Total capacity in words.
    pub fn capacity_words(&self) -> usize {
        self.words.len()
    }

    /// Words allocated so far (not counting the counter word).
    pub fn used_words(&self) -> u64 {
        self.words[0].load(Ordering::Acquire)
    }

    /// Abandon every allocation. Only valid while no sessions are attached;
    /// object words are left in place, unreachable.
    pub fn reset(&self) {
        self.words[0].store(0, Ordering::Release);
    }

    /// Allocate `size_bytes` rounded up to whole words; returns the offset
    /// of the first word.
    pub fn allocate(&self, size_bytes: usize) -> Result<ArenaOffset> {
        let needed = (size_bytes + WORD_SIZE - 1) / WORD_SIZE;
        let capacity = self.words.len() as u64;
        let mut used = self.words[0].load(Ordering::Acquire);
        loop {
            if 1 + used + needed as u64 > capacity {
                return Err(TesseraError::resource("arena words"));
            }
            match self.words[0].compare_exchange_weak(
                used,
                used + needed as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(ArenaOffset::new(1 + used)),
                Err(actual) => used = actual,
            }
        }
    }

    fn check_range(&self, offset: ArenaOffset, len_words: usize) -> Result<usize> {
        let start = offset.get() as usize;
        if offset.is_valid() && start.checked_add(len_words).is_some_and(|end| end <= self.words.len())
        {
            Ok(start)
        } else {
            Err(TesseraError::protocol(format!(
                "arena offset {offset} out of bounds for {len_words} words"
            )))
        }
    }

    /// Read one word. Bound checked.
    pub fn load_word(&self, offset: ArenaOffset) -> Result<u64> {
        let start = self.check_range(offset, 1)?;
        Ok(self.words[start].load(Ordering::Acquire))
    }

    /// Store one word. Bound checked.
    pub fn store_word(&self, offset: ArenaOffset, value: u64) -> Result<()> {
        let start = self.check_range(offset, 1)?;
        self.words[start].store(value, Ordering::Release);
        Ok(())
    }

    fn store_words(&self, start: usize, values: impl Iterator<Item = u64>) {
        for (i, value) in values.enumerate() {
            self.words[start + i].store(value, Ordering::Relaxed);
        }
    }

    /// Write a whole object at `offset`. The range must have been allocated
    /// for exclusive use by the caller (a stack allocator region).
    pub fn write_object(&self, offset: ArenaOffset, object: &Object) -> Result<()> {
        let total = object.header.total_words();
        let start = self.check_range(offset, total)?;

        let header = object.header.pack();
        self.store_words(start, header.iter().copied());
        self.store_words(
            start + HEADER_WORDS,
            object.references.iter().map(|r| r.get()),
        );
        let data_start = start + HEADER_WORDS + object.references.len();
        self.store_words(data_start, object.data.chunks(WORD_SIZE).map(word_from_bytes));
        Ok(())
    }

    /// Read the object header at `offset`, validating it before use.
    pub fn read_header(&self, offset: ArenaOffset) -> Result<ObjectHeader> {
        let start = self.check_range(offset, HEADER_WORDS)?;
        let words = [
            self.words[start].load(Ordering::Acquire),
            self.words[start + 1].load(Ordering::Acquire),
        ];
        let header = ObjectHeader::unpack(words);
        if header.payload_size as usize > MAX_OBJECT_PAYLOAD
            || (header.num_references as usize) * WORD_SIZE > header.payload_size as usize
        {
            return Err(TesseraError::protocol(format!(
                "corrupt object header at arena offset {offset}"
            )));
        }
        Ok(header)
    }

    /// Read a whole object at `offset` into an owned value.
    pub fn read_object(&self, offset: ArenaOffset) -> Result<Object> {
        let header = self.read_header(offset)?;
        let start = self.check_range(offset, header.total_words())?;

        let refs_start = start + HEADER_WORDS;
        let references: Vec<ObjectId> = (0..header.num_references as usize)
            .map(|i| ObjectId::new(self.words[refs_start + i].load(Ordering::Relaxed)))
            .collect();

        let data_start = refs_start + header.num_references as usize;
        let data_size = header.data_size();
        let mut data = Vec::with_capacity(data_size);
        let mut remaining = data_size;
        let mut word_idx = data_start;
        while remaining > 0 {
            let word = self.words[word_idx].load(Ordering::Relaxed);
            let take = remaining.min(WORD_SIZE);
            data.extend_from_slice(&word.to_le_bytes()[..take]);
            remaining -= take;
            word_idx += 1;
        }

        Ok(Object {
            header,
            references,
            data,
        })
    }
}

impl std::fmt::Debug for DataArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataArena")
            .field("capacity_words", &self.capacity_words())
            .field("used_words", &self.used_words())
            .finish()
    }
}

fn word_from_bytes(chunk: &[u8]) -> u64 {
    let mut bytes = [0u8; WORD_SIZE];
    bytes[..chunk.len()].copy_from_slice(chunk);
    u64::from_le_bytes(bytes)
}
