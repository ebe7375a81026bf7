//! In-arena object layout
//!
//! An object occupies a run of 8-byte words:
//!
//! ```text
//! word 0:  id (64 bits)
//! word 1:  type (32) | payload_size (17) | num_references (15)
//! word 2..2+r:  reference ids, one per word
//! then:    data bytes, zero-padded to a word boundary
//! ```
//!
//! `payload_size` counts references plus data, so the data portion is
//! `payload_size - 8 * num_references` bytes. The total payload is capped at
//! 64 KiB inclusive; the packed field is one bit wider than 16 so the cap is
//! representable exactly.
//!
//! Objects are immutable once published at an offset: an update allocates a
//! whole new object and redirects the locator.

use crate::error::{Result, TesseraError};
use crate::types::{ObjectId, TypeId, MAX_OBJECT_PAYLOAD, MAX_REFERENCES, WORD_SIZE};
use serde::{Deserialize, Serialize};

/// Words occupied by the object header.
pub const HEADER_WORDS: usize = 2;

const PAYLOAD_SIZE_SHIFT: u32 = 32;
const PAYLOAD_SIZE_BITS: u32 = 17;
const PAYLOAD_SIZE_MASK: u64 = (1 << PAYLOAD_SIZE_BITS) - 1;
const NUM_REFS_SHIFT: u32 = PAYLOAD_SIZE_SHIFT + PAYLOAD_SIZE_BITS;

/// Fixed object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    /// User-visible object identity.
    pub id: ObjectId,
    /// Object type.
    pub type_id: TypeId,
    /// References plus data, in bytes.
    pub payload_size: u32,
    /// Number of leading 8-byte reference slots in the payload.
    pub num_references: u16,
}

impl ObjectHeader {
    /// Validate and build a header for `num_references` references followed
    /// by `data_size` bytes of data.
    pub fn build(
        id: ObjectId,
        type_id: TypeId,
        num_references: usize,
        data_size: usize,
    ) -> Result<ObjectHeader> {
        if num_references > MAX_REFERENCES {
            return Err(TesseraError::resource("object reference slots"));
        }
        let payload_size = data_size + num_references * WORD_SIZE;
        if payload_size > MAX_OBJECT_PAYLOAD {
            return Err(TesseraError::resource("object payload bytes"));
        }
        Ok(ObjectHeader {
            id,
            type_id,
            payload_size: payload_size as u32,
            num_references: num_references as u16,
        })
    }

    /// Data portion of the payload, in bytes.
    pub fn data_size(&self) -> usize {
        self.payload_size as usize - self.num_references as usize * WORD_SIZE
    }

    /// Total words occupied by the object, header included.
    pub fn total_words(&self) -> usize {
        let data_words = (self.data_size() + WORD_SIZE - 1) / WORD_SIZE;
        HEADER_WORDS + self.num_references as usize + data_words
    }

    /// Pack into the two header words.
    pub fn pack(&self) -> [u64; HEADER_WORDS] {
        debug_assert!(self.payload_size as u64 <= PAYLOAD_SIZE_MASK);
        debug_assert!((self.num_references as usize) <= MAX_REFERENCES);
        let word1 = self.type_id.get() as u64
            | ((self.payload_size as u64) << PAYLOAD_SIZE_SHIFT)
            | ((self.num_references as u64) << NUM_REFS_SHIFT);
        [self.id.get(), word1]
    }

    /// Unpack from the two header words.
    pub fn unpack(words: [u64; HEADER_WORDS]) -> ObjectHeader {
        let word1 = words[1];
        ObjectHeader {
            id: ObjectId::new(words[0]),
            type_id: TypeId::new(word1 as u32),
            payload_size: ((word1 >> PAYLOAD_SIZE_SHIFT) & PAYLOAD_SIZE_MASK) as u32,
            num_references: (word1 >> NUM_REFS_SHIFT) as u16,
        }
    }
}

/// An owned copy of an object, read out of the arena.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    /// The fixed header.
    pub header: ObjectHeader,
    /// Reference slots; `ObjectId::ZERO` marks an empty slot.
    pub references: Vec<ObjectId>,
    /// The data portion of the payload.
    pub data: Vec<u8>,
}

impl Object {
    /// Build a new object value, validating sizes.
    pub fn new(
        id: ObjectId,
        type_id: TypeId,
        references: Vec<ObjectId>,
        data: Vec<u8>,
    ) -> Result<Object> {
        let header = ObjectHeader::build(id, type_id, references.len(), data.len())?;
        Ok(Object {
            header,
            references,
            data,
        })
    }

    /// The object's id.
    pub fn id(&self) -> ObjectId {
        self.header.id
    }

    /// The object's type.
    pub fn type_id(&self) -> TypeId {
        self.header.type_id
    }

    /// Whether every reference slot is empty.
    pub fn is_disconnected(&self) -> bool {
        self.references.iter().all(|r| !r.is_valid())
    }
}
