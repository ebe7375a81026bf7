//! Identifier newtypes and system-wide constants
//!
//! Every identifier in Tessera is a dense integer allocated from a shared
//! counter. The newtypes here keep them from being mixed up at compile time:
//! - [`ObjectId`]: the user-visible 64-bit object identity
//! - [`TypeId`]: the 32-bit object type
//! - [`Locator`]: the stable integer naming an object over its lifetime
//! - [`ArenaOffset`]: a word index into the data arena
//! - [`Txid`]: a begin or commit timestamp (42 bits)
//! - [`Handle`]: a process-wide resource handle (the portable file descriptor)

use serde::{Deserialize, Serialize};

/// Number of bytes in an arena word.
pub const WORD_SIZE: usize = 8;

/// Number of hash buckets in the id index.
///
/// Prime, so that sequentially allocated ids spread evenly.
pub const HASH_BUCKETS: usize = 12_289;

/// Default number of locator slots (and id-index overflow nodes).
pub const DEFAULT_MAX_LOCATORS: usize = 32 * 128 * 1024;

/// Default arena size in words: 64 bytes on average per locator.
pub const DEFAULT_ARENA_WORDS: usize = DEFAULT_MAX_LOCATORS * 8;

/// Upper bound on records in a single transaction log.
pub const MAX_LOG_RECORDS: usize = 1 << 20;

/// Maximum total object payload (references plus data) in bytes.
pub const MAX_OBJECT_PAYLOAD: usize = 64 * 1024;

/// Maximum number of reference slots in one object
/// (follows from [`MAX_OBJECT_PAYLOAD`]).
pub const MAX_REFERENCES: usize = MAX_OBJECT_PAYLOAD / WORD_SIZE;

/// Number of bits in a timestamp; begin and commit timestamps share the space.
pub const TXID_BITS: u32 = 42;

/// Mask selecting the timestamp bits of a packed txn-info entry.
pub const TXID_MASK: u64 = (1 << TXID_BITS) - 1;

/// Maximum size of a session protocol message body in bytes.
pub const MAX_MSG_SIZE: usize = 4096;

/// Maximum number of handle attachments carried by one message.
pub const MAX_ATTACHMENTS: usize = 16;

/// Number of elements in one cursor stream batch.
pub const STREAM_BATCH_SIZE: usize = 1024;

/// Size of the stack allocator region granted at transaction begin.
///
/// A maximum-size object will not fit in exactly 64 KiB because the region
/// also holds allocation metadata, so a small surplus is added.
pub const STACK_ALLOCATOR_SIZE: usize = 64 * 1024 + 128;

/// Upper bound on a single memory grant requested by a client.
pub const MAX_MEMORY_REQUEST: usize = 1024 * 1024;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident, $repr:ty) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
            Serialize, Deserialize,
        )]
        pub struct $name($repr);

        impl $name {
            /// The reserved zero value.
            pub const ZERO: $name = $name(0);

            /// Wrap a raw value.
            pub const fn new(raw: $repr) -> Self {
                $name(raw)
            }

            /// The raw integer value.
            pub const fn get(self) -> $repr {
                self.0
            }

            /// Whether this is a real (nonzero) value; zero is reserved.
            pub const fn is_valid(self) -> bool {
                self.0 != 0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$repr> for $name {
            fn from(raw: $repr) -> Self {
                $name(raw)
            }
        }
    };
}

id_type!(
    /// User-visible 64-bit object identity, allocated from the shared
    /// `last_id` counter and mapped to a locator by the id index.
    ObjectId,
    u64
);

id_type!(
    /// 32-bit object type, allocated from the shared `last_type_id` counter.
    TypeId,
    u32
);

id_type!(
    /// Stable dense integer naming an object over its entire lifetime.
    /// Locator 0 is reserved.
    Locator,
    u64
);

id_type!(
    /// Absolute word index into the data arena. Offsets never move and never
    /// shrink; offset 0 is reserved (the arena's allocation counter lives
    /// there).
    ArenaOffset,
    u64
);

id_type!(
    /// A begin or commit timestamp. Both kinds are allocated from the same
    /// monotonically increasing 42-bit counter.
    Txid,
    u64
);

id_type!(
    /// Process-wide resource handle issued by the handle table. Handles play
    /// the role file descriptors play in a multi-process deployment: they
    /// name shared segments, sealed txn logs, and stream endpoints, and are
    /// passed between sessions as message attachments.
    Handle,
    u32
);

impl ArenaOffset {
    /// Byte offset of this word offset.
    pub const fn to_bytes(self) -> u64 {
        self.0 * WORD_SIZE as u64
    }
}

impl Txid {
    /// Whether the value fits in the 42-bit timestamp space.
    pub const fn in_range(self) -> bool {
        self.0 <= TXID_MASK
    }

    /// The immediately following timestamp.
    pub const fn next(self) -> Txid {
        Txid(self.0 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_are_invalid() {
        assert!(!Locator::ZERO.is_valid());
        assert!(!ObjectId::ZERO.is_valid());
        assert!(!Txid::ZERO.is_valid());
        assert!(Locator::new(1).is_valid());
    }

    #[test]
    fn txid_range_check() {
        assert!(Txid::new(TXID_MASK).in_range());
        assert!(!Txid::new(TXID_MASK + 1).in_range());
    }

    #[test]
    fn offsets_convert_to_bytes() {
        assert_eq!(ArenaOffset::new(3).to_bytes(), 24);
    }

    #[test]
    fn ids_order_by_raw_value() {
        assert!(Txid::new(4) < Txid::new(5));
        assert_eq!(Txid::new(4).next(), Txid::new(5));
    }
}
