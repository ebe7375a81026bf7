//! Shared allocation counters
//!
//! Four monotonically increasing counters back every identifier in the
//! system. All are advanced by atomic fetch-add; the instructions operate on
//! the shared cells directly, so no cross-session mutex is needed.

use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::{Locator, ObjectId, Result, TesseraError, Txid, TypeId};

/// The shared counter block: `last_id`, `last_type_id`, `last_txn_id`,
/// `last_locator`. Fresh values are `counter + 1`, so zero stays reserved
/// for every identifier space.
#[derive(Debug, Default)]
pub struct Counters {
    last_id: AtomicU64,
    last_type_id: AtomicU64,
    last_txn_id: AtomicU64,
    last_locator: AtomicU64,
}

impl Counters {
    /// A zeroed counter block.
    pub fn new() -> Counters {
        Counters::default()
    }

    /// Allocate a fresh object id.
    pub fn allocate_id(&self) -> ObjectId {
        ObjectId::new(self.last_id.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Allocate a fresh type id.
    pub fn allocate_type_id(&self) -> TypeId {
        TypeId::new(self.last_type_id.fetch_add(1, Ordering::AcqRel) as u32 + 1)
    }

    /// Allocate a fresh timestamp. Begin and commit timestamps come from
    /// this single counter.
    pub fn allocate_txn_id(&self) -> Txid {
        Txid::new(self.last_txn_id.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Allocate a fresh locator, bounded by the locator table capacity.
    pub fn allocate_locator(&self, max_locators: u64) -> Result<Locator> {
        // Acquire so the bound check sees the latest allocations.
        if self.last_locator.load(Ordering::Acquire) >= max_locators {
            return Err(TesseraError::resource("locators"));
        }
        let locator = self.last_locator.fetch_add(1, Ordering::AcqRel) + 1;
        if locator > max_locators {
            return Err(TesseraError::resource("locators"));
        }
        Ok(Locator::new(locator))
    }

    /// The highest locator allocated so far. Bounds table scans.
    pub fn last_locator(&self) -> Locator {
        Locator::new(self.last_locator.load(Ordering::Acquire))
    }

    /// A fuzzy snapshot of the highest timestamp allocated so far; no
    /// ordering is implied.
    pub fn last_txn_id(&self) -> Txid {
        Txid::new(self.last_txn_id.load(Ordering::Relaxed))
    }

    /// The highest object id allocated so far.
    pub fn last_id(&self) -> ObjectId {
        ObjectId::new(self.last_id.load(Ordering::Acquire))
    }

    /// Advance `last_id` to at least `id`. Used during recovery so newly
    /// allocated ids never collide with recovered objects.
    pub fn observe_id(&self, id: ObjectId) {
        self.last_id.fetch_max(id.get(), Ordering::AcqRel);
    }

    /// Advance `last_type_id` to at least `type_id` during recovery.
    pub fn observe_type_id(&self, type_id: TypeId) {
        self.last_type_id
            .fetch_max(type_id.get() as u64, Ordering::AcqRel);
    }

    /// Reset the identity counters for a whole-database reset. Only valid
    /// while no sessions are attached. The timestamp counter is left alone
    /// so timestamps stay monotonic across resets.
    pub fn reset_identity_counters(&self) {
        self.last_id.store(0, Ordering::Release);
        self.last_type_id.store(0, Ordering::Release);
        self.last_locator.store(0, Ordering::Release);
    }
}
