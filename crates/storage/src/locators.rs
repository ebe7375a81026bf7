//! Locator table and per-transaction views
//!
//! The canonical [`LocatorTable`] maps each locator to the arena offset of
//! the object version visible at the watermark: only logs whose commit
//! timestamp has been passed by the watermark are ever applied to it, so its
//! contents are part of every active snapshot.
//!
//! Each transaction reads through a [`LocatorView`]: a private overlay on top
//! of the canonical table, populated at begin by replaying the committed logs
//! in `(last_applied, begin_ts]` and extended by the transaction's own
//! writes. This is the portable substitute for the copy-on-write private
//! mapping used by a multi-process deployment.

use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tessera_core::{ArenaOffset, Locator, Result, SealedLog, TesseraError};

/// The canonical shared locator table.
pub struct LocatorTable {
    slots: Box<[AtomicU64]>,
}

impl LocatorTable {
    /// Create a table with `capacity` locator slots. Locator 0 is reserved,
    /// so usable locators are `1..=capacity`.
    pub fn new(capacity: usize) -> LocatorTable {
        let mut slots = Vec::with_capacity(capacity + 1);
        slots.resize_with(capacity + 1, || AtomicU64::new(0));
        LocatorTable {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Number of usable locator slots.
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    fn slot(&self, locator: Locator) -> Result<&AtomicU64> {
        self.slots
            .get(locator.get() as usize)
            .filter(|_| locator.is_valid())
            .ok_or_else(|| {
                TesseraError::protocol(format!("locator {locator} out of table bounds"))
            })
    }

    /// The offset currently held by a locator; zero means dead.
    pub fn get(&self, locator: Locator) -> Result<ArenaOffset> {
        Ok(ArenaOffset::new(self.slot(locator)?.load(Ordering::Acquire)))
    }

    /// Redirect a locator. Zero clears it.
    pub fn set(&self, locator: Locator, offset: ArenaOffset) -> Result<()> {
        self.slot(locator)?.store(offset.get(), Ordering::Release);
        Ok(())
    }

    /// Clear every slot. Only valid while no sessions are attached.
    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.store(0, Ordering::Release);
        }
    }
}

impl std::fmt::Debug for LocatorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocatorTable")
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// A transaction-private view of the locator table.
#[derive(Debug)]
pub struct LocatorView {
    base: Arc<LocatorTable>,
    overlay: FxHashMap<Locator, ArenaOffset>,
}

impl LocatorView {
    /// A fresh view over the canonical table with an empty overlay.
    pub fn new(base: Arc<LocatorTable>) -> LocatorView {
        LocatorView {
            base,
            overlay: FxHashMap::default(),
        }
    }

    /// The offset a locator holds in this snapshot.
    pub fn get(&self, locator: Locator) -> Result<ArenaOffset> {
        match self.overlay.get(&locator) {
            Some(offset) => Ok(*offset),
            None => self.base.get(locator),
        }
    }

    /// Whether the locator names a live object in this snapshot.
    pub fn exists(&self, locator: Locator) -> bool {
        self.get(locator).map(|o| o.is_valid()).unwrap_or(false)
    }

    /// Redirect a locator in this view only.
    pub fn set(&mut self, locator: Locator, offset: ArenaOffset) {
        self.overlay.insert(locator, offset);
    }

    /// Replay a committed log into this view, in record order.
    pub fn apply(&mut self, log: &SealedLog) {
        for record in log.records() {
            self.overlay.insert(record.locator, record.new_offset);
        }
    }

    /// Number of locators shadowed by the overlay.
    pub fn overlay_len(&self) -> usize {
        self.overlay.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{LogOp, LogRecord, ObjectId, TxnLog};

    fn record(locator: u64, old: u64, new: u64, op: LogOp) -> LogRecord {
        LogRecord {
            locator: Locator::new(locator),
            old_offset: ArenaOffset::new(old),
            new_offset: ArenaOffset::new(new),
            deleted_id: ObjectId::ZERO,
            op,
        }
    }

    #[test]
    fn table_get_set_roundtrip() {
        let table = LocatorTable::new(8);
        let locator = Locator::new(3);
        assert!(!table.get(locator).unwrap().is_valid());
        table.set(locator, ArenaOffset::new(77)).unwrap();
        assert_eq!(table.get(locator).unwrap().get(), 77);
    }

    #[test]
    fn locator_zero_and_out_of_bounds_are_rejected() {
        let table = LocatorTable::new(8);
        assert!(table.get(Locator::ZERO).is_err());
        assert!(table.get(Locator::new(9)).is_err());
        assert!(table.set(Locator::new(100), ArenaOffset::new(1)).is_err());
    }

    #[test]
    fn view_overlay_shadows_base() {
        let table = Arc::new(LocatorTable::new(8));
        table.set(Locator::new(1), ArenaOffset::new(10)).unwrap();

        let mut view = LocatorView::new(Arc::clone(&table));
        assert_eq!(view.get(Locator::new(1)).unwrap().get(), 10);

        view.set(Locator::new(1), ArenaOffset::new(20));
        assert_eq!(view.get(Locator::new(1)).unwrap().get(), 20);
        assert_eq!(
            table.get(Locator::new(1)).unwrap().get(),
            10,
            "the canonical table never sees private writes"
        );
    }

    #[test]
    fn applying_a_log_replays_removes_as_clears() {
        let table = Arc::new(LocatorTable::new(8));
        table.set(Locator::new(2), ArenaOffset::new(5)).unwrap();

        let mut log = TxnLog::new();
        log.append(record(1, 0, 30, LogOp::Create)).unwrap();
        log.append(record(2, 5, 0, LogOp::Remove)).unwrap();
        let log = log.seal();

        let mut view = LocatorView::new(table);
        view.apply(&log);
        assert!(view.exists(Locator::new(1)));
        assert!(!view.exists(Locator::new(2)), "removed locator reads dead");
    }
}
