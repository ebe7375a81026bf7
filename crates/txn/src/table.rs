//! The txn-info table
//!
//! One atomic word per timestamp, indexed by the timestamp itself. Storage
//! is a ring of fixed-size zeroed pages with a monotonically advancing base:
//! the table backs the timestamp interval `[base, base + capacity)`, and
//! pages wholly behind the watermark are zeroed and recycled under the
//! advancing base. This bounds memory without any per-entry bookkeeping; a
//! transaction only ever examines timestamps between the watermark and the
//! newest allocation.
//!
//! All state transitions are compare-exchange. The contracts mirror the
//! entry state machine:
//! - `UNKNOWN → INVALID` may be performed by any thread (the fence);
//! - `UNKNOWN → ACTIVE` / `UNKNOWN → VALIDATING` only by the owning
//!   transaction, and failure proves the slot was fenced;
//! - decisions and termination OR flags in, so racing deciders can only
//!   agree.

use crate::entry::TxnEntry;
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::{Handle, Result, TesseraError, Txid};
use tessera_storage::Counters;

/// Timestamps per ring page.
pub const PAGE_ENTRIES: usize = 4096;

/// Default ring capacity in timestamps.
pub const DEFAULT_RING_ENTRIES: usize = 1 << 20;

/// The shared txn-info table.
pub struct TxnTable {
    entries: Box<[AtomicU64]>,
    /// Lowest timestamp currently backed by the ring; multiple of the page
    /// size, advanced only by page recycling.
    base: AtomicU64,
}

impl TxnTable {
    /// Create a table backing `capacity` timestamps. The capacity must be a
    /// power of two and a multiple of the page size.
    pub fn new(capacity: usize) -> TxnTable {
        assert!(capacity.is_power_of_two() && capacity >= PAGE_ENTRIES);
        let mut entries = Vec::with_capacity(capacity);
        entries.resize_with(capacity, || AtomicU64::new(0));
        TxnTable {
            entries: entries.into_boxed_slice(),
            base: AtomicU64::new(0),
        }
    }

    /// Ring capacity in timestamps.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Lowest backed timestamp.
    pub fn base(&self) -> Txid {
        Txid::new(self.base.load(Ordering::Acquire))
    }

    fn slot(&self, ts: Txid) -> &AtomicU64 {
        let base = self.base.load(Ordering::Acquire);
        assert!(
            ts.get() >= base && ts.get() < base + self.entries.len() as u64,
            "timestamp {ts} outside backed ring [{base}, {})",
            base + self.entries.len() as u64
        );
        &self.entries[ts.get() as usize & (self.entries.len() - 1)]
    }

    /// Read the entry for a timestamp.
    pub fn get(&self, ts: Txid) -> TxnEntry {
        TxnEntry::from_raw(self.slot(ts).load(Ordering::Acquire))
    }

    fn compare_exchange(&self, ts: Txid, expected: TxnEntry, new: TxnEntry) -> Result<TxnEntry> {
        match self.slot(ts).compare_exchange(
            expected.raw(),
            new.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(new),
            Err(observed) => Err(TesseraError::protocol(format!(
                "timestamp {ts} transitioned concurrently to {}",
                TxnEntry::from_raw(observed)
            ))),
        }
    }

    fn allocate(&self, counters: &Counters) -> Result<Txid> {
        let ts = counters.allocate_txn_id();
        if !ts.in_range() {
            return Err(TesseraError::resource("timestamp space"));
        }
        if ts.get() >= self.base.load(Ordering::Acquire) + self.entries.len() as u64 {
            // The ring cannot back this timestamp until the watermark
            // advances; the slot stays permanently unclaimed.
            return Err(TesseraError::resource("timestamp ring pages"));
        }
        Ok(ts)
    }

    /// Allocate a commit timestamp. The slot stays UNKNOWN until the log is
    /// registered under it (or a fence claims it).
    pub fn allocate_commit(&self, counters: &Counters) -> Result<Txid> {
        self.allocate(counters)
    }

    /// Allocate a begin timestamp and initialize its entry to ACTIVE.
    ///
    /// Returns `None` if the freshly allocated slot was already fenced by a
    /// concurrent transaction; the caller is expected to retry.
    pub fn begin(&self, counters: &Counters) -> Result<Option<Txid>> {
        let ts = self.allocate(counters)?;
        match self.compare_exchange(ts, TxnEntry::UNKNOWN, TxnEntry::active_begin()) {
            Ok(_) => Ok(Some(ts)),
            Err(_) => {
                let observed = self.get(ts);
                assert!(
                    observed.is_invalid(),
                    "only a fence may claim a fresh begin slot, found {observed}"
                );
                Ok(None)
            }
        }
    }

    /// Fence a timestamp: `UNKNOWN → INVALID`. Returns whether this call
    /// performed the transition.
    pub fn invalidate(&self, ts: Txid) -> bool {
        let done = self
            .compare_exchange(ts, TxnEntry::UNKNOWN, TxnEntry::INVALID)
            .is_ok();
        if !done {
            assert!(
                !self.get(ts).is_unknown(),
                "an unknown timestamp entry cannot fail invalidation"
            );
        }
        done
    }

    /// Register a sealed log under a fresh commit timestamp:
    /// `UNKNOWN → VALIDATING(log_handle, begin_ts)`.
    ///
    /// Returns `false` if the slot was fenced, in which case the submitting
    /// transaction must abort.
    pub fn register_log(&self, begin_ts: Txid, commit_ts: Txid, log_handle: Handle) -> bool {
        let entry = TxnEntry::validating_commit(log_handle, begin_ts);
        match self.compare_exchange(commit_ts, TxnEntry::UNKNOWN, entry) {
            Ok(_) => true,
            Err(_) => {
                let observed = self.get(commit_ts);
                assert!(
                    observed.is_invalid(),
                    "only a fence may claim a fresh commit slot, found {observed}"
                );
                false
            }
        }
    }

    /// Forward a begin entry to its commit timestamp:
    /// `ACTIVE → SUBMITTED(commit_ts)`.
    pub fn set_submitted(&self, begin_ts: Txid, commit_ts: Txid) {
        self.compare_exchange(
            begin_ts,
            TxnEntry::active_begin(),
            TxnEntry::submitted_begin(commit_ts),
        )
        .expect("only the owning session submits its begin entry");
    }

    /// Mark a begin entry terminated. Only the owning session (or the
    /// server reclaiming a dead session) calls this; the flag composes with
    /// both ACTIVE and SUBMITTED.
    pub fn set_terminated(&self, begin_ts: Txid) {
        let slot = self.slot(begin_ts);
        let prior = TxnEntry::from_raw(
            slot.fetch_or(TxnEntry::terminated_flag_raw(), Ordering::AcqRel),
        );
        assert!(prior.is_begin(), "cannot terminate {prior}");
    }

    /// Publish the decision for a commit timestamp. Safe to race: every
    /// caller must carry the same verdict, and losers assert agreement.
    pub fn decide(&self, commit_ts: Txid, committed: bool) {
        let slot = self.slot(commit_ts);
        let mut observed = TxnEntry::from_raw(slot.load(Ordering::Acquire));
        loop {
            assert!(
                observed.is_validating() || observed.is_decided(),
                "cannot decide {observed}"
            );
            if observed.is_decided() {
                assert_eq!(
                    observed.is_committed(),
                    committed,
                    "racing deciders disagreed on commit_ts {commit_ts}"
                );
                return;
            }
            match slot.compare_exchange(
                observed.raw(),
                observed.with_decision(committed).raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => observed = TxnEntry::from_raw(actual),
            }
        }
    }

    /// Zero and recycle all pages strictly before `ts`, advancing the base.
    ///
    /// The caller must guarantee no timestamp below the new base will be
    /// examined again (the watermark has passed them all).
    pub fn recycle_before(&self, ts: Txid) {
        let old_base = self.base.load(Ordering::Acquire);
        let new_base = (ts.get() / PAGE_ENTRIES as u64) * PAGE_ENTRIES as u64;
        if new_base <= old_base {
            return;
        }
        for t in old_base..new_base {
            self.entries[t as usize & (self.entries.len() - 1)].store(0, Ordering::Release);
        }
        self.base.store(new_base, Ordering::Release);
        tracing::debug!(old_base, new_base, "recycled txn-info pages");
    }
}

impl std::fmt::Debug for TxnTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnTable")
            .field("capacity", &self.capacity())
            .field("base", &self.base())
            .finish()
    }
}
