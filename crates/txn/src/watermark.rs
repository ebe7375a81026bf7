//! Watermark advancement and reclamation
//!
//! The watermark is the highest timestamp below which every entry is
//! settled: fenced, a terminated begin, a begin whose commit is decided, or
//! a decided commit whose log has been applied (if committed) and whose
//! handle has been closed. `last_applied` trails it, naming the newest
//! commit whose log has been folded into the canonical locator table.
//!
//! Advancement is lazy: the session thread that terminates a transaction
//! walks forward from the cached watermark and settles what it can, stopping
//! at the first active begin, undecided commit, or unclaimed timestamp.
//! Because the walk stops at every active begin, the canonical locator table
//! never contains a commit newer than any live snapshot, which is what makes
//! reading it without synchronization safe.
//!
//! The single mutex here orders advancement against snapshot capture at
//! transaction begin: a beginning session holds it while it reads
//! `last_applied` and duplicates the committed log handles of its snapshot
//! window, so the watermark can never close a handle out from under a
//! snapshot being assembled. Readers never take it.

use crate::table::TxnTable;
use crate::validate;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use tessera_core::{Handle, Result, Txid};
use tessera_storage::{DataSegment, HandleTable, LocatorTable};

/// Watermark state and the advancement lock.
#[derive(Debug, Default)]
pub struct Watermark {
    lock: Mutex<()>,
    /// Highest settled timestamp.
    watermark: AtomicU64,
    /// Newest commit applied to the canonical locator table.
    last_applied: AtomicU64,
}

impl Watermark {
    /// A watermark at the beginning of time.
    pub fn new() -> Watermark {
        Watermark::default()
    }

    /// Highest settled timestamp.
    pub fn current(&self) -> Txid {
        Txid::new(self.watermark.load(Ordering::Acquire))
    }

    /// Newest commit folded into the canonical locator table.
    pub fn last_applied(&self) -> Txid {
        Txid::new(self.last_applied.load(Ordering::Acquire))
    }

    /// Hold off advancement while assembling a snapshot.
    pub fn capture_guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Walk forward and settle timestamps. Returns the new watermark.
    ///
    /// Committed logs are applied to `canonical` in commit order (removals
    /// also drop their id-index mapping, which is safe because the commit is
    /// below every live snapshot) and their handles closed; aborted logs are
    /// just closed. Pages of the txn-info table wholly behind the new
    /// watermark are recycled. Skips without waiting if another thread is
    /// advancing or a snapshot is being captured.
    pub fn advance(
        &self,
        table: &TxnTable,
        handles: &HandleTable,
        data: &DataSegment,
        canonical: &LocatorTable,
    ) -> Result<Txid> {
        let Some(_guard) = self.lock.try_lock() else {
            return Ok(self.current());
        };

        let newest = data.counters.last_txn_id();
        let mut settled = self.watermark.load(Ordering::Acquire);
        while settled < newest.get() {
            let ts = Txid::new(settled + 1);
            let entry = table.get(ts);

            if entry.is_unknown() {
                // An allocation in flight; it will be claimed or fenced.
                break;
            }
            if entry.is_invalid() {
                settled += 1;
                continue;
            }
            if entry.is_begin() {
                if entry.is_terminated() {
                    settled += 1;
                    continue;
                }
                if entry.is_submitted() && table.get(entry.linked_ts()).is_decided() {
                    settled += 1;
                    continue;
                }
                // A live transaction owns this snapshot; nothing newer can
                // be settled.
                break;
            }

            // A commit entry.
            if !entry.is_decided() {
                break;
            }
            let log_handle = entry.log_handle();
            if entry.is_committed() {
                let log = handles.resolve_log(log_handle)?;
                for record in log.records() {
                    canonical.set(record.locator, record.new_offset)?;
                    if !record.new_offset.is_valid() && record.deleted_id.is_valid() {
                        data.id_index.remove(record.deleted_id);
                    }
                }
                self.last_applied.store(ts.get(), Ordering::Release);
                tracing::trace!(%ts, records = log.len(), "applied committed log");
            }
            handles.close(log_handle)?;
            settled += 1;
        }

        self.watermark.store(settled, Ordering::Release);
        table.recycle_before(Txid::new(settled));
        Ok(Txid::new(settled))
    }

    /// Collect the committed logs a snapshot at `begin_ts` must replay, in
    /// commit order, duplicating each handle so advancement cannot close
    /// them while the snapshot is in use. Must be called with the capture
    /// guard held, after [`validate_window`](crate::validate_window) has
    /// settled the range.
    pub fn snapshot_logs(
        &self,
        table: &TxnTable,
        handles: &HandleTable,
        begin_ts: Txid,
    ) -> Result<Vec<Handle>> {
        let mut logs = Vec::new();
        let mut ts = self.last_applied();
        while ts < begin_ts {
            ts = ts.next();
            if ts == begin_ts {
                break;
            }
            let entry = table.get(ts);
            if entry.is_commit() {
                assert!(
                    entry.is_decided(),
                    "undecided commit {ts} in a settled snapshot window"
                );
                if entry.is_committed() {
                    handles.dup(entry.log_handle())?;
                    logs.push(entry.log_handle());
                }
            }
        }
        Ok(logs)
    }
}

/// Settle the snapshot window and collect its committed logs: the begin-time
/// server path. Holds the capture guard for the duration.
pub fn capture_snapshot(
    watermark: &Watermark,
    table: &TxnTable,
    handles: &HandleTable,
    begin_ts: Txid,
) -> Result<Vec<Handle>> {
    let _guard = watermark.capture_guard();
    validate::validate_window(table, handles, watermark.last_applied().next(), begin_ts)?;
    watermark.snapshot_logs(table, handles, begin_ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::PAGE_ENTRIES;
    use std::sync::Arc;
    use tessera_core::{ArenaOffset, Locator, LogOp, LogRecord, ObjectId, SealedLog, TxnLog};
    use tessera_storage::{Resource, SegmentGeometry};

    struct Harness {
        table: TxnTable,
        data: DataSegment,
        handles: HandleTable,
        canonical: LocatorTable,
        watermark: Watermark,
    }

    impl Harness {
        fn new() -> Harness {
            Harness {
                table: TxnTable::new(PAGE_ENTRIES * 2),
                data: DataSegment::new(SegmentGeometry::small()),
                handles: HandleTable::default(),
                canonical: LocatorTable::new(256),
                watermark: Watermark::new(),
            }
        }

        fn begin(&self) -> Txid {
            loop {
                if let Some(ts) = self.table.begin(&self.data.counters).unwrap() {
                    return ts;
                }
            }
        }

        fn commit(&self, begin_ts: Txid, log: SealedLog) -> Txid {
            let handle = self
                .handles
                .register(Resource::Log(Arc::new(log.clone())))
                .unwrap();
            let commit_ts = self.data.counters.allocate_txn_id();
            assert!(self.table.register_log(begin_ts, commit_ts, handle));
            self.table.set_submitted(begin_ts, commit_ts);
            let committed =
                validate::validate(&self.table, &self.handles, begin_ts, commit_ts, &log)
                    .unwrap();
            self.table.decide(commit_ts, committed);
            commit_ts
        }

        fn advance(&self) -> Txid {
            self.watermark
                .advance(&self.table, &self.handles, &self.data, &self.canonical)
                .unwrap()
        }
    }

    fn log_on(writes: &[(u64, u64)]) -> SealedLog {
        let mut log = TxnLog::new();
        for (locator, new) in writes {
            log.append(LogRecord {
                locator: Locator::new(*locator),
                old_offset: ArenaOffset::ZERO,
                new_offset: ArenaOffset::new(*new),
                deleted_id: ObjectId::ZERO,
                op: LogOp::Update,
            })
            .unwrap();
        }
        log.seal()
    }

    #[test]
    fn advancement_applies_committed_logs_in_order() {
        let h = Harness::new();
        let b1 = h.begin();
        h.commit(b1, log_on(&[(1, 10)]));
        h.table.set_terminated(b1);
        let b2 = h.begin();
        h.commit(b2, log_on(&[(1, 20), (2, 30)]));
        h.table.set_terminated(b2);

        let wm = h.advance();
        assert_eq!(wm.get(), h.data.counters.last_txn_id().get());
        assert_eq!(h.canonical.get(Locator::new(1)).unwrap().get(), 20);
        assert_eq!(h.canonical.get(Locator::new(2)).unwrap().get(), 30);
        assert_eq!(h.watermark.last_applied().get(), wm.get());
        assert_eq!(h.handles.live_count(), 0, "all log handles were closed");
    }

    #[test]
    fn advancement_stops_at_an_active_begin() {
        let h = Harness::new();
        let b1 = h.begin();
        h.commit(b1, log_on(&[(1, 10)]));
        h.table.set_terminated(b1);

        let b2 = h.begin(); // stays active
        let b3 = h.begin();
        h.commit(b3, log_on(&[(1, 99)]));
        h.table.set_terminated(b3);

        let wm = h.advance();
        assert_eq!(
            wm.get(),
            b2.get() - 1,
            "the watermark parks just below the oldest live begin"
        );
        assert_eq!(
            h.canonical.get(Locator::new(1)).unwrap().get(),
            10,
            "commits newer than a live snapshot are not applied"
        );

        // Terminating the straggler lets everything settle.
        h.table.set_terminated(b2);
        let wm = h.advance();
        assert_eq!(wm.get(), h.data.counters.last_txn_id().get());
        assert_eq!(h.canonical.get(Locator::new(1)).unwrap().get(), 99);
    }

    #[test]
    fn advancement_stops_at_an_undecided_commit() {
        let h = Harness::new();
        let b1 = h.begin();
        let handle = h
            .handles
            .register(Resource::Log(Arc::new(log_on(&[(1, 10)]))))
            .unwrap();
        let c1 = h.data.counters.allocate_txn_id();
        h.table.register_log(b1, c1, handle);
        h.table.set_submitted(b1, c1);

        let wm = h.advance();
        assert_eq!(wm.get(), b1.get() - 1, "submitted-undecided blocks settling");
    }

    #[test]
    fn aborted_logs_are_closed_without_application() {
        let h = Harness::new();
        let b1 = h.begin();
        let b2 = h.begin();
        h.commit(b1, log_on(&[(1, 10)]));
        h.table.set_terminated(b1);
        let c2 = h.commit(b2, log_on(&[(1, 20)]));
        h.table.set_terminated(b2);
        assert!(h.table.get(c2).is_aborted());

        h.advance();
        assert_eq!(
            h.canonical.get(Locator::new(1)).unwrap().get(),
            10,
            "aborted log must not touch the canonical table"
        );
        assert_eq!(h.handles.live_count(), 0);
    }

    #[test]
    fn snapshot_capture_dups_handles_against_closing() {
        let h = Harness::new();
        let b1 = h.begin();
        h.commit(b1, log_on(&[(1, 10)]));
        h.table.set_terminated(b1);

        // A new snapshot collects the committed log before the watermark
        // has applied it.
        let b2 = h.begin();
        let logs =
            capture_snapshot(&h.watermark, &h.table, &h.handles, b2).unwrap();
        assert_eq!(logs.len(), 1);

        // Advancement applies and closes its own reference; the snapshot's
        // duplicate keeps the log resolvable.
        h.advance();
        assert!(h.handles.resolve_log(logs[0]).is_ok());
        h.handles.close(logs[0]).unwrap();
        assert_eq!(h.handles.live_count(), 0);
    }

    #[test]
    fn snapshot_skips_logs_already_applied() {
        let h = Harness::new();
        let b1 = h.begin();
        h.commit(b1, log_on(&[(1, 10)]));
        h.table.set_terminated(b1);
        h.advance();

        let b2 = h.begin();
        let logs =
            capture_snapshot(&h.watermark, &h.table, &h.handles, b2).unwrap();
        assert!(
            logs.is_empty(),
            "logs at or below last_applied are already in the canonical table"
        );
    }
}
