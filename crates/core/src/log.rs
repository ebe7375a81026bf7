//! Transaction logs
//!
//! Every transaction produces an append-only sequence of [`LogRecord`]s, one
//! per mutation, in insertion order. Before the log is submitted it is sealed:
//! records are sorted by locator and collapsed so at most one record per
//! locator survives (the first old offset paired with the last new offset).
//! An object created and removed within the same transaction nets out to no
//! record at all.
//!
//! A [`SealedLog`] is immutable. The write–write conflict test between two
//! sealed logs is a merge intersection on the locator column, returning on
//! the first common locator.

use crate::error::{Result, TesseraError};
use crate::types::{ArenaOffset, Locator, ObjectId, MAX_LOG_RECORDS};
use serde::{Deserialize, Serialize};

/// The operation recorded for a locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp {
    /// A new object was created under a fresh locator.
    Create,
    /// The locator was redirected to a new object version.
    Update,
    /// The locator was cleared and the id unmapped.
    Remove,
    /// The locator was redirected to a copy of another object's payload.
    /// Outside the durability layer this behaves exactly like `Update`.
    Clone,
}

/// One mutation of one locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// The mutated locator.
    pub locator: Locator,
    /// The offset the locator held before this mutation (zero for creates).
    pub old_offset: ArenaOffset,
    /// The offset the locator holds after this mutation (zero for removes).
    pub new_offset: ArenaOffset,
    /// For removes, the id being unmapped, so the durability layer can
    /// propagate the deletion. Zero otherwise.
    pub deleted_id: ObjectId,
    /// The operation kind.
    pub op: LogOp,
}

/// A writable, append-only transaction log.
///
/// Lives on the client for the duration of the transaction; consumed by
/// [`TxnLog::seal`] at commit. There is no way to submit an unsealed log.
#[derive(Debug, Default)]
pub struct TxnLog {
    records: Vec<LogRecord>,
}

impl TxnLog {
    /// Create an empty log.
    pub fn new() -> TxnLog {
        TxnLog {
            records: Vec::new(),
        }
    }

    /// Append a record in insertion order.
    ///
    /// Fails with a resource error once the log holds [`MAX_LOG_RECORDS`]
    /// records.
    pub fn append(&mut self, record: LogRecord) -> Result<()> {
        if self.records.len() >= MAX_LOG_RECORDS {
            return Err(TesseraError::resource("transaction log records"));
        }
        self.records.push(record);
        Ok(())
    }

    /// Number of raw (pre-dedup) records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no mutation has been recorded.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sort by locator, collapse to one record per locator, and freeze.
    ///
    /// The collapsed record pairs the first old offset with the last new
    /// offset. A locator that was created and removed within this log leaves
    /// no record.
    pub fn seal(mut self) -> SealedLog {
        // Stable, so per-locator insertion order survives the sort.
        self.records.sort_by_key(|r| r.locator);

        let mut sealed: Vec<LogRecord> = Vec::with_capacity(self.records.len());
        let mut iter = self.records.into_iter().peekable();
        while let Some(first) = iter.next() {
            let mut last = first;
            while let Some(next) = iter.peek() {
                if next.locator != first.locator {
                    break;
                }
                last = *next;
                iter.next();
            }
            // Created and removed within this transaction: net no-op.
            if !first.old_offset.is_valid() && !last.new_offset.is_valid() {
                continue;
            }
            let op = if last.op == LogOp::Remove {
                LogOp::Remove
            } else if first.op == LogOp::Create {
                LogOp::Create
            } else {
                last.op
            };
            sealed.push(LogRecord {
                locator: first.locator,
                old_offset: first.old_offset,
                new_offset: last.new_offset,
                deleted_id: if op == LogOp::Remove {
                    last.deleted_id
                } else {
                    ObjectId::ZERO
                },
                op,
            });
        }
        SealedLog {
            records: sealed.into_boxed_slice(),
        }
    }
}

/// An immutable, sorted, deduplicated transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedLog {
    records: Box<[LogRecord]>,
}

impl SealedLog {
    /// An empty sealed log.
    pub fn empty() -> SealedLog {
        SealedLog {
            records: Box::new([]),
        }
    }

    /// The records, sorted by locator.
    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Number of surviving records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log carries no mutation.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether two logs touch any common locator.
    ///
    /// Merge intersection over the two sorted locator columns, returning as
    /// soon as the first common locator is found.
    pub fn conflicts_with(&self, other: &SealedLog) -> bool {
        let (a, b) = (&self.records, &other.records);
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            match a[i].locator.cmp(&b[j].locator) {
                std::cmp::Ordering::Equal => return true,
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn rec(locator: u64, old: u64, new: u64, op: LogOp) -> LogRecord {
        LogRecord {
            locator: Locator::new(locator),
            old_offset: ArenaOffset::new(old),
            new_offset: ArenaOffset::new(new),
            deleted_id: ObjectId::ZERO,
            op,
        }
    }

    #[test]
    fn seal_sorts_by_locator() {
        let mut log = TxnLog::new();
        log.append(rec(5, 0, 10, LogOp::Create)).unwrap();
        log.append(rec(2, 0, 20, LogOp::Create)).unwrap();
        log.append(rec(9, 0, 30, LogOp::Create)).unwrap();
        let sealed = log.seal();
        let locators: Vec<u64> = sealed.records().iter().map(|r| r.locator.get()).collect();
        assert_eq!(locators, vec![2, 5, 9]);
    }

    #[test]
    fn seal_keeps_last_write_per_locator() {
        let mut log = TxnLog::new();
        log.append(rec(3, 7, 10, LogOp::Update)).unwrap();
        log.append(rec(3, 10, 11, LogOp::Update)).unwrap();
        log.append(rec(3, 11, 12, LogOp::Update)).unwrap();
        let sealed = log.seal();
        assert_eq!(sealed.len(), 1);
        let r = sealed.records()[0];
        assert_eq!(r.old_offset.get(), 7, "first old offset survives");
        assert_eq!(r.new_offset.get(), 12, "last new offset survives");
        assert_eq!(r.op, LogOp::Update);
    }

    #[test]
    fn create_then_remove_nets_to_nothing() {
        let mut log = TxnLog::new();
        log.append(rec(4, 0, 10, LogOp::Create)).unwrap();
        log.append(rec(4, 10, 11, LogOp::Update)).unwrap();
        let mut remove = rec(4, 11, 0, LogOp::Remove);
        remove.deleted_id = ObjectId::new(99);
        log.append(remove).unwrap();
        let sealed = log.seal();
        assert!(
            sealed.is_empty(),
            "insert+update+delete of the same object leaves no record"
        );
    }

    #[test]
    fn preexisting_object_remove_survives_with_deleted_id() {
        let mut log = TxnLog::new();
        log.append(rec(4, 10, 11, LogOp::Update)).unwrap();
        let mut remove = rec(4, 11, 0, LogOp::Remove);
        remove.deleted_id = ObjectId::new(99);
        log.append(remove).unwrap();
        let sealed = log.seal();
        assert_eq!(sealed.len(), 1);
        let r = sealed.records()[0];
        assert_eq!(r.op, LogOp::Remove);
        assert_eq!(r.deleted_id, ObjectId::new(99));
        assert_eq!(r.old_offset.get(), 10);
        assert!(!r.new_offset.is_valid());
    }

    #[test]
    fn log_record_cap_is_enforced() {
        let mut log = TxnLog::new();
        for i in 0..MAX_LOG_RECORDS {
            log.append(rec(i as u64 + 1, 0, 1, LogOp::Create)).unwrap();
        }
        let overflow = log.append(rec(1, 0, 1, LogOp::Update));
        assert!(matches!(overflow, Err(TesseraError::Resource { .. })));
    }

    #[test]
    fn conflict_is_symmetric_and_exact() {
        let mut a = TxnLog::new();
        a.append(rec(1, 0, 10, LogOp::Create)).unwrap();
        a.append(rec(5, 0, 11, LogOp::Create)).unwrap();
        let a = a.seal();

        let mut b = TxnLog::new();
        b.append(rec(2, 0, 12, LogOp::Create)).unwrap();
        b.append(rec(5, 0, 13, LogOp::Create)).unwrap();
        let b = b.seal();

        let mut c = TxnLog::new();
        c.append(rec(3, 0, 14, LogOp::Create)).unwrap();
        let c = c.seal();

        assert!(a.conflicts_with(&b), "share locator 5");
        assert!(b.conflicts_with(&a));
        assert!(!a.conflicts_with(&c));
        assert!(!c.conflicts_with(&b));
        assert!(!a.conflicts_with(&SealedLog::empty()));
    }

    proptest! {
        #[test]
        fn sealed_logs_have_unique_sorted_locators(
            writes in proptest::collection::vec((1u64..64, 1u64..1000), 0..200)
        ) {
            let mut log = TxnLog::new();
            for (locator, offset) in &writes {
                log.append(rec(*locator, *offset, offset + 1, LogOp::Update)).unwrap();
            }
            let sealed = log.seal();
            let locators: Vec<u64> =
                sealed.records().iter().map(|r| r.locator.get()).collect();
            let mut deduped = locators.clone();
            deduped.dedup();
            prop_assert_eq!(&locators, &deduped, "no duplicate locators after seal");
            let mut sorted = locators.clone();
            sorted.sort_unstable();
            prop_assert_eq!(locators, sorted, "locators sorted after seal");
        }

        #[test]
        fn conflict_matches_naive_set_intersection(
            a in proptest::collection::btree_set(1u64..40, 0..20),
            b in proptest::collection::btree_set(1u64..40, 0..20),
        ) {
            let build = |set: &std::collections::BTreeSet<u64>| {
                let mut log = TxnLog::new();
                for l in set {
                    log.append(rec(*l, 1, 2, LogOp::Update)).unwrap();
                }
                log.seal()
            };
            let expected = a.intersection(&b).next().is_some();
            prop_assert_eq!(build(&a).conflicts_with(&build(&b)), expected);
        }
    }
}
