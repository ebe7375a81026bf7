//! Packed txn-info entries
//!
//! Each timestamp's state is one 64-bit word:
//!
//! ```text
//! bit  63     commit-vs-begin discriminator (1 = commit)
//! bits 62-60  status
//! bits 59-44  txn-log handle (commit entries)
//! bits 43-42  reserved
//! bits 41-0   linked timestamp: the begin_ts in a commit entry,
//!             the commit_ts in a submitted begin entry
//! ```
//!
//! Status encodings:
//!
//! | class | status | bits |
//! |-------|--------|------|
//! | begin | ACTIVE | `010` |
//! | begin | SUBMITTED | `011` |
//! | begin | TERMINATED | ACTIVE/SUBMITTED with `100` ORed in |
//! | commit | VALIDATING | `001` |
//! | commit | COMMITTED | `111` |
//! | commit | ABORTED | `101` |
//!
//! The decided pseudo-state of a commit entry is the high status bit: set in
//! both COMMITTED and ABORTED, clear in VALIDATING, so a decision is
//! published by OR-ing flags onto a VALIDATING entry and an entry can never
//! leave a decided state. Likewise a begin entry is terminated by OR-ing the
//! high status bit, so termination composes with both ACTIVE and SUBMITTED.
//!
//! Two reserved words: `UNKNOWN` (all zeroes, the state of a freshly backed
//! page) and `INVALID` (only the discriminator bit), used to fence
//! timestamps no transaction may claim.

use tessera_core::{Handle, Txid, TXID_MASK};

const COMMIT_BIT: u64 = 1 << 63;
const STATUS_SHIFT: u32 = 60;
const STATUS_MASK: u64 = 0b111 << STATUS_SHIFT;
const LOG_HANDLE_SHIFT: u32 = 44;
const LOG_HANDLE_MASK: u64 = 0xFFFF << LOG_HANDLE_SHIFT;

const STATUS_ACTIVE: u64 = 0b010;
const STATUS_SUBMITTED: u64 = 0b011;
const STATUS_VALIDATING: u64 = 0b001;
const STATUS_COMMITTED: u64 = 0b111;
const STATUS_ABORTED: u64 = 0b101;
/// High status bit: decided on commit entries, terminated on begin entries.
const STATUS_HIGH_BIT: u64 = 0b100;

/// One decoded txn-info word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnEntry(u64);

impl TxnEntry {
    /// The initial state of every timestamp.
    pub const UNKNOWN: TxnEntry = TxnEntry(0);

    /// A fenced timestamp no transaction may claim.
    pub const INVALID: TxnEntry = TxnEntry(COMMIT_BIT);

    /// Wrap a raw word.
    pub const fn from_raw(raw: u64) -> TxnEntry {
        TxnEntry(raw)
    }

    /// The raw word.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// A begin entry in the ACTIVE state.
    pub const fn active_begin() -> TxnEntry {
        TxnEntry(STATUS_ACTIVE << STATUS_SHIFT)
    }

    /// A begin entry in the SUBMITTED state, forwarding to its commit_ts.
    pub fn submitted_begin(commit_ts: Txid) -> TxnEntry {
        debug_assert!(commit_ts.in_range());
        TxnEntry((STATUS_SUBMITTED << STATUS_SHIFT) | commit_ts.get())
    }

    /// A commit entry in the VALIDATING state carrying its log handle and
    /// begin_ts.
    pub fn validating_commit(log_handle: Handle, begin_ts: Txid) -> TxnEntry {
        debug_assert!(begin_ts.in_range());
        debug_assert!(log_handle.get() <= u16::MAX as u32);
        TxnEntry(
            COMMIT_BIT
                | (STATUS_VALIDATING << STATUS_SHIFT)
                | ((log_handle.get() as u64) << LOG_HANDLE_SHIFT)
                | begin_ts.get(),
        )
    }

    fn status(self) -> u64 {
        (self.0 & STATUS_MASK) >> STATUS_SHIFT
    }

    /// Whether this entry is still unclaimed.
    pub fn is_unknown(self) -> bool {
        self == TxnEntry::UNKNOWN
    }

    /// Whether this entry was fenced.
    pub fn is_invalid(self) -> bool {
        self == TxnEntry::INVALID
    }

    /// Whether this is a commit entry (and not the fence word).
    pub fn is_commit(self) -> bool {
        !self.is_invalid() && (self.0 & COMMIT_BIT) != 0
    }

    /// Whether this is a begin entry.
    pub fn is_begin(self) -> bool {
        !self.is_unknown() && (self.0 & COMMIT_BIT) == 0
    }

    /// ACTIVE begin entry, not yet submitted or terminated.
    pub fn is_active(self) -> bool {
        self.is_begin() && self.status() == STATUS_ACTIVE
    }

    /// SUBMITTED begin entry (not terminated).
    pub fn is_submitted(self) -> bool {
        self.is_begin() && self.status() == STATUS_SUBMITTED
    }

    /// Terminated begin entry.
    pub fn is_terminated(self) -> bool {
        self.is_begin() && (self.status() & STATUS_HIGH_BIT) != 0
    }

    /// VALIDATING commit entry, not yet decided.
    pub fn is_validating(self) -> bool {
        self.is_commit() && self.status() == STATUS_VALIDATING
    }

    /// Decided commit entry (committed or aborted).
    pub fn is_decided(self) -> bool {
        self.is_commit() && (self.status() & STATUS_HIGH_BIT) != 0
    }

    /// Decided-committed commit entry.
    pub fn is_committed(self) -> bool {
        self.is_commit() && self.status() == STATUS_COMMITTED
    }

    /// Decided-aborted commit entry.
    pub fn is_aborted(self) -> bool {
        self.is_commit() && self.status() == STATUS_ABORTED
    }

    /// The linked timestamp: begin_ts of a commit entry, commit_ts of a
    /// submitted begin entry.
    pub fn linked_ts(self) -> Txid {
        Txid::new(self.0 & TXID_MASK)
    }

    /// The log handle of a commit entry.
    pub fn log_handle(self) -> Handle {
        debug_assert!(self.is_commit());
        Handle::new(((self.0 & LOG_HANDLE_MASK) >> LOG_HANDLE_SHIFT) as u32)
    }

    /// This entry with the decision flags ORed in.
    pub fn with_decision(self, committed: bool) -> TxnEntry {
        debug_assert!(self.is_validating() || self.is_decided());
        let flags = if committed {
            STATUS_COMMITTED
        } else {
            STATUS_ABORTED
        };
        TxnEntry(self.0 | (flags << STATUS_SHIFT))
    }

    /// This entry with the terminated flag ORed in.
    pub fn with_terminated(self) -> TxnEntry {
        debug_assert!(self.is_begin());
        TxnEntry(self.0 | (STATUS_HIGH_BIT << STATUS_SHIFT))
    }

    /// The raw OR-mask that marks a begin entry terminated.
    pub(crate) const fn terminated_flag_raw() -> u64 {
        STATUS_HIGH_BIT << STATUS_SHIFT
    }

    /// Human-readable state, for tracing.
    pub fn describe(self) -> &'static str {
        if self.is_unknown() {
            "UNKNOWN"
        } else if self.is_invalid() {
            "INVALID"
        } else if self.is_commit() {
            match self.status() {
                STATUS_VALIDATING => "VALIDATING",
                STATUS_COMMITTED => "COMMITTED",
                STATUS_ABORTED => "ABORTED",
                _ => "CORRUPT",
            }
        } else {
            match self.status() {
                STATUS_ACTIVE => "ACTIVE",
                STATUS_SUBMITTED => "SUBMITTED",
                s if s & STATUS_HIGH_BIT != 0 => "TERMINATED",
                _ => "CORRUPT",
            }
        }
    }
}

impl std::fmt::Display for TxnEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:#018x})", self.describe(), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert;

    // The field regions of the packed word must not overlap.
    const_assert!(STATUS_MASK & COMMIT_BIT == 0);
    const_assert!(LOG_HANDLE_MASK & (STATUS_MASK | COMMIT_BIT) == 0);
    const_assert!(TXID_MASK & (LOG_HANDLE_MASK | STATUS_MASK | COMMIT_BIT) == 0);

    #[test]
    fn reserved_words_are_distinct() {
        assert!(TxnEntry::UNKNOWN.is_unknown());
        assert!(TxnEntry::INVALID.is_invalid());
        assert!(!TxnEntry::INVALID.is_commit());
        assert!(!TxnEntry::INVALID.is_begin());
        assert_ne!(TxnEntry::UNKNOWN, TxnEntry::INVALID);
    }

    #[test]
    fn begin_entry_lifecycle() {
        let active = TxnEntry::active_begin();
        assert!(active.is_begin() && active.is_active());
        assert!(!active.is_terminated());

        let submitted = TxnEntry::submitted_begin(Txid::new(77));
        assert!(submitted.is_submitted());
        assert_eq!(submitted.linked_ts(), Txid::new(77));

        // Termination composes with both prior begin states.
        assert!(active.with_terminated().is_terminated());
        let submitted_terminated = submitted.with_terminated();
        assert!(submitted_terminated.is_terminated());
        assert!(!submitted_terminated.is_submitted());
        assert_eq!(
            submitted_terminated.linked_ts(),
            Txid::new(77),
            "the forwarding pointer survives termination"
        );
    }

    #[test]
    fn commit_entry_carries_handle_and_begin_ts() {
        let entry = TxnEntry::validating_commit(Handle::new(513), Txid::new(1000));
        assert!(entry.is_commit());
        assert!(entry.is_validating());
        assert!(!entry.is_decided());
        assert_eq!(entry.log_handle(), Handle::new(513));
        assert_eq!(entry.linked_ts(), Txid::new(1000));
    }

    #[test]
    fn decisions_are_ored_and_preserve_payload() {
        let entry = TxnEntry::validating_commit(Handle::new(9), Txid::new(5));

        let committed = entry.with_decision(true);
        assert!(committed.is_decided() && committed.is_committed());
        assert!(!committed.is_aborted());
        assert_eq!(committed.log_handle(), Handle::new(9));
        assert_eq!(committed.linked_ts(), Txid::new(5));

        let aborted = entry.with_decision(false);
        assert!(aborted.is_decided() && aborted.is_aborted());
        assert!(!aborted.is_committed());

        // Re-applying the same decision is a no-op.
        assert_eq!(committed.with_decision(true), committed);
        assert_eq!(aborted.with_decision(false), aborted);
    }

    #[test]
    fn validating_is_not_decided() {
        // The decided test is the high status bit; VALIDATING must not trip it.
        let entry = TxnEntry::validating_commit(Handle::new(1), Txid::new(1));
        assert!(!entry.is_decided());
        assert!(!entry.is_committed());
        assert!(!entry.is_aborted());
    }

    #[test]
    fn describe_names_every_state() {
        assert_eq!(TxnEntry::UNKNOWN.describe(), "UNKNOWN");
        assert_eq!(TxnEntry::INVALID.describe(), "INVALID");
        assert_eq!(TxnEntry::active_begin().describe(), "ACTIVE");
        assert_eq!(TxnEntry::submitted_begin(Txid::new(1)).describe(), "SUBMITTED");
        assert_eq!(
            TxnEntry::active_begin().with_terminated().describe(),
            "TERMINATED"
        );
        let commit = TxnEntry::validating_commit(Handle::new(1), Txid::new(1));
        assert_eq!(commit.describe(), "VALIDATING");
        assert_eq!(commit.with_decision(true).describe(), "COMMITTED");
        assert_eq!(commit.with_decision(false).describe(), "ABORTED");
    }

    #[test]
    fn max_field_values_round_trip() {
        let entry = TxnEntry::validating_commit(
            Handle::new(u16::MAX as u32),
            Txid::new(TXID_MASK),
        );
        assert_eq!(entry.log_handle().get(), u16::MAX as u32);
        assert_eq!(entry.linked_ts().get(), TXID_MASK);
        assert!(entry.is_validating());
    }
}
