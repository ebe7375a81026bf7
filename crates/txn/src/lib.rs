//! Transaction concurrency control
//!
//! The single source of truth for every timestamp ever allocated is the
//! txn-info table: one packed atomic word per timestamp, transitioned only by
//! compare-exchange ([`TxnEntry`], [`TxnTable`]). On top of it sit:
//!
//! - the commit-time validation algorithm ([`validate`]), which detects
//!   write–write conflicts against the conflict window and recursively drives
//!   undecided predecessors to a decision;
//! - the watermark ([`Watermark`]), which lazily settles old timestamps,
//!   applies committed logs to the canonical locator table, closes log
//!   handles, and recycles txn-info pages;
//! - the durability hooks ([`Persistence`], [`NoopPersistence`],
//!   [`FileWal`]).
//!
//! Nothing here takes a global lock on the hot path; the only mutex guards
//! watermark advancement against concurrent snapshot capture.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod entry;
pub mod persist;
pub mod table;
pub mod validate;
pub mod watermark;

pub use entry::TxnEntry;
pub use persist::{prepare_ops, FileWal, NoopPersistence, Persistence, PreparedTxn, WalOp};
pub use table::TxnTable;
pub use validate::{ensure_decided, validate, validate_window};
pub use watermark::{capture_snapshot, Watermark};
