//! The Tessera client
//!
//! A [`Session`] is one connection to the server: it attaches the shared
//! segments at connect time, opens snapshot-isolated transactions, mutates
//! objects through per-transaction stack allocator regions and an
//! append-only log, and submits the sealed log at commit. A commit rejected
//! by validation surfaces as a distinguishable concurrency failure so the
//! caller can retry the whole transaction.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cursor;
pub mod relationships;
pub mod session;

pub use cursor::Cursor;
pub use relationships::{Cardinality, Relationship};
pub use session::{CommitTrigger, Session};
