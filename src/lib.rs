//! # Tessera
//!
//! An in-memory, transactional object store. One server process owns the
//! shared segments (counters, object arena, locator table, id index);
//! client sessions connect over a Unix-domain socket, run snapshot-isolated
//! transactions against a private locator view, and commit append-only
//! transaction logs validated with first-committer-wins write–write
//! conflict detection.
//!
//! ## Quick start
//!
//! ```no_run
//! use tessera::prelude::*;
//!
//! # fn main() -> tessera::Result<()> {
//! let server = Server::start(ServerConfig::new("/tmp/tessera.sock"))?;
//!
//! let mut session = Session::connect(server.socket_path())?;
//! session.begin()?;
//! let id = session.create(TypeId::new(7), 0, b"hello")?;
//! session.commit()?;
//!
//! session.begin()?;
//! let object = session.lookup(id)?.expect("committed object is visible");
//! assert_eq!(object.data, b"hello");
//! session.rollback()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Crates
//!
//! | Crate | Responsibility |
//! |-------|----------------|
//! | `tessera-core` | Ids, object layout, txn-log records, errors |
//! | `tessera-storage` | Shared segments, handle table, stack allocators |
//! | `tessera-txn` | Txn-info table, validation, watermark, durability hooks |
//! | `tessera-wire` | Binary session protocol and framing |
//! | `tessera-server` | Dispatcher, session threads, stream producers |
//! | `tessera-client` | Session API: transactions, objects, cursors |
//! | `tessera-dump` | Object dump CLI |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use tessera_client::{Cardinality, CommitTrigger, Cursor, Relationship, Session};
pub use tessera_core::{
    AbortReason, ArenaOffset, Locator, LogOp, LogRecord, Object, ObjectId, ReferentialError,
    Result, TesseraError, Txid, TypeId,
};
pub use tessera_server::{Server, ServerConfig, ServerHandle};

/// The common imports.
pub mod prelude {
    pub use tessera_client::{Cardinality, Relationship, Session};
    pub use tessera_core::{ObjectId, Result, TesseraError, TypeId};
    pub use tessera_server::{Server, ServerConfig, ServerHandle};
}
