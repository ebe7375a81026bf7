//! The Tessera server
//!
//! One process owns the shared segments and the txn-info table; client
//! sessions connect over a Unix-domain socket. The dispatcher accepts
//! connections and runs one thread per session; each session drives the
//! protocol state machine, and short-lived producer threads feed cursor
//! streams.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatch;
pub mod engine;
pub mod session;
pub mod stream;

pub use dispatch::{Server, ServerHandle};
pub use engine::{CommitOutcome, Engine, ServerConfig};
pub use session::{Session, SessionState};
