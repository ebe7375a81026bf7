//! Core types for the Tessera object store
//!
//! This crate defines the vocabulary shared by every other crate:
//! - Identifier newtypes ([`ObjectId`], [`TypeId`], [`Locator`], [`ArenaOffset`], [`Txid`])
//! - The in-arena object layout ([`ObjectHeader`], [`Object`])
//! - Transaction log records and the sealed-log conflict test ([`TxnLog`], [`SealedLog`])
//! - The error taxonomy ([`TesseraError`])

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod log;
pub mod object;
pub mod types;

pub use error::{AbortReason, ReferentialError, Result, TesseraError};
pub use log::{LogOp, LogRecord, SealedLog, TxnLog};
pub use object::{Object, ObjectHeader};
pub use types::{ArenaOffset, Handle, Locator, ObjectId, Txid, TypeId};
pub use types::{
    DEFAULT_ARENA_WORDS, DEFAULT_MAX_LOCATORS, HASH_BUCKETS, MAX_ATTACHMENTS, MAX_LOG_RECORDS,
    MAX_MEMORY_REQUEST, MAX_MSG_SIZE, MAX_OBJECT_PAYLOAD, MAX_REFERENCES, STACK_ALLOCATOR_SIZE,
    STREAM_BATCH_SIZE, TXID_BITS, TXID_MASK, WORD_SIZE,
};
