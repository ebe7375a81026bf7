//! Durability hooks
//!
//! The concurrency core treats durability as an external collaborator behind
//! the [`Persistence`] trait: the server prepares a transaction's effects
//! under its commit timestamp, then appends a commit or rollback marker once
//! the decision is published, and replays committed transactions through
//! [`Persistence::recover`] at startup. A failed append is fatal to the
//! server; it is never masked.
//!
//! Two implementations ship here: [`NoopPersistence`] for servers running
//! without a durable log, and [`FileWal`], a single append-only file of
//! bincode-framed entries with explicit fsync at the commit marker.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use parking_lot::Mutex;
use tessera_core::{Object, ObjectId, Result, TesseraError};

/// One durable effect of a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOp {
    /// An object version to (re)create on recovery.
    Put {
        /// The full object content.
        object: Object,
    },
    /// An id whose object was removed.
    Delete {
        /// The removed id.
        id: ObjectId,
    },
}

/// A transaction's effects, materialized for the durability layer.
///
/// Offsets and locators are process-lifetime names, so the prepared form
/// carries object content instead of log records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedTxn {
    /// The durable transaction name (derived from the commit timestamp).
    pub name: String,
    /// Effects in log order.
    pub ops: Vec<WalOp>,
}

/// The durability interface called by the server inside `txn_commit`.
pub trait Persistence: Send + Sync {
    /// Whether a durable log is actually kept. When false, the server skips
    /// materializing transaction effects entirely.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Record the transaction's effects under its name. Called after the
    /// log is registered under its commit timestamp and before validation.
    fn prepare_for_write(&self, prepared: &PreparedTxn) -> Result<()>;

    /// Append the commit marker for a previously prepared transaction.
    fn append_commit(&self, name: &str) -> Result<()>;

    /// Append the rollback marker for a previously prepared transaction.
    fn append_rollback(&self, name: &str) -> Result<()>;

    /// Replay every committed transaction's effects, in commit order.
    fn recover(&self) -> Result<Vec<PreparedTxn>>;
}

/// Materialize a sealed log's effects for the durability layer, reading
/// object content out of the arena.
pub fn prepare_ops(
    arena: &tessera_storage::DataArena,
    log: &tessera_core::SealedLog,
) -> Result<Vec<WalOp>> {
    let mut ops = Vec::with_capacity(log.len());
    for record in log.records() {
        if record.new_offset.is_valid() {
            ops.push(WalOp::Put {
                object: arena.read_object(record.new_offset)?,
            });
        } else {
            ops.push(WalOp::Delete {
                id: record.deleted_id,
            });
        }
    }
    Ok(ops)
}

/// Durability disabled: every hook succeeds and recovery finds nothing.
#[derive(Debug, Default)]
pub struct NoopPersistence;

impl Persistence for NoopPersistence {
    fn is_enabled(&self) -> bool {
        false
    }

    fn prepare_for_write(&self, _prepared: &PreparedTxn) -> Result<()> {
        Ok(())
    }

    fn append_commit(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn append_rollback(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn recover(&self) -> Result<Vec<PreparedTxn>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum WalEntry {
    Prepared(PreparedTxn),
    Commit(String),
    Rollback(String),
}

/// A file-backed write-ahead log.
pub struct FileWal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl FileWal {
    /// Open (or create) the log file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<FileWal> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TesseraError::io(format!("open wal {}", path.display()), e))?;
        Ok(FileWal {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// The log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, entry: &WalEntry, sync: bool) -> Result<()> {
        let mut writer = self.writer.lock();
        bincode::serialize_into(&mut *writer, entry).map_err(|e| {
            TesseraError::io(
                "append wal entry",
                std::io::Error::new(ErrorKind::Other, e),
            )
        })?;
        writer
            .flush()
            .map_err(|e| TesseraError::io("flush wal", e))?;
        if sync {
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| TesseraError::io("sync wal", e))?;
        }
        Ok(())
    }
}

impl Persistence for FileWal {
    fn prepare_for_write(&self, prepared: &PreparedTxn) -> Result<()> {
        self.append(&WalEntry::Prepared(prepared.clone()), false)
    }

    fn append_commit(&self, name: &str) -> Result<()> {
        // The commit marker is the durability point.
        self.append(&WalEntry::Commit(name.to_string()), true)
    }

    fn append_rollback(&self, name: &str) -> Result<()> {
        self.append(&WalEntry::Rollback(name.to_string()), false)
    }

    fn recover(&self) -> Result<Vec<PreparedTxn>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(TesseraError::io(
                    format!("open wal {}", self.path.display()),
                    e,
                ))
            }
        };
        let mut reader = BufReader::new(file);
        let mut prepared: Vec<PreparedTxn> = Vec::new();
        let mut committed: Vec<PreparedTxn> = Vec::new();
        loop {
            match bincode::deserialize_from::<_, WalEntry>(&mut reader) {
                Ok(WalEntry::Prepared(txn)) => prepared.push(txn),
                Ok(WalEntry::Commit(name)) => {
                    if let Some(i) = prepared.iter().position(|t| t.name == name) {
                        committed.push(prepared.remove(i));
                    }
                }
                Ok(WalEntry::Rollback(name)) => {
                    prepared.retain(|t| t.name != name);
                }
                Err(e) => {
                    // A torn tail (crash mid-append) ends recovery; anything
                    // before it is intact.
                    tracing::warn!(error = %e, "wal recovery stopped at torn entry");
                    break;
                }
            }
        }
        Ok(committed)
    }
}
