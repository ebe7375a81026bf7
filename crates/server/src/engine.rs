//! The server core
//!
//! Owns the shared segments, the txn-info table, the watermark, and the
//! durability hook, and implements the transaction lifecycle the session
//! handlers call into: begin (timestamp claim plus snapshot capture), commit
//! (register, submit, validate, decide, persist), rollback, memory grants,
//! type scans, reset, and recovery.

use std::path::PathBuf;
use std::sync::Arc;
use tessera_core::{
    AbortReason, Handle, Locator, Object, ObjectId, Result, TesseraError, Txid, TypeId,
};
use tessera_storage::{
    DataSegment, HandleTable, LocatorTable, MemoryManager, MemoryRange, Resource,
    SegmentGeometry,
};
use tessera_txn::table::DEFAULT_RING_ENTRIES;
use tessera_txn::{
    capture_snapshot, prepare_ops, validate, FileWal, NoopPersistence, Persistence, PreparedTxn,
    TxnTable, WalOp, Watermark,
};

/// How many times a begin retries a fenced timestamp before surfacing a
/// concurrency failure.
const BEGIN_RETRY_LIMIT: usize = 64;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path the listening socket binds to.
    pub socket_path: PathBuf,
    /// Shared segment sizing.
    pub geometry: SegmentGeometry,
    /// Txn-info ring capacity in timestamps.
    pub txn_ring_entries: usize,
    /// Write-ahead log file; `None` disables persistence.
    pub wal_path: Option<PathBuf>,
}

impl ServerConfig {
    /// A config with default geometry and persistence disabled.
    pub fn new(socket_path: impl Into<PathBuf>) -> ServerConfig {
        ServerConfig {
            socket_path: socket_path.into(),
            geometry: SegmentGeometry::default(),
            txn_ring_entries: DEFAULT_RING_ENTRIES,
            wal_path: None,
        }
    }

    /// A small-footprint config for tests.
    pub fn small(socket_path: impl Into<PathBuf>) -> ServerConfig {
        ServerConfig {
            socket_path: socket_path.into(),
            geometry: SegmentGeometry::small(),
            txn_ring_entries: tessera_txn::table::PAGE_ENTRIES * 4,
            wal_path: None,
        }
    }

    /// Enable the file-backed write-ahead log.
    pub fn with_wal(mut self, path: impl Into<PathBuf>) -> ServerConfig {
        self.wal_path = Some(path.into());
        self
    }
}

/// The decision returned by [`Engine::commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The transaction committed at this timestamp.
    Committed(Txid),
    /// The transaction aborted.
    Aborted(Txid, AbortReason),
}

impl CommitOutcome {
    /// The commit timestamp, either way.
    pub fn commit_ts(&self) -> Txid {
        match self {
            CommitOutcome::Committed(ts) | CommitOutcome::Aborted(ts, _) => *ts,
        }
    }
}

/// The server core shared by every session.
pub struct Engine {
    data: Arc<DataSegment>,
    locators: Arc<LocatorTable>,
    table: TxnTable,
    watermark: Watermark,
    memory: MemoryManager,
    persistence: Box<dyn Persistence>,
    handles: &'static HandleTable,
}

impl Engine {
    /// Create the shared segments and recover durable state.
    pub fn new(config: &ServerConfig) -> Result<Engine> {
        let data = Arc::new(DataSegment::new(config.geometry));
        let locators = Arc::new(LocatorTable::new(config.geometry.max_locators));
        let memory = MemoryManager::new(Arc::clone(&data.arena));
        let persistence: Box<dyn Persistence> = match &config.wal_path {
            Some(path) => Box::new(FileWal::open(path)?),
            None => Box::new(NoopPersistence),
        };
        let engine = Engine {
            data,
            locators,
            table: TxnTable::new(config.txn_ring_entries),
            watermark: Watermark::new(),
            memory,
            persistence,
            handles: HandleTable::global(),
        };
        engine.recover()?;
        Ok(engine)
    }

    /// The shared data segment.
    pub fn data(&self) -> &Arc<DataSegment> {
        &self.data
    }

    /// The canonical locator table.
    pub fn locators(&self) -> &Arc<LocatorTable> {
        &self.locators
    }

    /// The process handle table.
    pub fn handles(&self) -> &'static HandleTable {
        self.handles
    }

    /// Register fresh segment handles for a connecting session. The caller
    /// (the connect reply) transfers both to the client.
    pub fn connect_handles(&self) -> Result<(Handle, Handle)> {
        let data = self
            .handles
            .register(Resource::Data(Arc::clone(&self.data)))?;
        let locators = self
            .handles
            .register(Resource::Locators(Arc::clone(&self.locators)))?;
        Ok((data, locators))
    }

    /// Open a transaction: claim a begin timestamp and capture the snapshot
    /// window.
    ///
    /// Returns the begin timestamp and the committed log handles the client
    /// must replay, in commit order, each duplicated for the snapshot.
    /// Fencing can steal a freshly allocated timestamp, so the claim retries;
    /// a persistently fenced claim surfaces as a concurrency failure.
    pub fn begin(&self) -> Result<(Txid, Vec<Handle>)> {
        let mut begin_ts = None;
        for attempt in 0..BEGIN_RETRY_LIMIT {
            if let Some(ts) = self.table.begin(&self.data.counters)? {
                if attempt > 0 {
                    tracing::debug!(%ts, attempt, "begin timestamp claimed after retries");
                }
                begin_ts = Some(ts);
                break;
            }
        }
        let Some(begin_ts) = begin_ts else {
            return Err(TesseraError::TransactionAborted(AbortReason::Fenced));
        };
        let logs = capture_snapshot(&self.watermark, &self.table, self.handles, begin_ts)?;
        tracing::debug!(%begin_ts, snapshot_logs = logs.len(), "transaction begun");
        Ok((begin_ts, logs))
    }

    /// Commit a submitted transaction. Takes ownership of the sealed log's
    /// handle; it stays registered until the watermark passes the commit
    /// timestamp (or is closed here on a fence abort).
    pub fn commit(&self, begin_ts: Txid, log_handle: Handle) -> Result<CommitOutcome> {
        let log = self.handles.resolve_log(log_handle)?;

        let commit_ts = self.table.allocate_commit(&self.data.counters)?;
        if !self.table.register_log(begin_ts, commit_ts, log_handle) {
            // Another transaction fenced our commit slot before we could
            // register: a spurious abort.
            self.table.set_terminated(begin_ts);
            self.handles.close(log_handle)?;
            tracing::debug!(%begin_ts, %commit_ts, "commit slot fenced");
            return Ok(CommitOutcome::Aborted(commit_ts, AbortReason::Fenced));
        }
        self.table.set_submitted(begin_ts, commit_ts);

        let txn_name = format!("txn-{commit_ts}");
        if self.persistence.is_enabled() {
            let prepared = PreparedTxn {
                name: txn_name.clone(),
                ops: prepare_ops(&self.data.arena, &log)?,
            };
            self.persistence
                .prepare_for_write(&prepared)
                .unwrap_or_else(|e| wal_failure(&txn_name, &e));
        }

        let committed = validate(&self.table, self.handles, begin_ts, commit_ts, &log)?;
        self.table.decide(commit_ts, committed);

        // A failed marker append is fatal to the whole server process: the
        // durable log would no longer agree with published decisions, and
        // that is never masked.
        if self.persistence.is_enabled() {
            let marker = if committed {
                self.persistence.append_commit(&txn_name)
            } else {
                self.persistence.append_rollback(&txn_name)
            };
            marker.unwrap_or_else(|e| wal_failure(&txn_name, &e));
        }

        tracing::info!(%begin_ts, %commit_ts, committed, "transaction decided");
        self.advance_watermark();
        if committed {
            Ok(CommitOutcome::Committed(commit_ts))
        } else {
            Ok(CommitOutcome::Aborted(commit_ts, AbortReason::Conflict))
        }
    }

    /// Roll back an open transaction.
    pub fn rollback(&self, begin_ts: Txid) {
        self.table.set_terminated(begin_ts);
        tracing::debug!(%begin_ts, "transaction rolled back");
        self.advance_watermark();
    }

    /// Reclaim after a session died with a transaction open.
    pub fn reclaim_dead_session_txn(&self, begin_ts: Txid) {
        let entry = self.table.get(begin_ts);
        if entry.is_active() || entry.is_submitted() {
            self.table.set_terminated(begin_ts);
        }
        self.advance_watermark();
    }

    /// Advance the watermark opportunistically.
    pub fn advance_watermark(&self) {
        if let Err(e) =
            self.watermark
                .advance(&self.table, self.handles, &self.data, &self.locators)
        {
            tracing::error!(error = %e, "watermark advancement failed");
        }
    }

    /// The current watermark, for diagnostics.
    pub fn watermark(&self) -> Txid {
        self.watermark.current()
    }

    /// Grant stack-allocator regions against a session free list.
    pub fn grant_memory(
        &self,
        free_list: &mut Vec<MemoryRange>,
        size_hint: usize,
    ) -> Result<Vec<MemoryRange>> {
        self.memory.grant(free_list, size_hint)
    }

    /// All ids of live objects of `type_id`, in locator order, read from the
    /// canonical table. Best-effort: concurrent commits may or may not be
    /// visible, exactly like the scan a client could do itself.
    pub fn ids_of_type(&self, type_id: TypeId) -> IdScan {
        IdScan {
            data: Arc::clone(&self.data),
            locators: Arc::clone(&self.locators),
            next: 0,
            last: self.data.counters.last_locator().get(),
            type_id,
        }
    }

    /// Wipe every segment. The dispatcher only calls this while no sessions
    /// are registered.
    pub fn reset(&self) -> Result<()> {
        self.data.clear();
        self.locators.clear();
        tracing::warn!("segments reset");
        Ok(())
    }

    fn recover(&self) -> Result<()> {
        let committed = self.persistence.recover()?;
        let txns = committed.len();
        for txn in committed {
            for op in txn.ops {
                match op {
                    WalOp::Put { object } => self.create_recovered(object)?,
                    WalOp::Delete { id } => self.delete_recovered(id)?,
                }
            }
        }
        if txns > 0 {
            tracing::info!(txns, "recovered committed transactions");
        }
        Ok(())
    }

    fn is_live(&self, locator: Locator) -> bool {
        self.locators
            .get(locator)
            .map(|o| o.is_valid())
            .unwrap_or(false)
    }

    fn create_recovered(&self, object: Object) -> Result<()> {
        let id = object.id();
        let existing = self.data.id_index.find(id, |l| self.is_live(l));
        let words = object.header.total_words() * tessera_core::WORD_SIZE;
        let offset = self.data.arena.allocate(words)?;
        self.data.arena.write_object(offset, &object)?;
        match existing {
            // A later Put of the same id supersedes the earlier version.
            Some(locator) => self.locators.set(locator, offset)?,
            None => {
                let entry = self.data.id_index.insert(id)?;
                let locator = self
                    .data
                    .counters
                    .allocate_locator(self.locators.capacity() as u64)?;
                entry.map(locator)?;
                self.locators.set(locator, offset)?;
            }
        }
        self.data.counters.observe_id(id);
        self.data.counters.observe_type_id(object.type_id());
        Ok(())
    }

    fn delete_recovered(&self, id: ObjectId) -> Result<()> {
        if let Some(locator) = self.data.id_index.find(id, |l| self.is_live(l)) {
            self.locators.set(locator, tessera_core::ArenaOffset::ZERO)?;
            self.data.id_index.remove(id);
        }
        Ok(())
    }
}

fn wal_failure(txn_name: &str, error: &TesseraError) -> ! {
    tracing::error!(txn_name, %error, "write-ahead log failure");
    std::process::abort();
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("watermark", &self.watermark.current())
            .field("last_locator", &self.data.counters.last_locator())
            .finish()
    }
}

/// Iterator over live object ids of one type.
pub struct IdScan {
    data: Arc<DataSegment>,
    locators: Arc<LocatorTable>,
    next: u64,
    last: u64,
    type_id: TypeId,
}

impl Iterator for IdScan {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.next < self.last {
            self.next += 1;
            let locator = Locator::new(self.next);
            let Ok(offset) = self.locators.get(locator) else {
                continue;
            };
            if !offset.is_valid() {
                continue;
            }
            match self.data.arena.read_header(offset) {
                Ok(header) if header.type_id == self.type_id => {
                    return Some(header.id.get());
                }
                _ => continue,
            }
        }
        None
    }
}
