//! Client sessions and transactions
//!
//! Connecting attaches the shared segments through the handles the server
//! sends back. A transaction begin claims a snapshot: the server streams
//! the committed log handles of the snapshot window, and the client replays
//! them into a private locator view. Mutations allocate object versions out
//! of server-granted stack allocator regions, rewrite the private view, and
//! append to the transaction log; commit seals the log and submits its
//! handle for validation.
//!
//! Shared counters and offsets are treated as untrusted inputs: every
//! dereference is bound checked by the storage layer before use.

use crate::cursor::Cursor;
use crate::relationships::{Cardinality, Relationship};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use tessera_core::{
    AbortReason, ArenaOffset, Handle, Locator, LogOp, LogRecord, Object, ObjectId,
    ReferentialError, Result, TesseraError, TxnLog, Txid, TypeId, STACK_ALLOCATOR_SIZE, WORD_SIZE,
};
use tessera_storage::{
    DataSegment, HandleTable, LocatorTable, LocatorView, MemoryRange, Resource, StackAllocator,
};
use tessera_wire::{
    recv_message, send_message, Message, MessageData, MessageKind, SessionEvent,
};

/// One open transaction's client-side state.
struct Txn {
    begin_ts: Txid,
    view: LocatorView,
    log: TxnLog,
    /// Stack allocator regions granted to this transaction; the front one
    /// is the current allocation target.
    allocators: Vec<StackAllocator>,
    /// Next memory request size; doubles per request up to the cap.
    memory_hint: usize,
}

impl Txn {
    /// Allocate `size_bytes` for `locator`, fetching more regions from the
    /// server as needed.
    fn allocate(
        &mut self,
        stream: &mut UnixStream,
        data: &Arc<DataSegment>,
        locator: Locator,
        old_offset: ArenaOffset,
        size_bytes: usize,
    ) -> Result<ArenaOffset> {
        let mut refilled = false;
        loop {
            if let Some(front) = self.allocators.first() {
                match front.allocate(locator, old_offset, size_bytes) {
                    Ok(offset) => return Ok(offset),
                    Err(TesseraError::Resource { .. }) => {
                        // This region is full; a committed region's contents
                        // stay in the arena, so just stop using it.
                        self.allocators.remove(0);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            if refilled {
                // A fresh region fits any valid object; failing twice means
                // the arena itself is exhausted.
                return Err(TesseraError::resource("stack allocator regions"));
            }
            self.request_memory(stream, data)?;
            refilled = true;
        }
    }

    /// Record a deallocation tombstone for `locator`.
    fn record_delete(
        &mut self,
        stream: &mut UnixStream,
        data: &Arc<DataSegment>,
        locator: Locator,
        old_offset: ArenaOffset,
    ) -> Result<()> {
        let mut refilled = false;
        loop {
            if let Some(front) = self.allocators.first() {
                match front.deallocate(locator, old_offset) {
                    Ok(()) => return Ok(()),
                    Err(TesseraError::Resource { .. }) => {
                        self.allocators.remove(0);
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            if refilled {
                return Err(TesseraError::resource("stack allocator regions"));
            }
            self.request_memory(stream, data)?;
            refilled = true;
        }
    }

    fn request_memory(
        &mut self,
        stream: &mut UnixStream,
        data: &Arc<DataSegment>,
    ) -> Result<()> {
        send_message(
            stream,
            &Message::request(SessionEvent::RequestMemory).with_data(MessageData::MemoryInfo {
                size_hint: self.memory_hint as u64,
                ranges: Vec::new(),
            }),
        )?;
        let reply = expect_reply(stream, &[SessionEvent::RequestMemory])?;
        let MessageData::MemoryInfo { ranges, .. } = reply.data else {
            return Err(TesseraError::protocol("memory grant without ranges"));
        };
        if ranges.is_empty() {
            return Err(TesseraError::resource("stack allocator regions"));
        }
        for range in ranges {
            self.allocators.push(StackAllocator::initialize(
                Arc::clone(&data.arena),
                MemoryRange {
                    offset: ArenaOffset::new(range.offset),
                    size: range.size,
                },
            )?);
        }
        self.memory_hint =
            (self.memory_hint * 2).min(tessera_core::MAX_MEMORY_REQUEST);
        Ok(())
    }
}

fn expect_reply(stream: &mut UnixStream, events: &[SessionEvent]) -> Result<Message> {
    let Some(reply) = recv_message(stream)? else {
        return Err(TesseraError::io(
            "session reply",
            std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "server closed the session",
            ),
        ));
    };
    if reply.kind != MessageKind::Reply || !events.contains(&reply.event) {
        return Err(TesseraError::protocol(format!(
            "unexpected reply {:?} while waiting for {events:?}",
            reply.event
        )));
    }
    Ok(reply)
}

/// Callback invoked after a successful commit with the commit timestamp and
/// the surviving (deduplicated) log records. This is the seam the external
/// rules engine hangs its trigger dispatch on; the core only guarantees the
/// callback runs on the committing thread, after the decision, at most once
/// per transaction.
pub type CommitTrigger = Box<dyn FnMut(Txid, &[LogRecord]) + Send>;

/// One connection to a Tessera server.
pub struct Session {
    stream: UnixStream,
    data: Arc<DataSegment>,
    locators: Arc<LocatorTable>,
    handles: &'static HandleTable,
    txn: Option<Txn>,
    commit_trigger: Option<CommitTrigger>,
}

impl Session {
    /// Connect to the server socket and attach the shared segments.
    pub fn connect(socket_path: impl AsRef<Path>) -> Result<Session> {
        let mut stream = UnixStream::connect(socket_path.as_ref())
            .map_err(|e| TesseraError::io("connect to server", e))?;
        let handles = HandleTable::global();

        send_message(&mut stream, &Message::request(SessionEvent::Connect))?;
        let reply = expect_reply(&mut stream, &[SessionEvent::Connect])?;
        let &[data_handle, locator_handle] = &reply.attachments[..] else {
            return Err(TesseraError::protocol(
                "connect reply must attach the data and locator segments",
            ));
        };
        // Resolving clones the segment references, so the transferred
        // handles can be closed right away.
        let data = handles.resolve_data(data_handle)?;
        let locators = handles.resolve_locators(locator_handle)?;
        handles.close(data_handle)?;
        handles.close(locator_handle)?;

        Ok(Session {
            stream,
            data,
            locators,
            handles,
            txn: None,
            commit_trigger: None,
        })
    }

    /// Install the post-commit trigger callback.
    pub fn set_commit_trigger(&mut self, trigger: CommitTrigger) {
        self.commit_trigger = Some(trigger);
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// The highest object id allocated so far, read from the shared
    /// counters. Bounds id-range scans.
    pub fn last_id(&self) -> ObjectId {
        self.data.counters.last_id()
    }

    /// The open transaction's begin timestamp.
    pub fn begin_ts(&self) -> Option<Txid> {
        self.txn.as_ref().map(|t| t.begin_ts)
    }

    fn txn_ref(&self) -> Result<&Txn> {
        self.txn
            .as_ref()
            .ok_or_else(|| TesseraError::protocol("no transaction is open"))
    }

    /// Open a transaction: claim a begin timestamp and build the private
    /// snapshot by replaying the streamed committed logs.
    pub fn begin(&mut self) -> Result<()> {
        if self.txn.is_some() {
            return Err(TesseraError::protocol("a transaction is already open"));
        }
        send_message(&mut self.stream, &Message::request(SessionEvent::BeginTxn))?;
        let reply = expect_reply(&mut self.stream, &[SessionEvent::BeginTxn])?;
        let MessageData::TxnInfo { txn_id: begin_ts } = reply.data else {
            return Err(TesseraError::protocol("begin reply without txn info"));
        };
        if !begin_ts.is_valid() {
            // The server gave up claiming a begin timestamp.
            return Err(TesseraError::TransactionAborted(AbortReason::Fenced));
        }
        let &[stream_handle] = &reply.attachments[..] else {
            return Err(TesseraError::protocol("begin reply without a log stream"));
        };

        let mut view = LocatorView::new(Arc::clone(&self.locators));
        let mut log_stream = self.handles.take_stream(stream_handle)?;
        self.handles.close(stream_handle)?;
        // Replay the snapshot's committed logs in commit order. Batches
        // arrive reversed, so popping from the back restores it.
        while let Some(mut batch) = tessera_wire::recv_batch(&mut log_stream)? {
            while let Some(value) = batch.pop() {
                let log_handle = Handle::new(value as u32);
                let log = self.handles.resolve_log(log_handle)?;
                view.apply(&log);
                self.handles.close(log_handle)?;
            }
        }

        self.txn = Some(Txn {
            begin_ts,
            view,
            log: TxnLog::new(),
            allocators: Vec::new(),
            memory_hint: STACK_ALLOCATOR_SIZE,
        });
        tracing::debug!(%begin_ts, "transaction open");
        Ok(())
    }

    /// Submit the open transaction. `Ok(())` means committed; a rejected
    /// commit surfaces as [`TesseraError::TransactionAborted`] and the
    /// transaction is gone either way.
    pub fn commit(&mut self) -> Result<()> {
        let txn = self
            .txn
            .take()
            .ok_or_else(|| TesseraError::protocol("no transaction is open"))?;
        let sealed = Arc::new(txn.log.seal());
        let log_handle = self
            .handles
            .register(Resource::Log(Arc::clone(&sealed)))?;

        send_message(
            &mut self.stream,
            &Message::request(SessionEvent::CommitTxn).with_attachment(log_handle),
        )?;
        let reply = expect_reply(
            &mut self.stream,
            &[SessionEvent::DecideTxnCommit, SessionEvent::DecideTxnAbort],
        )?;
        match reply.event {
            SessionEvent::DecideTxnCommit => {
                if let Some(trigger) = &mut self.commit_trigger {
                    let commit_ts = match reply.data {
                        MessageData::TxnInfo { txn_id } => txn_id,
                        _ => Txid::ZERO,
                    };
                    trigger(commit_ts, sealed.records());
                }
                Ok(())
            }
            _ => {
                let reason = match reply.data {
                    // The zero timestamp marks a fence abort.
                    MessageData::TxnInfo { txn_id } if !txn_id.is_valid() => AbortReason::Fenced,
                    _ => AbortReason::Conflict,
                };
                Err(TesseraError::TransactionAborted(reason))
            }
        }
    }

    /// Abandon the open transaction. The server is notified but does not
    /// reply.
    pub fn rollback(&mut self) -> Result<()> {
        if self.txn.take().is_none() {
            return Err(TesseraError::protocol("no transaction is open"));
        }
        send_message(
            &mut self.stream,
            &Message::request(SessionEvent::RollbackTxn),
        )
    }

    /// Create an object with a fresh id.
    pub fn create(
        &mut self,
        type_id: TypeId,
        num_references: usize,
        data: &[u8],
    ) -> Result<ObjectId> {
        let id = self.data.counters.allocate_id();
        self.create_with_id(id, type_id, num_references, data)?;
        Ok(id)
    }

    /// Create an object under a caller-chosen id.
    ///
    /// The id-index claim is a shared side effect, visible to concurrent
    /// sessions immediately; of two racing creators of the same id exactly
    /// one wins and the other gets a duplicate-id error.
    pub fn create_with_id(
        &mut self,
        id: ObjectId,
        type_id: TypeId,
        num_references: usize,
        data: &[u8],
    ) -> Result<()> {
        let object = Object::new(
            id,
            type_id,
            vec![ObjectId::ZERO; num_references],
            data.to_vec(),
        )?;
        let txn = self
            .txn
            .as_mut()
            .ok_or_else(|| TesseraError::protocol("no transaction is open"))?;

        let entry = self.data.id_index.insert(id)?;
        let locator = self
            .data
            .counters
            .allocate_locator(self.locators.capacity() as u64)?;
        let offset = txn.allocate(
            &mut self.stream,
            &self.data,
            locator,
            ArenaOffset::ZERO,
            object.header.total_words() * WORD_SIZE,
        )?;
        self.data.arena.write_object(offset, &object)?;
        entry.map(locator)?;

        txn.view.set(locator, offset);
        txn.log.append(LogRecord {
            locator,
            old_offset: ArenaOffset::ZERO,
            new_offset: offset,
            deleted_id: ObjectId::ZERO,
            op: LogOp::Create,
        })?;
        Ok(())
    }

    fn locate(&self, id: ObjectId) -> Result<Option<(Locator, ArenaOffset)>> {
        let txn = self.txn_ref()?;
        let Some(locator) = self.data.id_index.find(id, |l| txn.view.exists(l)) else {
            return Ok(None);
        };
        let offset = txn.view.get(locator)?;
        Ok(Some((locator, offset)))
    }

    /// Read an object by id from this transaction's snapshot.
    pub fn lookup(&self, id: ObjectId) -> Result<Option<Object>> {
        match self.locate(id)? {
            Some((_, offset)) => Ok(Some(self.data.arena.read_object(offset)?)),
            None => Ok(None),
        }
    }

    /// Replace an object's data payload, keeping its references.
    pub fn update(&mut self, id: ObjectId, data: &[u8]) -> Result<()> {
        let (locator, old_offset) = self
            .locate(id)?
            .ok_or(ReferentialError::NotFound(id))?;
        let current = self.data.arena.read_object(old_offset)?;
        let object = Object::new(id, current.type_id(), current.references, data.to_vec())?;
        self.put_version(locator, old_offset, object, LogOp::Update)
    }

    /// Copy another object's payload under a new version of `id`.
    pub fn clone_from(&mut self, id: ObjectId, source: ObjectId) -> Result<()> {
        let (locator, old_offset) = self
            .locate(id)?
            .ok_or(ReferentialError::NotFound(id))?;
        let template = self
            .lookup(source)?
            .ok_or(ReferentialError::NotFound(source))?;
        let object = Object::new(id, template.type_id(), template.references, template.data)?;
        self.put_version(locator, old_offset, object, LogOp::Clone)
    }

    /// Remove an object. Every reference slot must be empty.
    pub fn delete(&mut self, id: ObjectId) -> Result<()> {
        let (locator, old_offset) = self
            .locate(id)?
            .ok_or(ReferentialError::NotFound(id))?;
        let current = self.data.arena.read_object(old_offset)?;
        if !current.is_disconnected() {
            return Err(ReferentialError::NotDisconnected(id).into());
        }
        let txn = self.txn.as_mut().expect("locate verified the transaction");
        txn.record_delete(
            &mut self.stream,
            &self.data,
            locator,
            old_offset,
        )?;
        txn.view.set(locator, ArenaOffset::ZERO);
        txn.log.append(LogRecord {
            locator,
            old_offset,
            new_offset: ArenaOffset::ZERO,
            deleted_id: id,
            op: LogOp::Remove,
        })?;
        Ok(())
    }

    /// Point reference slot `slot` of `id` at `target` (or clear it with
    /// [`ObjectId::ZERO`]).
    pub fn set_reference(&mut self, id: ObjectId, slot: usize, target: ObjectId) -> Result<()> {
        if target.is_valid() && self.lookup(target)?.is_none() {
            return Err(ReferentialError::NotFound(target).into());
        }
        let (locator, old_offset) = self
            .locate(id)?
            .ok_or(ReferentialError::NotFound(id))?;
        let mut object = self.data.arena.read_object(old_offset)?;
        let slot_ref = object
            .references
            .get_mut(slot)
            .ok_or(ReferentialError::InvalidReferenceSlot { id, slot })?;
        *slot_ref = target;
        self.put_version(locator, old_offset, object, LogOp::Update)
    }

    /// Link `child` under `parent` through `relationship`.
    pub fn connect_objects(
        &mut self,
        relationship: &Relationship,
        parent: ObjectId,
        child: ObjectId,
    ) -> Result<()> {
        let parent_obj = self
            .lookup(parent)?
            .ok_or(ReferentialError::NotFound(parent))?;
        let child_obj = self
            .lookup(child)?
            .ok_or(ReferentialError::NotFound(child))?;
        check_type(&parent_obj, relationship.parent_type)?;
        check_type(&child_obj, relationship.child_type)?;

        let first_child = *parent_obj
            .references
            .get(relationship.first_child_slot)
            .ok_or(ReferentialError::InvalidReferenceSlot {
                id: parent,
                slot: relationship.first_child_slot,
            })?;
        let child_parent = *child_obj
            .references
            .get(relationship.parent_slot)
            .ok_or(ReferentialError::InvalidReferenceSlot {
                id: child,
                slot: relationship.parent_slot,
            })?;
        if child_parent.is_valid() {
            return Err(ReferentialError::NotDisconnected(child).into());
        }
        if relationship.cardinality == Cardinality::One && first_child.is_valid() {
            return Err(ReferentialError::CardinalityViolation(parent).into());
        }

        // Push the child at the head of the sibling list, then repoint the
        // parent. Both writes are new object versions in this transaction.
        self.set_reference(child, relationship.next_child_slot, first_child)?;
        self.set_reference(child, relationship.parent_slot, parent)?;
        self.set_reference(parent, relationship.first_child_slot, child)?;
        Ok(())
    }

    /// Unlink `child` from `parent`.
    pub fn disconnect_objects(
        &mut self,
        relationship: &Relationship,
        parent: ObjectId,
        child: ObjectId,
    ) -> Result<()> {
        if relationship.required {
            return Err(ReferentialError::RequiredReference(child).into());
        }
        let parent_obj = self
            .lookup(parent)?
            .ok_or(ReferentialError::NotFound(parent))?;
        let child_obj = self
            .lookup(child)?
            .ok_or(ReferentialError::NotFound(child))?;
        check_type(&parent_obj, relationship.parent_type)?;
        check_type(&child_obj, relationship.child_type)?;
        if child_obj.references.get(relationship.parent_slot).copied()
            != Some(parent)
        {
            return Err(ReferentialError::NotFound(child).into());
        }
        let next_sibling = *child_obj
            .references
            .get(relationship.next_child_slot)
            .ok_or(ReferentialError::InvalidReferenceSlot {
                id: child,
                slot: relationship.next_child_slot,
            })?;

        // Unlink from the sibling chain: either the parent's head points at
        // the child, or some sibling's next pointer does.
        let head = *parent_obj
            .references
            .get(relationship.first_child_slot)
            .ok_or(ReferentialError::InvalidReferenceSlot {
                id: parent,
                slot: relationship.first_child_slot,
            })?;
        if head == child {
            self.set_reference(parent, relationship.first_child_slot, next_sibling)?;
        } else {
            let mut walk = head;
            loop {
                if !walk.is_valid() {
                    return Err(ReferentialError::NotFound(child).into());
                }
                let sibling = self
                    .lookup(walk)?
                    .ok_or(ReferentialError::NotFound(walk))?;
                let sibling_next = *sibling
                    .references
                    .get(relationship.next_child_slot)
                    .ok_or(ReferentialError::InvalidReferenceSlot {
                        id: walk,
                        slot: relationship.next_child_slot,
                    })?;
                if sibling_next == child {
                    self.set_reference(walk, relationship.next_child_slot, next_sibling)?;
                    break;
                }
                walk = sibling_next;
            }
        }
        self.set_reference(child, relationship.next_child_slot, ObjectId::ZERO)?;
        self.set_reference(child, relationship.parent_slot, ObjectId::ZERO)?;
        Ok(())
    }

    /// Request a server-side scan of all live objects of `type_id`.
    ///
    /// Results are best-effort within the transaction: the server reads the
    /// canonical table, so very recent commits may or may not appear.
    pub fn table_scan(&mut self, type_id: TypeId) -> Result<Cursor> {
        send_message(
            &mut self.stream,
            &Message::request(SessionEvent::RequestStream)
                .with_data(MessageData::TableScan { type_id }),
        )?;
        let reply = expect_reply(&mut self.stream, &[SessionEvent::RequestStream])?;
        let &[stream_handle] = &reply.attachments[..] else {
            return Err(TesseraError::protocol("stream reply without a cursor"));
        };
        let stream = self.handles.take_stream(stream_handle)?;
        self.handles.close(stream_handle)?;
        Ok(Cursor::new(stream))
    }

    fn put_version(
        &mut self,
        locator: Locator,
        old_offset: ArenaOffset,
        object: Object,
        op: LogOp,
    ) -> Result<()> {
        let txn = self.txn.as_mut().expect("caller verified the transaction");
        let offset = txn.allocate(
            &mut self.stream,
            &self.data,
            locator,
            old_offset,
            object.header.total_words() * WORD_SIZE,
        )?;
        self.data.arena.write_object(offset, &object)?;
        txn.view.set(locator, offset);
        txn.log.append(LogRecord {
            locator,
            old_offset,
            new_offset: offset,
            deleted_id: ObjectId::ZERO,
            op,
        })?;
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Best effort: tell the server about an open transaction so it can
        // reclaim without waiting for the socket to close.
        if self.txn.take().is_some() {
            let _ = send_message(
                &mut self.stream,
                &Message::request(SessionEvent::RollbackTxn),
            );
        }
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

fn check_type(object: &Object, expected: TypeId) -> Result<()> {
    if object.type_id() != expected {
        return Err(ReferentialError::TypeMismatch {
            expected,
            actual: object.type_id(),
        }
        .into());
    }
    Ok(())
}
