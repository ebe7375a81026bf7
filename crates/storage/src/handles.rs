//! The process-wide handle table
//!
//! The portable counterpart of the kernel fd table. Shared segments, sealed
//! transaction logs, and stream endpoints are registered here and named by
//! small integer [`Handle`]s; messages carry handles as attachments the way
//! `SCM_RIGHTS` carries file descriptors.
//!
//! Semantics follow the fd model:
//! - entries are refcounted; [`HandleTable::dup`] adds a reference and
//!   [`HandleTable::close`] drops one, freeing the slot at zero;
//! - attaching a handle to a message transfers one reference to the
//!   receiver;
//! - freed slots are reused lowest-first, which keeps handles dense. The
//!   table is capped at 2^16 entries so a log handle always fits the 16-bit
//!   field of a txn-info entry.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use tessera_core::{Handle, Result, SealedLog, TesseraError};

use crate::locators::LocatorTable;
use crate::segments::DataSegment;

// Handles are slot index + 1, so this cap keeps every handle value,
// log handles included, within 16 bits.
const MAX_HANDLES: usize = (1 << 16) - 1;

/// A registered resource.
#[derive(Clone)]
pub enum Resource {
    /// The shared data segment (counters, id index, arena).
    Data(Arc<DataSegment>),
    /// The shared locator table.
    Locators(Arc<LocatorTable>),
    /// A sealed transaction log.
    Log(Arc<SealedLog>),
    /// One end of a stream socket pair. Taken (not cloned) by the receiver.
    Stream(Arc<Mutex<Option<UnixStream>>>),
}

impl Resource {
    /// Wrap a stream endpoint.
    pub fn stream(stream: UnixStream) -> Resource {
        Resource::Stream(Arc::new(Mutex::new(Some(stream))))
    }

    fn kind(&self) -> &'static str {
        match self {
            Resource::Data(_) => "data segment",
            Resource::Locators(_) => "locator table",
            Resource::Log(_) => "txn log",
            Resource::Stream(_) => "stream",
        }
    }
}

struct Entry {
    resource: Resource,
    refcount: u32,
}

#[derive(Default)]
struct TableInner {
    slots: Vec<Option<Entry>>,
    free: BTreeSet<u32>,
}

/// The process-wide resource table.
#[derive(Default)]
pub struct HandleTable {
    inner: Mutex<TableInner>,
}

static GLOBAL: Lazy<HandleTable> = Lazy::new(HandleTable::default);

impl HandleTable {
    /// The table shared by every session in this process.
    pub fn global() -> &'static HandleTable {
        &GLOBAL
    }

    /// Register a resource with one reference; returns its handle.
    ///
    /// Handles start at 1; handle 0 is reserved as invalid.
    pub fn register(&self, resource: Resource) -> Result<Handle> {
        let mut inner = self.inner.lock();
        let entry = Entry {
            resource,
            refcount: 1,
        };
        if let Some(index) = inner.free.iter().next().copied() {
            inner.free.remove(&index);
            inner.slots[index as usize] = Some(entry);
            return Ok(Handle::new(index + 1));
        }
        if inner.slots.len() >= MAX_HANDLES {
            return Err(TesseraError::resource("handles"));
        }
        inner.slots.push(Some(entry));
        Ok(Handle::new(inner.slots.len() as u32))
    }

    fn with_entry<T>(
        &self,
        handle: Handle,
        f: impl FnOnce(&mut Entry) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        let slot = handle
            .get()
            .checked_sub(1)
            .and_then(|i| inner.slots.get_mut(i as usize))
            .and_then(|s| s.as_mut())
            .ok_or_else(|| TesseraError::protocol(format!("stale handle {handle}")))?;
        f(slot)
    }

    /// Add a reference to a handle.
    pub fn dup(&self, handle: Handle) -> Result<()> {
        self.with_entry(handle, |entry| {
            entry.refcount += 1;
            Ok(())
        })
    }

    /// Drop one reference; the slot is freed and becomes reusable when the
    /// count reaches zero.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.lock();
        let index = handle
            .get()
            .checked_sub(1)
            .ok_or_else(|| TesseraError::protocol("cannot close the invalid handle"))?;
        let slot = inner
            .slots
            .get_mut(index as usize)
            .and_then(|s| s.as_mut())
            .ok_or_else(|| TesseraError::protocol(format!("stale handle {handle}")))?;
        slot.refcount -= 1;
        if slot.refcount == 0 {
            inner.slots[index as usize] = None;
            inner.free.insert(index);
        }
        Ok(())
    }

    /// Resolve a handle, cloning the resource reference.
    pub fn resolve(&self, handle: Handle) -> Result<Resource> {
        self.with_entry(handle, |entry| Ok(entry.resource.clone()))
    }

    /// Resolve a data-segment handle.
    pub fn resolve_data(&self, handle: Handle) -> Result<Arc<DataSegment>> {
        match self.resolve(handle)? {
            Resource::Data(segment) => Ok(segment),
            other => Err(wrong_kind(handle, "data segment", &other)),
        }
    }

    /// Resolve a locator-table handle.
    pub fn resolve_locators(&self, handle: Handle) -> Result<Arc<LocatorTable>> {
        match self.resolve(handle)? {
            Resource::Locators(table) => Ok(table),
            other => Err(wrong_kind(handle, "locator table", &other)),
        }
    }

    /// Resolve a sealed-log handle.
    pub fn resolve_log(&self, handle: Handle) -> Result<Arc<SealedLog>> {
        match self.resolve(handle)? {
            Resource::Log(log) => Ok(log),
            other => Err(wrong_kind(handle, "txn log", &other)),
        }
    }

    /// Take ownership of a stream endpoint, leaving the handle open but
    /// empty. A stream can only be taken once.
    pub fn take_stream(&self, handle: Handle) -> Result<UnixStream> {
        match self.resolve(handle)? {
            Resource::Stream(cell) => cell
                .lock()
                .take()
                .ok_or_else(|| TesseraError::protocol(format!("stream {handle} already taken"))),
            other => Err(wrong_kind(handle, "stream", &other)),
        }
    }

    /// Number of live entries, for diagnostics and leak tests.
    pub fn live_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.slots.iter().filter(|s| s.is_some()).count()
    }
}

fn wrong_kind(handle: Handle, wanted: &str, got: &Resource) -> TesseraError {
    TesseraError::protocol(format!(
        "handle {handle} is a {}, expected a {wanted}",
        got.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::TxnLog;

    fn sealed() -> Arc<SealedLog> {
        Arc::new(TxnLog::new().seal())
    }

    #[test]
    fn register_resolve_close() {
        let table = HandleTable::default();
        let handle = table.register(Resource::Log(sealed())).unwrap();
        assert!(handle.is_valid());
        assert!(table.resolve_log(handle).is_ok());
        table.close(handle).unwrap();
        assert!(table.resolve_log(handle).is_err(), "closed handle is stale");
    }

    #[test]
    fn handles_are_reused_lowest_first() {
        let table = HandleTable::default();
        let a = table.register(Resource::Log(sealed())).unwrap();
        let b = table.register(Resource::Log(sealed())).unwrap();
        let c = table.register(Resource::Log(sealed())).unwrap();
        assert_eq!((a.get(), b.get(), c.get()), (1, 2, 3));

        table.close(a).unwrap();
        table.close(b).unwrap();
        let reused = table.register(Resource::Log(sealed())).unwrap();
        assert_eq!(reused, a, "lowest freed slot is reused first");
    }

    #[test]
    fn dup_keeps_entry_alive() {
        let table = HandleTable::default();
        let handle = table.register(Resource::Log(sealed())).unwrap();
        table.dup(handle).unwrap();
        table.close(handle).unwrap();
        assert!(table.resolve_log(handle).is_ok(), "one reference remains");
        table.close(handle).unwrap();
        assert!(table.resolve_log(handle).is_err());
    }

    #[test]
    fn kind_mismatch_is_a_protocol_error() {
        let table = HandleTable::default();
        let handle = table.register(Resource::Log(sealed())).unwrap();
        let err = table.resolve_data(handle).unwrap_err();
        assert_eq!(err.category(), "protocol");
    }

    #[test]
    fn streams_are_taken_once() {
        let table = HandleTable::default();
        let (left, _right) = UnixStream::pair().unwrap();
        let handle = table.register(Resource::stream(left)).unwrap();
        assert!(table.take_stream(handle).is_ok());
        assert!(table.take_stream(handle).is_err());
    }

    #[test]
    fn live_count_tracks_entries() {
        let table = HandleTable::default();
        assert_eq!(table.live_count(), 0);
        let a = table.register(Resource::Log(sealed())).unwrap();
        let b = table.register(Resource::Log(sealed())).unwrap();
        assert_eq!(table.live_count(), 2);
        table.close(a).unwrap();
        table.close(b).unwrap();
        assert_eq!(table.live_count(), 0);
    }
}
