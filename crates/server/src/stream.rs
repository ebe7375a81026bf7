//! Stream producer threads
//!
//! A cursor request hands the client one end of a socket pair; a
//! server-owned producer thread drives the other end, pushing values in
//! count-framed batches. Each batch is reversed before sending so the client
//! can pop from the back of its buffer and still see insertion order. End of
//! iteration is signalled by shutting down the write side; the client reads
//! the remaining batches and then EOF.
//!
//! Producers poll their cancellation flag between batches and always finish
//! the batch in flight, so the peer never sees a torn frame.

use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tessera_core::{Handle, MAX_ATTACHMENTS, STREAM_BATCH_SIZE};
use tessera_storage::HandleTable;
use tessera_wire::send_batch;

/// Spawn a producer pushing `source` values in batches of up to
/// [`STREAM_BATCH_SIZE`].
pub fn spawn_value_producer(
    stream: UnixStream,
    cancel: Arc<AtomicBool>,
    source: impl Iterator<Item = u64> + Send + 'static,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        run_producer(stream, cancel, source, STREAM_BATCH_SIZE);
    })
}

/// Spawn a producer pushing log handles, batched like ancillary fd payloads
/// (at most [`MAX_ATTACHMENTS`] per frame).
///
/// The handles' references belong to this producer until they are sent;
/// anything unsent when the producer stops (cancellation, peer gone) is
/// closed here so the references cannot leak.
pub fn spawn_handle_producer(
    stream: UnixStream,
    cancel: Arc<AtomicBool>,
    handles: Vec<Handle>,
    table: &'static HandleTable,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let mut source = handles.into_iter();
        run_producer(
            stream,
            cancel,
            source.by_ref().map(|h| h.get() as u64),
            MAX_ATTACHMENTS,
        );
        for unsent in source {
            let _ = table.close(unsent);
        }
    })
}

fn run_producer(
    mut stream: UnixStream,
    cancel: Arc<AtomicBool>,
    mut source: impl Iterator<Item = u64>,
    batch_limit: usize,
) {
    let mut batch: Vec<u64> = Vec::with_capacity(batch_limit);
    loop {
        if cancel.load(Ordering::Acquire) {
            tracing::debug!("stream producer cancelled");
            return;
        }
        batch.clear();
        while batch.len() < batch_limit {
            match source.next() {
                Some(value) => batch.push(value),
                None => break,
            }
        }
        if batch.is_empty() {
            // End of iteration: half-close so the client reads EOF after
            // draining its buffered batches.
            let _ = stream.shutdown(Shutdown::Write);
            return;
        }
        // Reversed so the client pops from the back in insertion order.
        batch.reverse();
        if let Err(e) = send_batch(&mut stream, &batch) {
            tracing::debug!(error = %e, "stream producer stopping on send failure");
            return;
        }
    }
}
