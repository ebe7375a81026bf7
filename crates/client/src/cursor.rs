//! Client side of server-produced streams
//!
//! The server pushes count-framed batches with their elements reversed, so
//! the client buffers one batch and pops from the back to recover insertion
//! order. EOF on the stream ends iteration.

use std::os::unix::net::UnixStream;
use tessera_core::{ObjectId, Result};
use tessera_wire::recv_batch;

/// A pull cursor over a server stream of object ids.
#[derive(Debug)]
pub struct Cursor {
    stream: UnixStream,
    buffer: Vec<u64>,
    done: bool,
}

impl Cursor {
    pub(crate) fn new(stream: UnixStream) -> Cursor {
        Cursor {
            stream,
            buffer: Vec::new(),
            done: false,
        }
    }

    /// The next id, or `None` after the producer signalled EOF.
    pub fn next_id(&mut self) -> Result<Option<ObjectId>> {
        while self.buffer.is_empty() {
            if self.done {
                return Ok(None);
            }
            match recv_batch(&mut self.stream)? {
                Some(batch) => self.buffer = batch,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            }
        }
        // Batches arrive reversed; popping restores insertion order.
        Ok(self.buffer.pop().map(ObjectId::new))
    }

    /// Drain the remaining ids.
    pub fn collect_ids(mut self) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::new();
        while let Some(id) = self.next_id()? {
            ids.push(id);
        }
        Ok(ids)
    }
}
