//! Length-prefixed framing
//!
//! Messages travel as `u32 length || body` frames; cursor batches as
//! `u32 count || count * u64` frames. A clean EOF between frames maps to
//! `None`; EOF inside a frame is a protocol error (a torn frame means the
//! peer died mid-send, which a datagram transport would never deliver).

use crate::message::Message;
use byteorder::{ByteOrder, LittleEndian};
use std::io::{ErrorKind, Read, Write};
use tessera_core::{Result, TesseraError, MAX_MSG_SIZE, STREAM_BATCH_SIZE};

fn io(context: &str, e: std::io::Error) -> TesseraError {
    TesseraError::io(context, e)
}

/// Read exactly `buf.len()` bytes, or detect clean EOF before the first
/// byte.
fn read_exact_or_eof(stream: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(TesseraError::protocol("torn frame: peer closed mid-send"));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(io("read frame", e)),
        }
    }
    Ok(true)
}

/// Send one message frame.
pub fn send_message(stream: &mut impl Write, message: &Message) -> Result<()> {
    let body = message.encode()?;
    let mut len = [0u8; 4];
    LittleEndian::write_u32(&mut len, body.len() as u32);
    stream.write_all(&len).map_err(|e| io("send frame", e))?;
    stream.write_all(&body).map_err(|e| io("send frame", e))?;
    stream.flush().map_err(|e| io("send frame", e))?;
    Ok(())
}

/// Receive one message frame; `None` on clean EOF.
pub fn recv_message(stream: &mut impl Read) -> Result<Option<Message>> {
    let mut len = [0u8; 4];
    if !read_exact_or_eof(stream, &mut len)? {
        return Ok(None);
    }
    let len = LittleEndian::read_u32(&len) as usize;
    if len > MAX_MSG_SIZE {
        return Err(TesseraError::protocol(format!(
            "frame of {len} bytes exceeds the {MAX_MSG_SIZE}-byte cap"
        )));
    }
    let mut body = vec![0u8; len];
    if !read_exact_or_eof(stream, &mut body)? {
        return Err(TesseraError::protocol("torn frame: empty body"));
    }
    Message::decode(&body).map(Some)
}

/// Send one cursor batch frame.
pub fn send_batch(stream: &mut impl Write, elements: &[u64]) -> Result<()> {
    debug_assert!(elements.len() <= STREAM_BATCH_SIZE);
    let mut buf = Vec::with_capacity(4 + elements.len() * 8);
    let mut count = [0u8; 4];
    LittleEndian::write_u32(&mut count, elements.len() as u32);
    buf.extend_from_slice(&count);
    for element in elements {
        let mut word = [0u8; 8];
        LittleEndian::write_u64(&mut word, *element);
        buf.extend_from_slice(&word);
    }
    stream.write_all(&buf).map_err(|e| io("send batch", e))?;
    stream.flush().map_err(|e| io("send batch", e))?;
    Ok(())
}

/// Receive one cursor batch frame; `None` on clean EOF.
pub fn recv_batch(stream: &mut impl Read) -> Result<Option<Vec<u64>>> {
    let mut count = [0u8; 4];
    if !read_exact_or_eof(stream, &mut count)? {
        return Ok(None);
    }
    let count = LittleEndian::read_u32(&count) as usize;
    if count > STREAM_BATCH_SIZE {
        return Err(TesseraError::protocol(format!(
            "batch of {count} elements exceeds the {STREAM_BATCH_SIZE}-element cap"
        )));
    }
    let mut bytes = vec![0u8; count * 8];
    if !read_exact_or_eof(stream, &mut bytes)? {
        return Err(TesseraError::protocol("torn batch frame"));
    }
    Ok(Some(
        bytes.chunks_exact(8).map(LittleEndian::read_u64).collect(),
    ))
}
