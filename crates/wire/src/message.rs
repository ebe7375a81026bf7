//! Message model and body codec

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use smallvec::SmallVec;
use std::io::Cursor;
use tessera_core::{
    Handle, Result, TesseraError, Txid, TypeId, MAX_ATTACHMENTS, MAX_MSG_SIZE,
};

/// Request or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Client-to-server request.
    Request = 0,
    /// Server-to-client reply.
    Reply = 1,
}

impl MessageKind {
    fn from_u8(raw: u8) -> Result<MessageKind> {
        match raw {
            0 => Ok(MessageKind::Request),
            1 => Ok(MessageKind::Reply),
            other => Err(TesseraError::protocol(format!(
                "unknown message kind {other}"
            ))),
        }
    }
}

/// Session protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEvent {
    /// Establish a session; the reply attaches the segment handles.
    Connect = 1,
    /// Open a transaction; the reply carries the begin timestamp and a
    /// log stream handle.
    BeginTxn = 2,
    /// Abandon the open transaction; no reply.
    RollbackTxn = 3,
    /// Submit the open transaction; the request attaches the sealed log.
    CommitTxn = 4,
    /// The server decided to commit.
    DecideTxnCommit = 5,
    /// The server decided to abort.
    DecideTxnAbort = 6,
    /// Ask for a cursor stream; the reply attaches the stream handle.
    RequestStream = 7,
    /// Ask for more transaction memory.
    RequestMemory = 8,
    /// The client is going away.
    ClientShutdown = 9,
    /// The server is going away.
    ServerShutdown = 10,
}

impl SessionEvent {
    fn from_u8(raw: u8) -> Result<SessionEvent> {
        use SessionEvent::*;
        Ok(match raw {
            1 => Connect,
            2 => BeginTxn,
            3 => RollbackTxn,
            4 => CommitTxn,
            5 => DecideTxnCommit,
            6 => DecideTxnAbort,
            7 => RequestStream,
            8 => RequestMemory,
            9 => ClientShutdown,
            10 => ServerShutdown,
            other => {
                return Err(TesseraError::protocol(format!(
                    "unknown session event {other}"
                )))
            }
        })
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// A stack-allocator range as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireRange {
    /// First arena word of the range.
    pub offset: u64,
    /// Length in bytes.
    pub size: u64,
}

/// The discriminated message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageData {
    /// No payload.
    None,
    /// A table-scan cursor request.
    TableScan {
        /// Type to scan.
        type_id: TypeId,
    },
    /// Transaction info (begin or commit timestamp).
    TxnInfo {
        /// The timestamp.
        txn_id: Txid,
    },
    /// A memory request (hint) or grant (ranges).
    MemoryInfo {
        /// Requested bytes; zero in replies.
        size_hint: u64,
        /// Granted stack-allocator ranges; empty in requests.
        ranges: Vec<WireRange>,
    },
}

impl MessageData {
    fn discriminant(&self) -> u16 {
        match self {
            MessageData::None => 0,
            MessageData::TableScan { .. } => 1,
            MessageData::TxnInfo { .. } => 2,
            MessageData::MemoryInfo { .. } => 3,
        }
    }
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Request or reply.
    pub kind: MessageKind,
    /// The event.
    pub event: SessionEvent,
    /// The discriminated payload.
    pub data: MessageData,
    /// Attached resource handles (ownership transfers to the receiver).
    pub attachments: SmallVec<[Handle; 2]>,
}

impl Message {
    /// A request with no payload.
    pub fn request(event: SessionEvent) -> Message {
        Message {
            kind: MessageKind::Request,
            event,
            data: MessageData::None,
            attachments: SmallVec::new(),
        }
    }

    /// A reply with no payload.
    pub fn reply(event: SessionEvent) -> Message {
        Message {
            kind: MessageKind::Reply,
            event,
            data: MessageData::None,
            attachments: SmallVec::new(),
        }
    }

    /// This message with a payload.
    pub fn with_data(mut self, data: MessageData) -> Message {
        self.data = data;
        self
    }

    /// This message with one more attachment.
    pub fn with_attachment(mut self, handle: Handle) -> Message {
        self.attachments.push(handle);
        self
    }

    /// Encode to a body buffer (no length prefix).
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.attachments.len() > MAX_ATTACHMENTS {
            return Err(TesseraError::protocol(format!(
                "{} attachments exceed the limit of {MAX_ATTACHMENTS}",
                self.attachments.len()
            )));
        }
        let mut buf = Vec::with_capacity(32);
        buf.write_u8(self.kind as u8).expect("vec write");
        buf.write_u8(self.event as u8).expect("vec write");
        buf.write_u16::<LittleEndian>(self.data.discriminant())
            .expect("vec write");
        match &self.data {
            MessageData::None => {}
            MessageData::TableScan { type_id } => {
                buf.write_u32::<LittleEndian>(type_id.get()).expect("vec write");
            }
            MessageData::TxnInfo { txn_id } => {
                buf.write_u64::<LittleEndian>(txn_id.get()).expect("vec write");
            }
            MessageData::MemoryInfo { size_hint, ranges } => {
                buf.write_u64::<LittleEndian>(*size_hint).expect("vec write");
                buf.write_u16::<LittleEndian>(ranges.len() as u16)
                    .expect("vec write");
                for range in ranges {
                    buf.write_u64::<LittleEndian>(range.offset).expect("vec write");
                    buf.write_u64::<LittleEndian>(range.size).expect("vec write");
                }
            }
        }
        buf.write_u8(self.attachments.len() as u8).expect("vec write");
        for handle in &self.attachments {
            buf.write_u32::<LittleEndian>(handle.get()).expect("vec write");
        }
        if buf.len() > MAX_MSG_SIZE {
            return Err(TesseraError::protocol(format!(
                "message body of {} bytes exceeds the {MAX_MSG_SIZE}-byte cap",
                buf.len()
            )));
        }
        Ok(buf)
    }

    /// Decode a body buffer.
    pub fn decode(body: &[u8]) -> Result<Message> {
        let mut cursor = Cursor::new(body);
        let short = |_| TesseraError::protocol("truncated message body");

        let kind = MessageKind::from_u8(cursor.read_u8().map_err(short)?)?;
        let event = SessionEvent::from_u8(cursor.read_u8().map_err(short)?)?;
        let discriminant = cursor.read_u16::<LittleEndian>().map_err(short)?;
        let data = match discriminant {
            0 => MessageData::None,
            1 => MessageData::TableScan {
                type_id: TypeId::new(cursor.read_u32::<LittleEndian>().map_err(short)?),
            },
            2 => MessageData::TxnInfo {
                txn_id: Txid::new(cursor.read_u64::<LittleEndian>().map_err(short)?),
            },
            3 => {
                let size_hint = cursor.read_u64::<LittleEndian>().map_err(short)?;
                let count = cursor.read_u16::<LittleEndian>().map_err(short)?;
                let mut ranges = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    ranges.push(WireRange {
                        offset: cursor.read_u64::<LittleEndian>().map_err(short)?,
                        size: cursor.read_u64::<LittleEndian>().map_err(short)?,
                    });
                }
                MessageData::MemoryInfo { size_hint, ranges }
            }
            other => {
                return Err(TesseraError::protocol(format!(
                    "unknown data discriminant {other}"
                )))
            }
        };

        let attachment_count = cursor.read_u8().map_err(short)? as usize;
        if attachment_count > MAX_ATTACHMENTS {
            return Err(TesseraError::protocol(format!(
                "{attachment_count} attachments exceed the limit of {MAX_ATTACHMENTS}"
            )));
        }
        let mut attachments = SmallVec::new();
        for _ in 0..attachment_count {
            attachments.push(Handle::new(
                cursor.read_u32::<LittleEndian>().map_err(short)?,
            ));
        }
        if cursor.position() != body.len() as u64 {
            return Err(TesseraError::protocol("trailing bytes in message body"));
        }
        Ok(Message {
            kind,
            event,
            data,
            attachments,
        })
    }
}
