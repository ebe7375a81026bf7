//! Session wire protocol
//!
//! Fixed little-endian binary messages over a Unix-domain stream socket.
//! Message bodies follow the layout
//!
//! ```text
//! offset 0  u8   kind (0 = request, 1 = reply)
//! offset 1  u8   event code
//! offset 2  u16  data discriminant (0 none, 1 table-scan, 2 txn-info,
//!                3 memory-info)
//! offset 4  ..   discriminant payload
//! then      u8   attachment count, u32 handle per attachment
//! ```
//!
//! Frames are length-prefixed (u32) because a stream socket does not
//! preserve datagram boundaries; the body is capped at 4 KiB and a message
//! carries at most 16 handle attachments. Cursor streams use a separate
//! count-prefixed batch frame of fixed-width elements so per-batch reversal
//! survives the stream transport.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame;
pub mod message;

pub use frame::{recv_batch, recv_message, send_batch, send_message};
pub use message::{Message, MessageData, MessageKind, SessionEvent, WireRange};
