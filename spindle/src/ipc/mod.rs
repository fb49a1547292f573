//! Inter-unit transport: envelope codec, datagram pipes and payload spooling.
//!
//! Every message between the reactor thread, the supervisor and the workers
//! is an [`Envelope`]: a 32-byte header followed by at most
//! [`IPC_BUFFER_SIZE`] payload bytes, sent as one Unix datagram.
//!
//! ```text
//!  0        8     12   13    14       16       18       20     24       32
//!  +--------+------+----+-----+--------+--------+--------+------+--------+
//!  |   fd   | len  |kind|flags|ext_flag| source | target | aux  |  time  |
//!  +--------+------+----+-----+--------+--------+--------+------+--------+
//! ```
//!
//! Connection payloads that do not fit are split with [`Envelope::chunks`]
//! and rebuilt by an [`Assembler`]; task payloads are spooled to a temp file
//! instead ([`spool`]).
//!
//! The reactor thread never blocks on a full pipe: it sends through an
//! [`Outbox`] that holds the overflow until the pipe polls writable.

mod envelope;
mod outbox;
mod pipe;
pub mod spool;

pub use envelope::{
    Assembler, CHUNK_BEGIN, CHUNK_END, CLOSE_RESET, Envelope, HEADER_LEN, Header, IPC_BUFFER_SIZE,
    IPC_MAX_SIZE, Kind, TaskFlags,
};
pub(crate) use envelope::unix_time;
pub use outbox::Outbox;
pub use pipe::{Pipe, SEND_TIMEOUT};
