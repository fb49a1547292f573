use crate::error::IpcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Fixed header size on the wire.
pub const HEADER_LEN: usize = 32;
/// Largest datagram exchanged between execution units.
pub const IPC_MAX_SIZE: usize = 8192;
/// Largest payload carried inline by a single envelope.
pub const IPC_BUFFER_SIZE: usize = IPC_MAX_SIZE - HEADER_LEN;

/// Header flag: first chunk of a split payload.
pub const CHUNK_BEGIN: u8 = 1;
/// Header flag: last chunk of a split payload.
pub const CHUNK_END: u8 = 1 << 1;
/// Header flag on close requests: reset instead of a graceful shutdown.
pub const CLOSE_RESET: u8 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Kind {
    // reactor thread -> event worker
    Connect = 1,
    Receive = 2,
    Close = 3,
    Packet = 4,
    BufferFull = 5,
    BufferEmpty = 6,
    // event worker -> reactor thread
    Response = 10,
    SendTo = 11,
    CloseRequest = 12,
    Pause = 13,
    Resume = 14,
    // between workers
    Task = 20,
    Finish = 21,
    PipeMessage = 22,
    Command = 30,
    CommandResponse = 31,
    // supervision
    Stop = 40,
    WorkerStopping = 41,
    WorkerExited = 42,
    Reload = 43,
    Shutdown = 44,
}

impl Kind {
    fn from_u8(v: u8) -> Option<Kind> {
        Some(match v {
            1 => Kind::Connect,
            2 => Kind::Receive,
            3 => Kind::Close,
            4 => Kind::Packet,
            5 => Kind::BufferFull,
            6 => Kind::BufferEmpty,
            10 => Kind::Response,
            11 => Kind::SendTo,
            12 => Kind::CloseRequest,
            13 => Kind::Pause,
            14 => Kind::Resume,
            20 => Kind::Task,
            21 => Kind::Finish,
            22 => Kind::PipeMessage,
            30 => Kind::Command,
            31 => Kind::CommandResponse,
            40 => Kind::Stop,
            41 => Kind::WorkerStopping,
            42 => Kind::WorkerExited,
            43 => Kind::Reload,
            44 => Kind::Shutdown,
            _ => return None,
        })
    }

    /// Kinds whose `fd` is a session id.
    pub fn is_session(self) -> bool {
        matches!(
            self,
            Kind::Connect
                | Kind::Receive
                | Kind::Close
                | Kind::BufferFull
                | Kind::BufferEmpty
                | Kind::Response
                | Kind::CloseRequest
        )
    }
}

/// Task transport flags carried in the header.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TaskFlags(u16);

impl TaskFlags {
    pub const SERIALIZE: TaskFlags = TaskFlags(1);
    pub const NOREPLY: TaskFlags = TaskFlags(1 << 1);
    pub const NONBLOCK: TaskFlags = TaskFlags(1 << 2);
    pub const WAITALL: TaskFlags = TaskFlags(1 << 3);
    pub const COROUTINE: TaskFlags = TaskFlags(1 << 4);
    pub const CALLBACK: TaskFlags = TaskFlags(1 << 5);
    /// Leave the spool file in place after reading it.
    pub const PEEK: TaskFlags = TaskFlags(1 << 6);
    pub const TMPFILE: TaskFlags = TaskFlags(1 << 7);
    /// The task worker could not run the task; the result carries no data.
    pub const FAILED: TaskFlags = TaskFlags(1 << 8);

    pub const fn empty() -> Self {
        TaskFlags(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        TaskFlags(bits)
    }

    pub fn contains(self, other: TaskFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: TaskFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: TaskFlags) {
        self.0 &= !other.0;
    }

    pub fn without(self, other: TaskFlags) -> TaskFlags {
        TaskFlags(self.0 & !other.0)
    }
}

impl BitOr for TaskFlags {
    type Output = TaskFlags;
    fn bitor(self, rhs: TaskFlags) -> TaskFlags {
        TaskFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for TaskFlags {
    fn bitor_assign(&mut self, rhs: TaskFlags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for TaskFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(TaskFlags, &str); 9] = [
            (TaskFlags::SERIALIZE, "SERIALIZE"),
            (TaskFlags::NOREPLY, "NOREPLY"),
            (TaskFlags::NONBLOCK, "NONBLOCK"),
            (TaskFlags::WAITALL, "WAITALL"),
            (TaskFlags::COROUTINE, "COROUTINE"),
            (TaskFlags::CALLBACK, "CALLBACK"),
            (TaskFlags::PEEK, "PEEK"),
            (TaskFlags::TMPFILE, "TMPFILE"),
            (TaskFlags::FAILED, "FAILED"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "TaskFlags({})", set.join("|"))
    }
}

/// Fixed-size envelope header.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    /// Session id, task id or request id depending on `kind`.
    pub fd: i64,
    pub len: u32,
    pub kind: Kind,
    pub flags: u8,
    pub ext_flags: TaskFlags,
    /// Sending worker or reactor id.
    pub source: u16,
    /// Listener index, command id or destination, depending on `kind`.
    pub target: u16,
    /// Kind-specific extra word.
    pub aux: u32,
    /// Seconds since the epoch when the envelope was created.
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub payload: Bytes,
}

pub(crate) fn unix_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Envelope {
    pub fn new(kind: Kind, fd: i64, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        Self {
            header: Header {
                fd,
                len: payload.len() as u32,
                kind,
                flags: CHUNK_BEGIN | CHUNK_END,
                ext_flags: TaskFlags::empty(),
                source: 0,
                target: 0,
                aux: 0,
                time: unix_time(),
            },
            payload,
        }
    }

    /// Envelope without payload.
    pub fn control(kind: Kind, fd: i64) -> Self {
        Self::new(kind, fd, Bytes::new())
    }

    pub fn with_source(mut self, source: u16) -> Self {
        self.header.source = source;
        self
    }

    pub fn with_target(mut self, target: u16) -> Self {
        self.header.target = target;
        self
    }

    pub fn with_aux(mut self, aux: u32) -> Self {
        self.header.aux = aux;
        self
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.header.flags |= flags;
        self
    }

    pub fn with_task_flags(mut self, flags: TaskFlags) -> Self {
        self.header.ext_flags = flags;
        self
    }

    pub fn kind(&self) -> Kind {
        self.header.kind
    }

    pub fn encode(&self) -> Result<BytesMut, IpcError> {
        if self.payload.len() > IPC_BUFFER_SIZE {
            return Err(IpcError::TooLarge(self.payload.len()));
        }
        let h = &self.header;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_i64_le(h.fd);
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_u8(h.kind as u8);
        buf.put_u8(h.flags);
        buf.put_u16_le(h.ext_flags.bits());
        buf.put_u16_le(h.source);
        buf.put_u16_le(h.target);
        buf.put_u32_le(h.aux);
        buf.put_f64_le(h.time);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, IpcError> {
        if buf.len() < HEADER_LEN {
            return Err(IpcError::Malformed("short header"));
        }
        let fd = buf.get_i64_le();
        let len = buf.get_u32_le();
        let kind = Kind::from_u8(buf.get_u8()).ok_or(IpcError::Malformed("unknown kind"))?;
        let flags = buf.get_u8();
        let ext_flags = TaskFlags::from_bits(buf.get_u16_le());
        let source = buf.get_u16_le();
        let target = buf.get_u16_le();
        let aux = buf.get_u32_le();
        let time = buf.get_f64_le();
        if buf.len() != len as usize {
            return Err(IpcError::Malformed("length mismatch"));
        }
        Ok(Self {
            header: Header {
                fd,
                len,
                kind,
                flags,
                ext_flags,
                source,
                target,
                aux,
                time,
            },
            payload: Bytes::copy_from_slice(buf),
        })
    }

    /// Split `data` into envelopes that each fit a datagram.
    pub fn chunks(kind: Kind, fd: i64, data: Bytes) -> Vec<Envelope> {
        if data.len() <= IPC_BUFFER_SIZE {
            return vec![Envelope::new(kind, fd, data)];
        }
        let count = data.len().div_ceil(IPC_BUFFER_SIZE);
        (0..count)
            .map(|i| {
                let start = i * IPC_BUFFER_SIZE;
                let end = (start + IPC_BUFFER_SIZE).min(data.len());
                let mut env = Envelope::new(kind, fd, data.slice(start..end));
                env.header.flags = 0;
                if i == 0 {
                    env.header.flags |= CHUNK_BEGIN;
                }
                if i + 1 == count {
                    env.header.flags |= CHUNK_END;
                }
                env
            })
            .collect()
    }
}

/// Reassembles chunked payloads, keyed by kind, sender and descriptor.
///
/// The `fd` of an envelope means a session id, a message id or a request id
/// depending on its kind, so the kind is part of the key.
#[derive(Default)]
pub struct Assembler {
    partial: HashMap<(Kind, u16, i64), (Header, BytesMut)>,
}

impl Assembler {
    /// Feed one envelope; returns the complete payload once its last chunk arrives.
    pub fn push(&mut self, env: Envelope) -> Option<(Header, Bytes)> {
        let begin = env.header.flags & CHUNK_BEGIN != 0;
        let end = env.header.flags & CHUNK_END != 0;
        let key = (env.header.kind, env.header.source, env.header.fd);
        match (begin, end) {
            (true, true) => Some((env.header, env.payload)),
            (true, false) => {
                let mut buf = BytesMut::with_capacity(env.payload.len() * 2);
                buf.extend_from_slice(&env.payload);
                if self.partial.insert(key, (env.header, buf)).is_some() {
                    warn!(kind = ?key.0, source = key.1, fd = key.2, "unfinished chunked payload replaced");
                }
                None
            }
            (false, _) => {
                let Some((_, buf)) = self.partial.get_mut(&key) else {
                    warn!(kind = ?key.0, source = key.1, fd = key.2, "chunk without a beginning dropped");
                    return None;
                };
                buf.extend_from_slice(&env.payload);
                if !end {
                    return None;
                }
                let (mut header, buf) = self.partial.remove(&key)?;
                header.len = buf.len() as u32;
                header.flags = CHUNK_BEGIN | CHUNK_END;
                Some((header, buf.freeze()))
            }
        }
    }

    /// Drop partial connection payloads of a closed session. Messages and
    /// command traffic that happen to share the id are kept.
    pub fn discard(&mut self, session_id: i64) {
        self.partial
            .retain(|(kind, _, fd), _| !(kind.is_session() && *fd == session_id));
    }

    pub fn len(&self) -> usize {
        self.partial.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partial.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_fields_survive_encoding() {
        let env = Envelope::new(Kind::Task, 42 << 40 | 7, Bytes::from_static(b"payload"))
            .with_source(3)
            .with_target(1)
            .with_aux(9)
            .with_task_flags(TaskFlags::NONBLOCK | TaskFlags::COROUTINE);
        let wire = env.encode().unwrap();
        assert_eq!(wire.len(), HEADER_LEN + 7);
        let back = Envelope::decode(&wire).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            Envelope::decode(&[0u8; 8]),
            Err(IpcError::Malformed("short header"))
        ));
        let mut wire = Envelope::new(Kind::Receive, 1, Bytes::from_static(b"abc"))
            .encode()
            .unwrap();
        wire.truncate(wire.len() - 1);
        assert!(matches!(
            Envelope::decode(&wire),
            Err(IpcError::Malformed("length mismatch"))
        ));
        let mut wire = Envelope::control(Kind::Stop, 0).encode().unwrap();
        wire[12] = 200;
        assert!(matches!(
            Envelope::decode(&wire),
            Err(IpcError::Malformed("unknown kind"))
        ));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let env = Envelope::new(Kind::Response, 1, vec![0u8; IPC_BUFFER_SIZE + 1]);
        assert!(matches!(env.encode(), Err(IpcError::TooLarge(_))));
    }

    #[test]
    fn test_chunks_reassemble_interleaved() {
        let a: Bytes = (0..IPC_BUFFER_SIZE * 2 + 10).map(|i| i as u8).collect();
        let b: Bytes = vec![7u8; IPC_BUFFER_SIZE + 1].into();
        let chunks_a = Envelope::chunks(Kind::Response, 5, a.clone());
        let chunks_b: Vec<_> = Envelope::chunks(Kind::Response, 5, b.clone())
            .into_iter()
            .map(|e| e.with_source(1))
            .collect();
        assert_eq!(chunks_a.len(), 3);
        assert_eq!(chunks_b.len(), 2);

        let mut asm = Assembler::default();
        let mut done = Vec::new();
        let mut ia = chunks_a.into_iter();
        let mut ib = chunks_b.into_iter();
        loop {
            let (na, nb) = (ia.next(), ib.next());
            if na.is_none() && nb.is_none() {
                break;
            }
            for env in [na, nb].into_iter().flatten() {
                if let Some((header, payload)) = asm.push(env) {
                    done.push((header.source, payload));
                }
            }
        }
        assert_eq!(done, vec![(1, b), (0, a)]);
        assert!(asm.is_empty());
    }

    #[test]
    fn test_kinds_sharing_source_and_id_stay_apart() {
        let received: Bytes = (0..20_000).map(|i| i as u8).collect();
        let message: Bytes = vec![9u8; 10_000].into();
        let mut streams = [
            Envelope::chunks(Kind::Receive, 1, received.clone()).into_iter(),
            Envelope::chunks(Kind::PipeMessage, 1, message.clone()).into_iter(),
        ];

        let mut asm = Assembler::default();
        let mut done = Vec::new();
        // R0 M0 R1 M1 R2
        for turn in [0, 1, 0, 1, 0] {
            if let Some(env) = streams[turn].next()
                && let Some((header, payload)) = asm.push(env)
            {
                done.push((header.kind, payload));
            }
        }
        assert_eq!(
            done,
            vec![(Kind::PipeMessage, message), (Kind::Receive, received)]
        );
        assert!(asm.is_empty());
    }

    #[test]
    fn test_discard_keeps_non_session_partials() {
        let mut asm = Assembler::default();
        let data: Bytes = vec![1u8; IPC_BUFFER_SIZE + 1].into();
        let mut receive = Envelope::chunks(Kind::Receive, 4, data.clone());
        let mut message = Envelope::chunks(Kind::PipeMessage, 4, data.clone());
        let mut command = Envelope::chunks(Kind::Command, 4, data.clone());
        assert!(asm.push(receive.remove(0)).is_none());
        assert!(asm.push(message.remove(0)).is_none());
        assert!(asm.push(command.remove(0)).is_none());
        assert_eq!(asm.len(), 3);

        asm.discard(4);
        assert_eq!(asm.len(), 2);
        assert!(asm.push(receive.remove(0)).is_none());
        let (header, payload) = asm.push(message.remove(0)).unwrap();
        assert_eq!(header.kind, Kind::PipeMessage);
        assert_eq!(payload, data);
        let (header, _) = asm.push(command.remove(0)).unwrap();
        assert_eq!(header.kind, Kind::Command);
    }

    #[test]
    fn test_orphan_chunk_dropped() {
        let mut asm = Assembler::default();
        let mut env = Envelope::new(Kind::Response, 1, Bytes::from_static(b"tail"));
        env.header.flags = CHUNK_END;
        assert!(asm.push(env).is_none());
    }
}
