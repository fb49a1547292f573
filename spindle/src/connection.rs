//! Registry of live connections.
//!
//! The reactor thread creates and destroys [`Connection`]s; workers read them
//! through the shared [`ConnectionTable`] and flip the few fields they own
//! (uid, protect) atomically.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Logical connection id, distinct from the descriptor.
pub type SessionId = i64;

/// Ratio between the session id space and `max_connection`.
pub const SESSION_SPACE_FACTOR: i64 = 4;

const NO_WORKER: u32 = u32::MAX;

pub(crate) fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocketType {
    Tcp,
    Tcp6,
    Udp,
    Udp6,
    UnixStream,
    UnixDgram,
}

impl SocketType {
    pub fn is_stream(self) -> bool {
        matches!(self, SocketType::Tcp | SocketType::Tcp6 | SocketType::UnixStream)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Inet(SocketAddr),
    Unix(Option<PathBuf>),
}

impl PeerAddr {
    /// Hash of the source address used by ip-modulo dispatch.
    pub fn ip_hash(&self) -> u32 {
        match self {
            PeerAddr::Inet(SocketAddr::V4(v4)) => u32::from(*v4.ip()),
            PeerAddr::Inet(SocketAddr::V6(v6)) => v6
                .ip()
                .octets()
                .chunks(4)
                .fold(0u32, |acc, c| acc ^ u32::from_be_bytes([c[0], c[1], c[2], c[3]])),
            PeerAddr::Unix(_) => 0,
        }
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Unix(Some(path)) => write!(f, "unix:{}", path.display()),
            PeerAddr::Unix(None) => write!(f, "unix:unnamed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CloseReason {
    None = 0,
    /// Peer closed or the socket failed.
    Peer = 1,
    /// A worker asked for the close.
    Server = 2,
    Heartbeat = 3,
    /// The dispatch function rejected the connection.
    Dispatch = 4,
    Shutdown = 5,
    /// The reactor thread could not queue more input for the worker.
    Overload = 6,
}

impl CloseReason {
    pub(crate) fn from_u8(v: u8) -> CloseReason {
        match v {
            1 => CloseReason::Peer,
            2 => CloseReason::Server,
            3 => CloseReason::Heartbeat,
            4 => CloseReason::Dispatch,
            5 => CloseReason::Shutdown,
            6 => CloseReason::Overload,
            _ => CloseReason::None,
        }
    }
}

#[derive(Debug)]
pub struct Connection {
    pub session_id: SessionId,
    pub fd: RawFd,
    /// Index of the listener the connection arrived on.
    pub listener: u16,
    pub socket_type: SocketType,
    pub remote: PeerAddr,
    pub connect_time: u64,
    worker_id: AtomicU32,
    uid: AtomicU32,
    uid_lock: Mutex<()>,
    protect: AtomicBool,
    closing: AtomicBool,
    paused: AtomicBool,
    buffer_full: AtomicBool,
    close_reason: AtomicU8,
    last_recv_time: AtomicU64,
    last_send_time: AtomicU64,
    last_dispatch_time: AtomicU64,
    queued_bytes: AtomicU64,
    recv_bytes: AtomicU64,
    send_bytes: AtomicU64,
}

impl Connection {
    pub fn new(
        session_id: SessionId,
        fd: RawFd,
        listener: u16,
        socket_type: SocketType,
        remote: PeerAddr,
    ) -> Self {
        let now = unix_micros();
        Self {
            session_id,
            fd,
            listener,
            socket_type,
            remote,
            connect_time: now,
            worker_id: AtomicU32::new(NO_WORKER),
            uid: AtomicU32::new(0),
            uid_lock: Mutex::new(()),
            protect: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            buffer_full: AtomicBool::new(false),
            close_reason: AtomicU8::new(CloseReason::None as u8),
            last_recv_time: AtomicU64::new(now),
            last_send_time: AtomicU64::new(0),
            last_dispatch_time: AtomicU64::new(0),
            queued_bytes: AtomicU64::new(0),
            recv_bytes: AtomicU64::new(0),
            send_bytes: AtomicU64::new(0),
        }
    }

    /// Worker the connection was last dispatched to.
    pub fn worker_id(&self) -> Option<u32> {
        match self.worker_id.load(Ordering::Acquire) {
            NO_WORKER => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_worker_id(&self, worker_id: u32) {
        self.worker_id.store(worker_id, Ordering::Release);
        self.last_dispatch_time.store(unix_micros(), Ordering::Relaxed);
    }

    pub fn uid(&self) -> u32 {
        self.uid.load(Ordering::Acquire)
    }

    /// Bind `uid` to the connection. The first writer wins; later attempts
    /// observe a non-zero uid and fail.
    pub fn bind_uid(&self, uid: u32) -> bool {
        if uid == 0 {
            return false;
        }
        let _guard = self.uid_lock.lock();
        if self.uid.load(Ordering::Acquire) != 0 {
            return false;
        }
        self.uid.store(uid, Ordering::Release);
        true
    }

    pub fn is_protected(&self) -> bool {
        self.protect.load(Ordering::Acquire)
    }

    pub fn set_protect(&self, protect: bool) {
        self.protect.store(protect, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Mark closing; returns false if it already was.
    pub(crate) fn begin_close(&self, reason: CloseReason) -> bool {
        let first = !self.closing.swap(true, Ordering::AcqRel);
        if first {
            self.close_reason.store(reason as u8, Ordering::Release);
        }
        first
    }

    pub fn close_reason(&self) -> CloseReason {
        CloseReason::from_u8(self.close_reason.load(Ordering::Acquire))
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub(crate) fn set_buffer_full(&self, full: bool) -> bool {
        self.buffer_full.swap(full, Ordering::AcqRel)
    }

    pub fn last_recv_time(&self) -> u64 {
        self.last_recv_time.load(Ordering::Relaxed)
    }

    pub(crate) fn touch_recv(&self, bytes: usize) {
        self.last_recv_time.store(unix_micros(), Ordering::Relaxed);
        self.recv_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn touch_send(&self, bytes: usize) {
        self.last_send_time.store(unix_micros(), Ordering::Relaxed);
        self.send_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn queued_bytes(&self) -> u64 {
        self.queued_bytes.load(Ordering::Acquire)
    }

    pub(crate) fn add_queued(&self, bytes: usize) -> u64 {
        self.queued_bytes.fetch_add(bytes as u64, Ordering::AcqRel) + bytes as u64
    }

    pub(crate) fn sub_queued(&self, bytes: usize) -> u64 {
        let bytes = bytes as u64;
        let prev = self
            .queued_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |q| Some(q.saturating_sub(bytes)))
            .unwrap_or(0);
        prev.saturating_sub(bytes)
    }

    #[cfg(test)]
    pub(crate) fn set_last_recv(&self, micros: u64) {
        self.last_recv_time.store(micros, Ordering::Relaxed);
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            session_id: self.session_id,
            fd: self.fd,
            listener: self.listener,
            socket_type: self.socket_type,
            remote: self.remote.to_string(),
            worker_id: self.worker_id(),
            uid: self.uid(),
            protect: self.is_protected(),
            paused: self.is_paused(),
            connect_time: self.connect_time,
            last_recv_time: self.last_recv_time(),
            last_send_time: self.last_send_time.load(Ordering::Relaxed),
            last_dispatch_time: self.last_dispatch_time.load(Ordering::Relaxed),
            recv_bytes: self.recv_bytes.load(Ordering::Relaxed),
            send_bytes: self.send_bytes.load(Ordering::Relaxed),
            queued_bytes: self.queued_bytes(),
        }
    }
}

/// Point-in-time copy of a connection's state.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub session_id: SessionId,
    pub fd: RawFd,
    pub listener: u16,
    pub socket_type: SocketType,
    pub remote: String,
    pub worker_id: Option<u32>,
    pub uid: u32,
    pub protect: bool,
    pub paused: bool,
    pub connect_time: u64,
    pub last_recv_time: u64,
    pub last_send_time: u64,
    pub last_dispatch_time: u64,
    pub recv_bytes: u64,
    pub send_bytes: u64,
    pub queued_bytes: u64,
}

/// Monotonic session id source over a bounded space.
#[derive(Debug)]
pub struct SessionAllocator {
    start: SessionId,
    span: i64,
    next: SessionId,
    round: u64,
}

impl SessionAllocator {
    pub fn new(start: SessionId, span: i64) -> Self {
        let span = span.max(1);
        Self {
            start,
            span,
            next: start,
            round: 0,
        }
    }

    /// Next id not reported live by `is_live`, or `None` if every id is in use.
    pub fn allocate(&mut self, is_live: impl Fn(SessionId) -> bool) -> Option<SessionId> {
        for _ in 0..self.span {
            let id = self.next;
            self.next += 1;
            if self.next >= self.start + self.span {
                self.next = self.start;
                self.round += 1;
            }
            if !is_live(id) {
                return Some(id);
            }
        }
        None
    }

    /// Number of times the id space wrapped.
    pub fn round(&self) -> u64 {
        self.round
    }
}

/// Sessions whose idle time strictly exceeds `idle`, skipping protected and
/// unbound (`session_id <= 0`) connections.
pub fn heartbeat_sweep<'a>(
    connections: impl IntoIterator<Item = &'a Connection>,
    now_micros: u64,
    idle: Duration,
) -> Vec<SessionId> {
    let idle = idle.as_micros() as u64;
    connections
        .into_iter()
        .filter(|c| c.session_id > 0 && !c.is_protected() && !c.is_closing())
        .filter(|c| now_micros.saturating_sub(c.last_recv_time()) > idle)
        .map(|c| c.session_id)
        .collect()
}

struct TableInner {
    by_session: HashMap<SessionId, Arc<Connection>>,
    by_fd: HashMap<RawFd, SessionId>,
    allocator: SessionAllocator,
}

/// Live connections indexed by session id and by descriptor.
pub struct ConnectionTable {
    inner: RwLock<TableInner>,
    max_connection: usize,
}

impl ConnectionTable {
    pub fn new(max_connection: usize, start_session_id: SessionId) -> Self {
        let span = (max_connection as i64)
            .saturating_mul(SESSION_SPACE_FACTOR)
            .max(1024);
        Self {
            inner: RwLock::new(TableInner {
                by_session: HashMap::new(),
                by_fd: HashMap::new(),
                allocator: SessionAllocator::new(start_session_id, span),
            }),
            max_connection,
        }
    }

    pub fn max_connection(&self) -> usize {
        self.max_connection
    }

    /// Register an accepted socket. Returns `None` when the table is full.
    pub fn insert(
        &self,
        fd: RawFd,
        listener: u16,
        socket_type: SocketType,
        remote: PeerAddr,
    ) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write();
        if inner.by_session.len() >= self.max_connection {
            return None;
        }
        let TableInner {
            by_session,
            by_fd,
            allocator,
        } = &mut *inner;
        let session_id = allocator.allocate(|id| by_session.contains_key(&id))?;
        let conn = Arc::new(Connection::new(session_id, fd, listener, socket_type, remote));
        by_session.insert(session_id, conn.clone());
        by_fd.insert(fd, session_id);
        Some(conn)
    }

    pub fn remove(&self, session_id: SessionId) -> Option<Arc<Connection>> {
        let mut inner = self.inner.write();
        let conn = inner.by_session.remove(&session_id)?;
        if inner.by_fd.get(&conn.fd) == Some(&session_id) {
            inner.by_fd.remove(&conn.fd);
        }
        Some(conn)
    }

    pub fn get(&self, session_id: SessionId) -> Option<Arc<Connection>> {
        let inner = self.inner.read();
        inner.by_session.get(&session_id).cloned()
    }

    pub fn by_fd(&self, fd: RawFd) -> Option<Arc<Connection>> {
        let inner = self.inner.read();
        let session_id = inner.by_fd.get(&fd)?;
        inner.by_session.get(session_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live session ids in ascending order.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let inner = self.inner.read();
        let mut ids: Vec<_> = inner.by_session.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let inner = self.inner.read();
        inner.by_session.values().cloned().collect()
    }

    pub fn session_round(&self) -> u64 {
        self.inner.read().allocator.round()
    }

    /// Lowest and highest live descriptors.
    pub fn fd_range(&self) -> Option<(RawFd, RawFd)> {
        let inner = self.inner.read();
        let min = inner.by_fd.keys().min()?;
        let max = inner.by_fd.keys().max()?;
        Some((*min, *max))
    }

    pub fn idle_sessions(&self, now_micros: u64, idle: Duration) -> Vec<SessionId> {
        let snapshot = self.snapshot();
        let mut ids = heartbeat_sweep(snapshot.iter().map(|c| c.as_ref()), now_micros, idle);
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::sync::Barrier;

    fn inet(last: u8) -> PeerAddr {
        PeerAddr::Inet(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), 4000)))
    }

    fn conn(session_id: SessionId) -> Connection {
        Connection::new(session_id, session_id as RawFd + 100, 0, SocketType::Tcp, inet(1))
    }

    #[test]
    fn test_concurrent_uid_bind_first_writer_wins() {
        for _ in 0..50 {
            let c = Arc::new(conn(1));
            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = [7u32, 9u32]
                .into_iter()
                .map(|uid| {
                    let c = c.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        c.bind_uid(uid)
                    })
                })
                .collect();
            let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
            let winner = if results[0] { 7 } else { 9 };
            assert_eq!(c.uid(), winner);
        }
    }

    #[test]
    fn test_bind_zero_uid_rejected() {
        let c = conn(1);
        assert!(!c.bind_uid(0));
        assert!(c.bind_uid(3));
        assert!(!c.bind_uid(3));
    }

    #[test]
    fn test_heartbeat_sweep() {
        let now = unix_micros();
        let idle = Duration::from_secs(10);
        let fresh = conn(1);
        let stale = conn(2);
        stale.set_last_recv(now - 11_000_000);
        let protected = conn(3);
        protected.set_last_recv(now - 60_000_000);
        protected.set_protect(true);
        let unbound = conn(0);
        unbound.set_last_recv(now - 60_000_000);
        let boundary = conn(4);
        boundary.set_last_recv(now - 10_000_000);

        let all = [fresh, stale, protected, unbound, boundary];
        assert_eq!(heartbeat_sweep(all.iter(), now, idle), vec![2]);
    }

    #[test]
    fn test_allocator_wraps_and_skips_live() {
        let mut alloc = SessionAllocator::new(1, 4);
        let live = [2i64, 3];
        let ids: Vec<_> = (0..3)
            .map(|_| alloc.allocate(|id| live.contains(&id)).unwrap())
            .collect();
        assert_eq!(ids, vec![1, 4, 1]);
        assert_eq!(alloc.round(), 1);
        assert_eq!(alloc.allocate(|_| true), None);
    }

    #[test]
    fn test_table_indexes_and_capacity() {
        let table = ConnectionTable::new(2, 1);
        let a = table.insert(10, 0, SocketType::Tcp, inet(1)).unwrap();
        let b = table.insert(11, 0, SocketType::Tcp, inet(2)).unwrap();
        assert!(table.insert(12, 0, SocketType::Tcp, inet(3)).is_none());
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(table.by_fd(11).unwrap().session_id, b.session_id);
        assert_eq!(table.fd_range(), Some((10, 11)));

        table.remove(a.session_id).unwrap();
        assert!(table.by_fd(10).is_none());
        let c = table.insert(10, 0, SocketType::Tcp, inet(1)).unwrap();
        // Ids keep increasing instead of reusing the freed one immediately.
        assert!(c.session_id > b.session_id);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_queued_bytes_saturate() {
        let c = conn(1);
        assert_eq!(c.add_queued(10), 10);
        assert_eq!(c.sub_queued(4), 6);
        assert_eq!(c.sub_queued(100), 0);
    }

    #[test]
    fn test_ip_hash_stable() {
        assert_eq!(inet(5).ip_hash(), inet(5).ip_hash());
        assert_ne!(inet(5).ip_hash(), inet(6).ip_hash());
        assert_eq!(PeerAddr::Unix(None).ip_hash(), 0);
    }
}
