//! The reactor thread.
//!
//! Owns every listening socket and accepted stream. Inbound bytes and
//! datagrams are routed to event workers through the [`Dispatcher`]; output
//! and connection control come back from the workers on the reactor
//! thread's pipe and are applied here, so sockets are only ever touched by
//! this thread.
//!
//! Envelopes to event workers go through one [`Outbox`] per worker. When a
//! worker's pipe is full the overflow waits there and the pipe's sending end
//! is watched for writability; input that would overflow the outbox closes
//! its connection with [`CloseReason::Overload`].

use super::ServerShared;
use super::context::Context;
use super::event::Event;
use super::listener::{BoundListener, Stream, decode_packet, encode_packet};
use crate::connection::{CloseReason, Connection, PeerAddr, SessionId, unix_micros};
use crate::dispatch::{DispatchContext, DispatchEvent, DispatchOutcome, Dispatcher};
use crate::ipc::{Assembler, CLOSE_RESET, Envelope, Header, Kind, Outbox};
use crate::reactor::{Interest, Reactor, ReactorHandle, TimerId};
use crate::stats::Counters;
use crate::worker::ProcessType;
use bytes::{Buf, Bytes, BytesMut};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const READ_BUFFER_SIZE: usize = 64 * 1024;
const ACCEPT_BATCH: usize = 64;
const PIPE_BATCH: usize = 256;

pub(crate) fn spawn(shared: Arc<ServerShared>, listeners: Vec<BoundListener>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("spindle-reactor".to_string())
        .spawn(move || run(shared, listeners))
}

struct Peer {
    conn: Arc<Connection>,
    stream: Stream,
    out: VecDeque<Bytes>,
    close_after_flush: bool,
}

struct Master {
    this: Weak<Master>,
    ctx: Context,
    shared: Arc<ServerShared>,
    listeners: Vec<BoundListener>,
    peers: RefCell<HashMap<SessionId, Peer>>,
    assembler: RefCell<Assembler>,
    /// Indexed by event worker id.
    outboxes: RefCell<Vec<Outbox>>,
    read_buf: RefCell<BytesMut>,
    dispatcher: Dispatcher,
    connection_events: bool,
    heartbeat: Cell<Option<TimerId>>,
    stopping: Cell<bool>,
}

fn run(shared: Arc<ServerShared>, listeners: Vec<BoundListener>) {
    let reactor = Reactor::new();
    let h = reactor.handle();
    let config = &shared.config;
    let dispatcher = Dispatcher::new(config.dispatch_mode, config.worker_num, shared.dispatch_func.clone());
    let connection_events = dispatcher.delivers_connection_events(config.enable_unsafe_event);
    let outboxes = (0..config.worker_num)
        .map(|_| Outbox::new(config.pipe_buffer_size))
        .collect();
    let master = Rc::new_cyclic(|this| Master {
        this: this.clone(),
        ctx: Context::new(ProcessType::ReactorThread, 0, 0, shared.clone(), h.clone(), None),
        shared: shared.clone(),
        listeners,
        peers: RefCell::new(HashMap::new()),
        assembler: RefCell::new(Assembler::default()),
        outboxes: RefCell::new(outboxes),
        read_buf: RefCell::new(BytesMut::with_capacity(READ_BUFFER_SIZE)),
        dispatcher,
        connection_events,
        heartbeat: Cell::new(None),
        stopping: Cell::new(false),
    });

    for (index, listener) in master.listeners.iter().enumerate() {
        let m = master.clone();
        let registered = if listener.is_stream() {
            h.add(listener.raw_fd(), Interest::READABLE, move |h, _, _| m.on_accept(h, index))
        } else {
            h.add(listener.raw_fd(), Interest::READABLE, move |h, _, _| m.on_datagram(h, index))
        };
        if let Err(errno) = registered {
            warn!(index, %errno, "failed to watch listener");
        }
    }
    let m = master.clone();
    if let Err(errno) = h.add(shared.workers.master.rx_fd(), Interest::READABLE, move |h, _, _| {
        m.on_pipe(h)
    }) {
        error!(%errno, "failed to watch the reactor pipe");
        if let Err(e) = shared.request_shutdown() {
            error!(error = %e, "could not stop the server");
        }
        return;
    }
    if let Some((interval, idle)) = config.heartbeat_durations() {
        let m = master.clone();
        let timer = h.add_interval(interval, move |h| {
            for session_id in m.shared.connections.idle_sessions(unix_micros(), idle) {
                debug!(session_id, "heartbeat idle timeout");
                m.close(h, session_id, CloseReason::Heartbeat, false);
            }
        });
        master.heartbeat.set(Some(timer));
    }

    info!(
        listeners = master.listeners.len(),
        dispatch_mode = ?config.dispatch_mode,
        connection_events,
        "reactor thread started"
    );
    master.ctx.emit(Event::Start);
    shared.lifecycle.mark_started();

    let code = reactor.run();
    info!(code, "reactor thread exited");
}

impl Master {
    fn route(&self, event: DispatchEvent, conn: &Connection, data: Option<&[u8]>) -> DispatchOutcome {
        let ctx = DispatchContext {
            event,
            fd: conn.fd,
            session_id: conn.session_id,
            uid: conn.uid(),
            ip_hash: conn.remote.ip_hash(),
            pinned: conn.worker_id(),
            data,
        };
        self.dispatcher.select_worker(&ctx, &*self.shared.workers)
    }

    /// Send an event to an event worker, chunked if needed, without
    /// blocking. False if the worker's outbox refused it.
    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &self,
        h: &ReactorHandle,
        worker_id: u32,
        kind: Kind,
        fd: i64,
        target: u16,
        aux: u32,
        data: Bytes,
    ) -> bool {
        let Some(slot) = self.shared.workers.event_worker(worker_id) else {
            warn!(worker_id, "no such event worker");
            return false;
        };
        let chunks = Envelope::chunks(kind, fd, data)
            .into_iter()
            .map(|env| env.with_target(target).with_aux(aux))
            .collect();
        let (pushed, backlogged) = {
            let mut outboxes = self.outboxes.borrow_mut();
            let Some(outbox) = outboxes.get_mut(worker_id as usize) else {
                warn!(worker_id, "no outbox for event worker");
                return false;
            };
            let was_empty = outbox.is_empty();
            let pushed = outbox.push(&slot.pipe, chunks);
            (pushed, was_empty && !outbox.is_empty())
        };
        if backlogged {
            self.watch_worker_pipe(h, worker_id, slot.pipe.tx_fd());
        }
        match pushed {
            Ok(()) => {
                slot.incr_dispatch();
                Counters::incr(&self.shared.counters.dispatch_count);
                true
            }
            Err(e) => {
                warn!(worker_id, ?kind, fd, error = %e, "dispatch to worker failed");
                false
            }
        }
    }

    fn watch_worker_pipe(&self, h: &ReactorHandle, worker_id: u32, tx_fd: RawFd) {
        let this = self.this.clone();
        let watched = h.add(tx_fd, Interest::WRITABLE, move |h, _, _| {
            if let Some(m) = this.upgrade() {
                m.on_worker_writable(h, worker_id);
            }
        });
        match watched {
            Ok(()) => debug!(worker_id, "worker pipe full, queueing"),
            Err(errno) => warn!(worker_id, %errno, "failed to watch worker pipe"),
        }
    }

    fn on_worker_writable(&self, h: &ReactorHandle, worker_id: u32) {
        let Some(slot) = self.shared.workers.event_worker(worker_id) else {
            return;
        };
        let flushed = match self.outboxes.borrow_mut().get_mut(worker_id as usize) {
            Some(outbox) => outbox.flush(&slot.pipe),
            None => Ok(0),
        };
        match flushed {
            Ok(0) => {
                h.remove(slot.pipe.tx_fd());
                debug!(worker_id, "worker backlog drained");
            }
            Ok(_) => {}
            Err(e) => warn!(worker_id, error = %e, "queued envelope to worker dropped"),
        }
    }

    fn on_accept(self: &Rc<Self>, h: &ReactorHandle, index: usize) {
        let listener = &self.listeners[index];
        for _ in 0..ACCEPT_BATCH {
            match listener.accept() {
                Ok(Some((stream, peer))) => self.admit(h, listener, stream, peer),
                Ok(None) => return,
                Err(e) => {
                    warn!(index, error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn admit(self: &Rc<Self>, h: &ReactorHandle, listener: &BoundListener, stream: Stream, peer: PeerAddr) {
        let counters = &self.shared.counters;
        if self.stopping.get() {
            return;
        }
        let fd = stream.raw_fd();
        let Some(conn) =
            self.shared
                .connections
                .insert(fd, listener.index, listener.socket_type, peer)
        else {
            Counters::incr(&counters.abort_count);
            warn!(
                max_connection = self.shared.connections.max_connection(),
                "connection table full, closing new connection"
            );
            return;
        };
        Counters::incr(&counters.accept_count);
        let session_id = conn.session_id;
        debug!(session_id, fd, remote = %conn.remote, "connection accepted");

        let m = self.clone();
        if let Err(errno) = h.add(fd, Interest::READABLE, move |h, _, ready| m.on_stream(h, session_id, ready)) {
            warn!(session_id, %errno, "failed to watch connection");
            self.shared.connections.remove(session_id);
            Counters::incr(&counters.abort_count);
            return;
        }
        self.peers.borrow_mut().insert(
            session_id,
            Peer {
                conn: conn.clone(),
                stream,
                out: VecDeque::new(),
                close_after_flush: false,
            },
        );

        // Unstable modes route each receive on its own; no connect dispatch.
        if !self.connection_events {
            return;
        }
        match self.route(DispatchEvent::Connect, &conn, None) {
            DispatchOutcome::Worker(worker_id) => {
                conn.set_worker_id(worker_id);
                if !self.deliver(h, worker_id, Kind::Connect, session_id, listener.index, 0, Bytes::new()) {
                    self.close(h, session_id, CloseReason::Overload, false);
                }
            }
            DispatchOutcome::Discard => {}
            DispatchOutcome::Close => self.close(h, session_id, CloseReason::Dispatch, false),
        }
    }

    fn on_stream(&self, h: &ReactorHandle, session_id: SessionId, ready: Interest) {
        if ready.is_writable() {
            self.flush(h, session_id);
        }
        if ready.is_readable() || ready.is_error() {
            self.read(h, session_id);
        }
    }

    fn read(&self, h: &ReactorHandle, session_id: SessionId) {
        let read = {
            let mut peers = self.peers.borrow_mut();
            let Some(peer) = peers.get_mut(&session_id) else {
                return;
            };
            if peer.conn.is_paused() {
                return;
            }
            let mut buf = self.read_buf.borrow_mut();
            buf.resize(READ_BUFFER_SIZE, 0);
            peer.stream
                .read(&mut buf[..])
                .map(|n| (buf.split_to(n).freeze(), peer.conn.clone()))
        };
        let (data, conn) = match read {
            Ok((data, _)) if data.is_empty() => {
                self.close(h, session_id, CloseReason::Peer, false);
                return;
            }
            Ok(r) => r,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => return,
            Err(e) => {
                debug!(session_id, error = %e, "connection read failed");
                self.close(h, session_id, CloseReason::Peer, false);
                return;
            }
        };
        let n = data.len();
        conn.touch_recv(n);
        Counters::add(&self.shared.counters.total_recv_bytes, n as u64);

        match self.route(DispatchEvent::Receive, &conn, Some(&data)) {
            DispatchOutcome::Worker(worker_id) => {
                conn.set_worker_id(worker_id);
                if !self.deliver(h, worker_id, Kind::Receive, session_id, conn.listener, 0, data) {
                    self.close(h, session_id, CloseReason::Overload, false);
                }
            }
            DispatchOutcome::Discard => debug!(session_id, "received data discarded by dispatch"),
            DispatchOutcome::Close => self.close(h, session_id, CloseReason::Dispatch, false),
        }
    }

    fn on_datagram(&self, h: &ReactorHandle, index: usize) {
        let listener = &self.listeners[index];
        let mut buf = self.read_buf.borrow_mut();
        buf.resize(READ_BUFFER_SIZE, 0);
        for _ in 0..ACCEPT_BATCH {
            let (n, peer) = match listener.recv_from(&mut buf[..]) {
                Ok(Some(r)) => r,
                Ok(None) => return,
                Err(e) => {
                    warn!(index, error = %e, "datagram receive failed");
                    return;
                }
            };
            Counters::add(&self.shared.counters.total_recv_bytes, n as u64);
            let fd = -(listener.index as i64 + 1);
            let ctx = DispatchContext {
                event: DispatchEvent::Packet,
                fd: listener.raw_fd(),
                session_id: fd,
                uid: 0,
                ip_hash: peer.ip_hash(),
                pinned: None,
                data: Some(&buf[..n]),
            };
            match self.dispatcher.select_worker(&ctx, &*self.shared.workers) {
                DispatchOutcome::Worker(worker_id) => {
                    let payload = encode_packet(&peer, &buf[..n]);
                    if !self.deliver(h, worker_id, Kind::Packet, fd, listener.index, 0, payload) {
                        debug!(index, %peer, "datagram dropped, worker backlog full");
                    }
                }
                DispatchOutcome::Discard | DispatchOutcome::Close => {
                    debug!(index, %peer, "datagram discarded by dispatch");
                }
            }
        }
    }

    fn interest_of(peer: &Peer) -> Interest {
        let mut interest = Interest::NONE;
        if !peer.conn.is_paused() && !peer.close_after_flush {
            interest |= Interest::READABLE;
        }
        if !peer.out.is_empty() {
            interest |= Interest::WRITABLE;
        }
        interest
    }

    fn update_interest(&self, h: &ReactorHandle, session_id: SessionId) {
        let peers = self.peers.borrow();
        if let Some(peer) = peers.get(&session_id)
            && let Err(errno) = h.set(peer.stream.raw_fd(), Self::interest_of(peer))
        {
            debug!(session_id, %errno, "interest update failed");
        }
    }

    /// Write queued output; closes the connection if that was requested and
    /// the queue is now empty.
    fn flush(&self, h: &ReactorHandle, session_id: SessionId) {
        let mut written = 0usize;
        let mut failed = false;
        let (conn, drained_close) = {
            let mut peers = self.peers.borrow_mut();
            let Some(peer) = peers.get_mut(&session_id) else {
                return;
            };
            while let Some(front) = peer.out.front_mut() {
                match peer.stream.write(front) {
                    Ok(0) => {
                        failed = true;
                        break;
                    }
                    Ok(n) => {
                        written += n;
                        if n == front.len() {
                            peer.out.pop_front();
                        } else {
                            front.advance(n);
                        }
                    }
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => break,
                    Err(e) => {
                        debug!(session_id, error = %e, "connection write failed");
                        failed = true;
                        break;
                    }
                }
            }
            (peer.conn.clone(), peer.out.is_empty() && peer.close_after_flush)
        };

        if written > 0 {
            conn.touch_send(written);
            Counters::add(&self.shared.counters.total_send_bytes, written as u64);
            let queued = conn.sub_queued(written);
            if queued <= self.shared.config.buffer_low_watermark()
                && conn.set_buffer_full(false)
                && let Some(worker_id) = conn.worker_id()
            {
                self.deliver(h, worker_id, Kind::BufferEmpty, session_id, conn.listener, 0, Bytes::new());
            }
        }
        if failed {
            self.close(h, session_id, CloseReason::Peer, false);
        } else if drained_close {
            self.close(h, session_id, conn.close_reason(), false);
        } else {
            self.update_interest(h, session_id);
        }
    }

    fn on_response(&self, h: &ReactorHandle, session_id: SessionId, data: Bytes) {
        let conn = {
            let mut peers = self.peers.borrow_mut();
            let Some(peer) = peers.get_mut(&session_id) else {
                debug!(session_id, len = data.len(), "response for a closed connection dropped");
                return;
            };
            peer.out.push_back(data);
            peer.conn.clone()
        };
        self.flush(h, session_id);
        if conn.queued_bytes() >= self.shared.config.buffer_high_watermark()
            && !conn.set_buffer_full(true)
            && let Some(worker_id) = conn.worker_id()
        {
            self.deliver(h, worker_id, Kind::BufferFull, session_id, conn.listener, 0, Bytes::new());
        }
    }

    fn on_close_request(&self, h: &ReactorHandle, header: &Header) {
        let session_id = header.fd;
        let reason = match CloseReason::from_u8(header.aux as u8) {
            CloseReason::None => CloseReason::Server,
            reason => reason,
        };
        if header.flags & CLOSE_RESET != 0 {
            self.close(h, session_id, reason, true);
            return;
        }
        let flush_first = {
            let mut peers = self.peers.borrow_mut();
            match peers.get_mut(&session_id) {
                Some(peer) if !peer.out.is_empty() => {
                    peer.conn.begin_close(reason);
                    peer.close_after_flush = true;
                    true
                }
                Some(_) => false,
                None => return,
            }
        };
        if flush_first {
            self.update_interest(h, session_id);
        } else {
            self.close(h, session_id, reason, false);
        }
    }

    fn close(&self, h: &ReactorHandle, session_id: SessionId, reason: CloseReason, reset: bool) {
        let Some(peer) = self.peers.borrow_mut().remove(&session_id) else {
            return;
        };
        let conn = peer.conn.clone();
        conn.begin_close(reason);
        h.remove(peer.stream.raw_fd());
        if reset {
            peer.stream.set_reset_on_close();
        }
        self.shared.connections.remove(session_id);
        self.assembler.borrow_mut().discard(session_id);
        drop(peer);
        Counters::incr(&self.shared.counters.close_count);
        let reason = conn.close_reason();
        debug!(session_id, ?reason, reset, "connection closed");

        if !self.connection_events {
            return;
        }
        let worker_id = match conn.worker_id() {
            Some(id) => Some(id),
            None => match self.route(DispatchEvent::Close, &conn, None) {
                DispatchOutcome::Worker(id) => Some(id),
                _ => None,
            },
        };
        if let Some(worker_id) = worker_id {
            self.deliver(h, worker_id, Kind::Close, session_id, conn.listener, reason as u32, Bytes::new());
        }
    }

    fn on_send_to(&self, header: &Header, payload: Bytes) {
        let Some(listener) = self.listeners.get(header.target as usize) else {
            warn!(listener = header.target, "send_to on an unknown listener");
            return;
        };
        let sent = decode_packet(payload).map_err(io::Error::other).and_then(|(peer, data)| {
            listener.send_to(&data, &peer)
        });
        match sent {
            Ok(n) => Counters::add(&self.shared.counters.total_send_bytes, n as u64),
            Err(e) => warn!(listener = header.target, error = %e, "send_to failed"),
        }
    }

    fn on_pipe(&self, h: &ReactorHandle) {
        for _ in 0..PIPE_BATCH {
            let env = match self.shared.workers.master.try_recv() {
                Ok(Some(env)) => env,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "bad envelope on reactor pipe");
                    continue;
                }
            };
            let assembled = self.assembler.borrow_mut().push(env);
            let Some((header, payload)) = assembled else {
                continue;
            };
            match header.kind {
                Kind::Response => self.on_response(h, header.fd, payload),
                Kind::SendTo => self.on_send_to(&header, payload),
                Kind::CloseRequest => self.on_close_request(h, &header),
                Kind::Pause | Kind::Resume => {
                    if let Some(conn) = self.shared.connections.get(header.fd) {
                        conn.set_paused(header.kind == Kind::Pause);
                        self.update_interest(h, header.fd);
                    }
                }
                Kind::Command => self.ctx.serve_command(&header, &payload),
                Kind::Shutdown => {
                    self.shutdown(h);
                    return;
                }
                kind => warn!(?kind, "unexpected envelope on reactor pipe"),
            }
        }
    }

    /// Last non-blocking attempt at queued envelopes before the loop stops.
    fn drain_outboxes(&self) {
        let mut outboxes = self.outboxes.borrow_mut();
        for (worker_id, outbox) in outboxes.iter_mut().enumerate() {
            let Some(slot) = self.shared.workers.event_worker(worker_id as u32) else {
                continue;
            };
            match outbox.flush(&slot.pipe) {
                Ok(0) => {}
                Ok(left) => warn!(worker_id, left, "envelopes to worker dropped at shutdown"),
                Err(e) => warn!(worker_id, error = %e, "envelopes to worker dropped at shutdown"),
            }
        }
    }

    fn shutdown(&self, h: &ReactorHandle) {
        if self.stopping.replace(true) {
            return;
        }
        info!(connections = self.peers.borrow().len(), "reactor thread shutting down");
        for listener in &self.listeners {
            h.remove(listener.raw_fd());
        }
        if let Some(timer) = self.heartbeat.take() {
            h.cancel_timer(timer);
        }
        let sessions: Vec<SessionId> = self.peers.borrow().keys().copied().collect();
        for session_id in sessions {
            self.close(h, session_id, CloseReason::Shutdown, false);
        }
        self.drain_outboxes();
        self.ctx.emit(Event::Shutdown);
        h.stop();
    }
}
