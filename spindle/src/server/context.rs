use super::ServerShared;
use super::config::ServerConfig;
use super::event::Event;
use super::listener::encode_packet;
use super::send_yield::SendWaiters;
use crate::command::{PendingCommands, error_json};
use crate::connection::{CloseReason, ConnectionInfo, PeerAddr, SessionId, unix_micros};
use crate::error::{CommandError, Error, Result, SendError, TaskError};
use crate::ipc::{CLOSE_RESET, Envelope, Header, Kind, TaskFlags};
use crate::reactor::ReactorHandle;
use crate::stats::{Counters, StatsSnapshot};
use crate::task::{
    Completion, FinishedTask, IncomingTask, TASK_JOIN_MAX, TaskChannel, TaskId, TaskIdGen,
    TaskOrigin, TaskResult, TaskTracker,
};
use crate::worker::{ProcessType, ReplyPipes, WorkerSlot, pack_origin, unpack_origin};
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Per-thread view of the running server, handed to every callback.
///
/// A context is bound to one execution unit: the supervisor, the reactor
/// thread, or one incarnation of a worker. It is cheap to clone and cannot
/// leave its thread.
#[derive(Clone)]
pub struct Context {
    inner: Rc<ContextInner>,
}

struct ContextInner {
    kind: ProcessType,
    worker_id: u32,
    generation: u32,
    shared: Arc<ServerShared>,
    reactor: ReactorHandle,
    replies: Option<Arc<ReplyPipes>>,
    tasks: RefCell<TaskTracker<Context>>,
    commands: RefCell<PendingCommands>,
    send_waiters: RefCell<SendWaiters>,
    task_ids: RefCell<TaskIdGen>,
    current_task: RefCell<Option<Rc<IncomingTask>>>,
    coroutine_num: Cell<u64>,
    coroutine_peak: Cell<u64>,
}

/// Counts a coroutine spawned through [`Context::go`] for its whole life.
struct CoroutineGuard {
    ctx: Context,
}

impl CoroutineGuard {
    fn new(ctx: &Context) -> Self {
        let inner = &ctx.inner;
        let num = inner.coroutine_num.get() + 1;
        inner.coroutine_num.set(num);
        if num > inner.coroutine_peak.get() {
            inner.coroutine_peak.set(num);
        }
        if let Some(slot) = ctx.slot() {
            slot.enter();
        }
        Self { ctx: ctx.clone() }
    }
}

impl Drop for CoroutineGuard {
    fn drop(&mut self) {
        let inner = &self.ctx.inner;
        inner.coroutine_num.set(inner.coroutine_num.get().saturating_sub(1));
        if let Some(slot) = self.ctx.slot() {
            slot.leave();
        }
    }
}

impl Context {
    pub(crate) fn new(
        kind: ProcessType,
        worker_id: u32,
        generation: u32,
        shared: Arc<ServerShared>,
        reactor: ReactorHandle,
        replies: Option<Arc<ReplyPipes>>,
    ) -> Self {
        Self {
            inner: Rc::new(ContextInner {
                kind,
                worker_id,
                generation,
                shared,
                reactor,
                replies,
                tasks: RefCell::new(TaskTracker::new()),
                commands: RefCell::new(PendingCommands::new()),
                send_waiters: RefCell::new(SendWaiters::new()),
                task_ids: RefCell::new(TaskIdGen::new(worker_id)),
                current_task: RefCell::new(None),
                coroutine_num: Cell::new(0),
                coroutine_peak: Cell::new(0),
            }),
        }
    }

    pub fn kind(&self) -> ProcessType {
        self.inner.kind
    }

    /// Slot id for workers, 0 for the supervisor and the reactor thread.
    pub fn worker_id(&self) -> u32 {
        self.inner.worker_id
    }

    pub fn generation(&self) -> u32 {
        self.inner.generation
    }

    pub fn reactor(&self) -> &ReactorHandle {
        &self.inner.reactor
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.shared.config
    }

    pub(crate) fn shared(&self) -> &Arc<ServerShared> {
        &self.inner.shared
    }

    fn is_worker(&self) -> bool {
        matches!(
            self.inner.kind,
            ProcessType::EventWorker | ProcessType::TaskWorker | ProcessType::UserWorker
        )
    }

    fn slot(&self) -> Option<&WorkerSlot> {
        if !self.is_worker() {
            return None;
        }
        self.inner.shared.workers.slot(self.inner.worker_id)
    }

    /// Index within the pool of this process type, as used to address commands.
    pub fn process_index(&self) -> u32 {
        let workers = &self.inner.shared.workers;
        match self.inner.kind {
            ProcessType::Manager | ProcessType::ReactorThread => 0,
            ProcessType::EventWorker => self.inner.worker_id,
            ProcessType::TaskWorker => self.inner.worker_id - workers.worker_num(),
            ProcessType::UserWorker => self.inner.worker_id - workers.core_worker_num(),
        }
    }

    pub(crate) fn emit(&self, event: Event<'_>) -> bool {
        self.inner.shared.events.emit(self, event)
    }

    /// Spawn a coroutine on this worker's executor.
    ///
    /// The coroutine counts towards the worker's concurrency while it lives,
    /// and a draining worker does not exit before its coroutines finish or
    /// `max_wait_time` runs out.
    pub fn go<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = ()> + 'static,
    {
        if !self.is_worker() {
            return Err(Error::WrongProcess(self.inner.kind.name()));
        }
        let guard = CoroutineGuard::new(self);
        tokio::task::spawn_local(async move {
            let _guard = guard;
            fut.await;
        });
        Ok(())
    }

    pub fn coroutine_num(&self) -> u64 {
        self.inner.coroutine_num.get()
    }

    pub fn coroutine_peak(&self) -> u64 {
        self.inner.coroutine_peak.get()
    }

    /// Statistics, with the per-worker fields filled from this worker.
    pub fn stats(&self) -> StatsSnapshot {
        let mut stats = self.inner.shared.stats();
        if let Some(slot) = self.slot() {
            stats.worker_id = Some(slot.id);
            stats.worker_request_count = Some(slot.request_count());
            stats.worker_response_count = Some(slot.response_count());
            stats.worker_dispatch_count = Some(slot.dispatch_count());
            stats.worker_concurrency = Some(slot.concurrency());
            stats.coroutine_num = Some(self.coroutine_num());
            stats.coroutine_peak_num = Some(self.coroutine_peak());
        }
        stats
    }

    fn require_sender(&self) -> std::result::Result<(), SendError> {
        if self.is_worker() {
            Ok(())
        } else {
            Err(SendError::WrongProcess(self.inner.kind.name()))
        }
    }

    fn to_master(&self, env: &Envelope) -> std::result::Result<(), SendError> {
        self.inner.shared.workers.master.send(env).map_err(|e| {
            warn!(kind = ?env.kind(), error = %e, "ipc send to the reactor thread failed");
            SendError::Transport
        })
    }

    /// Queue `data` on a stream connection.
    ///
    /// Fails with [`SendError::BufferFull`] when the connection already holds
    /// `output_buffer_size` bytes of unsent output.
    pub fn send(&self, session_id: SessionId, data: impl Into<Bytes>) -> std::result::Result<(), SendError> {
        self.require_sender()?;
        let data = data.into();
        let shared = &self.inner.shared;
        let conn = shared
            .connections
            .get(session_id)
            .ok_or(SendError::NoSession(session_id))?;
        if conn.is_closing() {
            return Err(SendError::Closing(session_id));
        }
        let limit = shared.config.output_buffer_size as u64;
        let len = data.len() as u64;
        if len > limit {
            return Err(SendError::BufferFull(session_id));
        }
        if conn.queued_bytes() + len > limit {
            // The reactor thread announces the drain only if the flag is up.
            conn.set_buffer_full(true);
            if conn.queued_bytes() + len > limit {
                return Err(SendError::BufferFull(session_id));
            }
        }
        conn.add_queued(data.len());
        let mut sent = 0;
        for env in Envelope::chunks(Kind::Response, session_id, data) {
            let chunk = env.payload.len();
            if let Err(e) = self.to_master(&env.with_source(self.inner.worker_id as u16)) {
                conn.sub_queued(len as usize - sent);
                return Err(e);
            }
            sent += chunk;
        }
        if let Some(slot) = self.slot() {
            slot.incr_response();
        }
        Counters::incr(&shared.counters.response_count);
        Ok(())
    }

    /// Like [`send`](Self::send), but with `send_yield` enabled a full buffer
    /// suspends the caller until the connection drains, the connection
    /// closes, or `send_timeout` elapses.
    pub async fn send_yield(&self, session_id: SessionId, data: impl Into<Bytes>) -> std::result::Result<(), SendError> {
        let data = data.into();
        let config = &self.inner.shared.config;
        if !config.send_yield || data.len() > config.output_buffer_size {
            return self.send(session_id, data);
        }
        let timeout = config.send_timeout_duration();
        loop {
            match self.send(session_id, data.clone()) {
                Err(SendError::BufferFull(_)) => {}
                other => return other,
            }
            let (id, rx) = self.inner.send_waiters.borrow_mut().wait(session_id);
            let ctx = self.clone();
            let timer = self.inner.reactor.add_timer(timeout, move |_| {
                ctx.inner.send_waiters.borrow_mut().expire(session_id, id);
            });
            let woken = rx.await.unwrap_or(Err(SendError::ConnectionReset));
            self.inner.reactor.cancel_timer(timer);
            woken?;
        }
    }

    pub(crate) fn wake_senders(&self, session_id: SessionId) {
        self.inner.send_waiters.borrow_mut().wake(session_id);
    }

    pub(crate) fn reset_senders(&self, session_id: SessionId) {
        self.inner.send_waiters.borrow_mut().reset(session_id);
    }

    /// Send a datagram through a datagram listener.
    pub fn send_to(&self, listener: u16, peer: &PeerAddr, data: &[u8]) -> std::result::Result<(), SendError> {
        self.require_sender()?;
        let payload = encode_packet(peer, data);
        for env in Envelope::chunks(Kind::SendTo, -(listener as i64 + 1), payload) {
            self.to_master(&env.with_source(self.inner.worker_id as u16).with_target(listener))?;
        }
        Ok(())
    }

    /// Close a connection after its queued output is flushed, or immediately
    /// with an RST when `reset` is set.
    pub fn close(&self, session_id: SessionId, reset: bool) -> std::result::Result<(), SendError> {
        self.close_with(session_id, reset, CloseReason::Server)
    }

    fn close_with(&self, session_id: SessionId, reset: bool, reason: CloseReason) -> std::result::Result<(), SendError> {
        self.require_sender()?;
        let conn = self
            .inner
            .shared
            .connections
            .get(session_id)
            .ok_or(SendError::NoSession(session_id))?;
        if conn.is_closing() {
            return Err(SendError::Closing(session_id));
        }
        let mut env = Envelope::control(Kind::CloseRequest, session_id)
            .with_source(self.inner.worker_id as u16)
            .with_aux(reason as u32);
        if reset {
            env = env.with_flags(CLOSE_RESET);
        }
        self.to_master(&env)
    }

    /// Stop reading from a connection.
    pub fn pause(&self, session_id: SessionId) -> std::result::Result<(), SendError> {
        self.flow_control(Kind::Pause, session_id)
    }

    pub fn resume(&self, session_id: SessionId) -> std::result::Result<(), SendError> {
        self.flow_control(Kind::Resume, session_id)
    }

    fn flow_control(&self, kind: Kind, session_id: SessionId) -> std::result::Result<(), SendError> {
        self.require_sender()?;
        if !self.exists(session_id) {
            return Err(SendError::NoSession(session_id));
        }
        self.to_master(&Envelope::control(kind, session_id).with_source(self.inner.worker_id as u16))
    }

    /// Exempt a connection from heartbeat eviction.
    pub fn protect(&self, session_id: SessionId, protect: bool) -> bool {
        match self.inner.shared.connections.get(session_id) {
            Some(conn) => {
                conn.set_protect(protect);
                true
            }
            None => false,
        }
    }

    /// Bind a uid to a connection; only the first bind succeeds.
    pub fn bind(&self, session_id: SessionId, uid: u32) -> bool {
        self.inner
            .shared
            .connections
            .get(session_id)
            .is_some_and(|conn| conn.bind_uid(uid))
    }

    pub fn exists(&self, session_id: SessionId) -> bool {
        self.inner
            .shared
            .connections
            .get(session_id)
            .is_some_and(|conn| !conn.is_closing())
    }

    pub fn connection_info(&self, session_id: SessionId) -> Option<ConnectionInfo> {
        self.inner.shared.connections.get(session_id).map(|c| c.info())
    }

    /// Up to `limit` live session ids greater than `start_after`, ascending.
    pub fn connection_list(&self, start_after: SessionId, limit: usize) -> Vec<SessionId> {
        self.inner
            .shared
            .connections
            .session_ids()
            .into_iter()
            .filter(|id| *id > start_after)
            .take(limit)
            .collect()
    }

    /// Sessions idle longer than `heartbeat_idle_time`, closed when `close` is set.
    pub fn heartbeat(&self, close: bool) -> Vec<SessionId> {
        let Some((_, idle)) = self.inner.shared.config.heartbeat_durations() else {
            return Vec::new();
        };
        let ids = self.inner.shared.connections.idle_sessions(unix_micros(), idle);
        if close {
            for id in &ids {
                if let Err(e) = self.close_with(*id, false, CloseReason::Heartbeat) {
                    debug!(session_id = id, error = %e, "heartbeat close skipped");
                }
            }
        }
        ids
    }

    fn dispatch_task(&self, data: Bytes, dst: Option<u32>, flags: TaskFlags) -> std::result::Result<TaskId, TaskError> {
        match self.inner.kind {
            ProcessType::EventWorker => {}
            ProcessType::UserWorker if flags.contains(TaskFlags::NOREPLY) => {}
            kind => return Err(TaskError::WrongProcess(kind.name())),
        }
        let origin = TaskOrigin {
            worker_id: self.inner.worker_id,
            kind: self.inner.kind,
            generation: self.inner.generation,
        };
        let id = self.inner.task_ids.borrow_mut().next_id();
        self.inner.shared.tasks.dispatch(&origin, id, data, flags, dst)?;
        Ok(id)
    }

    /// Dispatch a task whose result arrives as a Finish event.
    pub fn task(&self, data: impl Into<Bytes>, dst: Option<u32>) -> std::result::Result<TaskId, TaskError> {
        self.dispatch_task(data.into(), dst, TaskFlags::NONBLOCK)
    }

    /// Dispatch a task nobody waits for.
    pub fn task_noreply(&self, data: impl Into<Bytes>, dst: Option<u32>) -> std::result::Result<TaskId, TaskError> {
        self.dispatch_task(data.into(), dst, TaskFlags::NOREPLY)
    }

    /// Dispatch a task and run `callback` with its result.
    pub fn task_with_callback<F>(
        &self,
        data: impl Into<Bytes>,
        dst: Option<u32>,
        callback: F,
    ) -> std::result::Result<TaskId, TaskError>
    where
        F: FnOnce(&Context, TaskId, TaskResult) + 'static,
    {
        let id = self.dispatch_task(data.into(), dst, TaskFlags::NONBLOCK | TaskFlags::CALLBACK)?;
        self.inner.tasks.borrow_mut().track_callback(id, Box::new(callback));
        Ok(id)
    }

    /// Dispatch a task and block this thread until its result arrives.
    pub fn task_wait(&self, data: impl Into<Bytes>, dst: Option<u32>, timeout: Duration) -> TaskResult {
        let replies = self.sync_replies()?;
        let id = self.dispatch_task(data.into(), dst, TaskFlags::empty())?;
        TaskChannel::wait_sync(&replies, &[id], timeout)
            .pop()
            .unwrap_or(Err(TaskError::Timeout))
    }

    /// Dispatch every payload and block until all results arrive or `timeout`
    /// elapses. Results keep the order of `tasks`.
    pub fn task_wait_multi(&self, tasks: Vec<Bytes>, timeout: Duration) -> std::result::Result<Vec<TaskResult>, TaskError> {
        if tasks.len() > TASK_JOIN_MAX {
            return Err(TaskError::TooMany(tasks.len()));
        }
        let replies = self.sync_replies()?;
        let (mut results, ids) = self.dispatch_all(tasks, TaskFlags::WAITALL);
        let received = TaskChannel::wait_sync(&replies, &ids.iter().map(|(_, id)| *id).collect::<Vec<_>>(), timeout);
        for ((index, _), result) in ids.into_iter().zip(received) {
            results[index] = result;
        }
        Ok(results)
    }

    /// Dispatch a task and suspend the calling coroutine until its result arrives.
    pub async fn task_co(&self, data: impl Into<Bytes>, dst: Option<u32>, timeout: Duration) -> TaskResult {
        let id = self.dispatch_task(data.into(), dst, TaskFlags::NONBLOCK | TaskFlags::COROUTINE)?;
        self.park(vec![id], timeout)
            .await
            .pop()
            .unwrap_or(Err(TaskError::Canceled))
    }

    /// Join several tasks from a coroutine. On timeout, results that did not
    /// arrive are [`TaskError::Timeout`] at their original index.
    pub async fn task_wait_co(&self, tasks: Vec<Bytes>, timeout: Duration) -> std::result::Result<Vec<TaskResult>, TaskError> {
        if tasks.len() > TASK_JOIN_MAX {
            return Err(TaskError::TooMany(tasks.len()));
        }
        let (mut results, ids) = self.dispatch_all(tasks, TaskFlags::NONBLOCK | TaskFlags::COROUTINE);
        let received = self.park(ids.iter().map(|(_, id)| *id).collect(), timeout).await;
        for ((index, _), result) in ids.into_iter().zip(received) {
            results[index] = result;
        }
        Ok(results)
    }

    /// Dispatch each payload; failed dispatches keep their error in place.
    fn dispatch_all(&self, tasks: Vec<Bytes>, flags: TaskFlags) -> (Vec<TaskResult>, Vec<(usize, TaskId)>) {
        let mut results = Vec::with_capacity(tasks.len());
        let mut ids = Vec::with_capacity(tasks.len());
        for (index, data) in tasks.into_iter().enumerate() {
            match self.dispatch_task(data, None, flags) {
                Ok(id) => {
                    ids.push((index, id));
                    results.push(Err(TaskError::Timeout));
                }
                Err(e) => results.push(Err(e)),
            }
        }
        (results, ids)
    }

    async fn park(&self, ids: Vec<TaskId>, timeout: Duration) -> Vec<TaskResult> {
        let expected = ids.len();
        let (co, rx) = self.inner.tasks.borrow_mut().park(ids);
        let ctx = self.clone();
        let timer = self.inner.reactor.add_timer(timeout, move |_| {
            if ctx.inner.tasks.borrow_mut().expire(co) {
                debug!(worker_id = ctx.inner.worker_id, "task join timed out");
            }
        });
        let results = rx
            .await
            .unwrap_or_else(|_| (0..expected).map(|_| Err(TaskError::Canceled)).collect());
        self.inner.reactor.cancel_timer(timer);
        results
    }

    fn sync_replies(&self) -> std::result::Result<Arc<ReplyPipes>, TaskError> {
        self.inner
            .replies
            .clone()
            .ok_or(TaskError::WrongProcess(self.inner.kind.name()))
    }

    /// Set the result of the task being handled on this task worker.
    pub fn finish(&self, data: impl Into<Bytes>) -> bool {
        match self.inner.current_task.borrow().as_ref() {
            Some(task) => task.finish(data.into()),
            None => {
                warn!(worker_id = self.inner.worker_id, "finish called outside a task handler");
                false
            }
        }
    }

    pub(crate) fn set_current_task(&self, task: Option<Rc<IncomingTask>>) {
        *self.inner.current_task.borrow_mut() = task;
    }

    /// Route a result read from this worker's reply pipe.
    pub(crate) fn resolve_task(&self, finished: FinishedTask) {
        let (id, flags) = (finished.id, finished.flags);
        let result = finished.into_result();
        let completion = self.inner.tasks.borrow_mut().complete(id, result.clone());
        match completion {
            Completion::Callback(callback) => {
                if catch_unwind(AssertUnwindSafe(|| callback(self, id, result))).is_err() {
                    error!(task_id = %id, worker_id = self.inner.worker_id, "task callback panicked");
                }
            }
            Completion::Resumed | Completion::Pending => {}
            Completion::Unknown if flags.contains(TaskFlags::CALLBACK) || flags.contains(TaskFlags::COROUTINE) => {
                warn!(task_id = %id, "result for an expired task dropped");
            }
            Completion::Unknown => match result {
                Ok(data) => {
                    self.emit(Event::Finish { task_id: id, data: &data });
                }
                Err(e) => warn!(task_id = %id, error = %e, "task failed"),
            },
        }
    }

    /// Send a message to another event or task worker (PipeMessage event).
    pub fn send_message(&self, dst_worker_id: u32, data: impl Into<Bytes>) -> Result<()> {
        if !self.is_worker() {
            return Err(Error::WrongProcess(self.inner.kind.name()));
        }
        let workers = &self.inner.shared.workers;
        if dst_worker_id == self.inner.worker_id || dst_worker_id >= workers.core_worker_num() {
            return Err(Error::InvalidWorker(dst_worker_id));
        }
        let slot = workers
            .slot(dst_worker_id)
            .ok_or(Error::InvalidWorker(dst_worker_id))?;
        let msg_id = self
            .inner
            .shared
            .counters
            .pipe_packet_msg_id
            .fetch_add(1, Ordering::Relaxed);
        for env in Envelope::chunks(Kind::PipeMessage, msg_id as i64, data.into()) {
            slot.pipe.send(&env.with_source(self.inner.worker_id as u16))?;
        }
        Ok(())
    }

    /// Invoke a registered command in another execution unit and wait for its answer.
    pub async fn command(
        &self,
        name: &str,
        process_id: u32,
        process_type: ProcessType,
        payload: &str,
        timeout: Duration,
    ) -> std::result::Result<String, CommandError> {
        let shared = &self.inner.shared;
        let command = shared
            .commands
            .lookup(name)
            .ok_or_else(|| CommandError::Unknown(name.to_string()))?;
        if !command.accepted.accepts(process_type) {
            return Err(CommandError::NotAccepted(name.to_string()));
        }
        let pipe = shared
            .workers
            .inbound(process_type, process_id)
            .ok_or(CommandError::NoSuchProcess(process_type, process_id))?;
        if process_type == self.inner.kind && process_id == self.process_index() {
            return Ok(shared.commands.execute(self, command.id, payload));
        }
        if !self.is_worker() {
            return Err(CommandError::WrongProcess(self.inner.kind.name()));
        }

        let (request_id, rx) = self.inner.commands.borrow_mut().track();
        let origin = pack_origin(self.inner.kind, self.inner.generation);
        for env in Envelope::chunks(Kind::Command, request_id as i64, Bytes::copy_from_slice(payload.as_bytes())) {
            let env = env
                .with_source(self.inner.worker_id as u16)
                .with_target(command.id)
                .with_aux(origin);
            if let Err(e) = pipe.send(&env) {
                warn!(command = name, error = %e, "command request not sent");
                self.inner.commands.borrow_mut().fail(request_id, CommandError::Transport);
                return Err(CommandError::Transport);
            }
        }
        let ctx = self.clone();
        let timer = self.inner.reactor.add_timer(timeout, move |_| {
            ctx.inner.commands.borrow_mut().fail(request_id, CommandError::Timeout);
        });
        let result = rx.await.unwrap_or(Err(CommandError::Canceled));
        self.inner.reactor.cancel_timer(timer);
        result
    }

    /// Run a command request read from this unit's inbound pipe and send the answer home.
    pub(crate) fn serve_command(&self, header: &Header, payload: &Bytes) {
        let shared = &self.inner.shared;
        let request = String::from_utf8_lossy(payload);
        let response = match shared.commands.get(header.target) {
            Some(command) if !command.accepted.accepts(self.inner.kind) => {
                warn!(command = %command.name, kind = ?self.inner.kind, "command not accepted here");
                error_json(-4, "process type not accepted")
            }
            _ => shared.commands.execute(self, header.target, &request),
        };
        let Some((kind, generation)) = unpack_origin(header.aux) else {
            warn!(request_id = header.fd, "command request without origin");
            return;
        };
        let Some(replies) = shared
            .workers
            .slot(header.source as u32)
            .filter(|slot| slot.kind == kind)
            .and_then(|slot| slot.replies(generation))
        else {
            warn!(
                request_id = header.fd,
                source = header.source,
                generation,
                "command origin is gone, response dropped"
            );
            return;
        };
        // Never block the reactor thread on a requester that stopped reading.
        let nonblocking = self.inner.kind == ProcessType::ReactorThread;
        for env in Envelope::chunks(Kind::CommandResponse, header.fd, Bytes::from(response)) {
            let env = env.with_source(self.inner.worker_id as u16);
            let sent = if nonblocking {
                replies.reply.try_send(&env)
            } else {
                replies.reply.send(&env).map(|()| true)
            };
            match sent {
                Ok(true) => {}
                Ok(false) => {
                    warn!(request_id = header.fd, "requester pipe full, command response dropped");
                    return;
                }
                Err(e) => {
                    warn!(request_id = header.fd, error = %e, "command response not sent");
                    return;
                }
            }
        }
    }

    pub(crate) fn on_command_response(&self, header: &Header, payload: &Bytes) {
        let response = String::from_utf8_lossy(payload).into_owned();
        if !self.inner.commands.borrow_mut().complete(header.fd as u64, response) {
            debug!(request_id = header.fd, "late command response dropped");
        }
    }

    /// Ask the supervisor to reload workers.
    pub fn reload(&self, only_task_workers: bool) -> Result<()> {
        self.inner.shared.request_reload(only_task_workers)
    }

    /// Ask the supervisor to shut the server down.
    pub fn shutdown(&self) -> Result<()> {
        self.inner.shared.request_shutdown()
    }

    /// Whether this worker still tracks tasks, commands or blocked senders.
    pub(crate) fn has_pending(&self) -> bool {
        !self.inner.tasks.borrow().is_empty()
            || !self.inner.commands.borrow().is_empty()
            || !self.inner.send_waiters.borrow().is_empty()
    }

    /// Drop every outstanding registration; waiters observe cancellation.
    pub(crate) fn clear_pending(&self) {
        self.inner.tasks.borrow_mut().clear();
        self.inner.commands.borrow_mut().clear();
        self.inner.send_waiters.borrow_mut().clear();
        self.set_current_task(None);
    }
}
