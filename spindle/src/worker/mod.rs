//! Worker slots and the process topology.
//!
//! A [`WorkerTable`] is created once per server and shared by every thread.
//! It owns one [`WorkerSlot`] per worker id plus the inbound pipes of the
//! reactor thread and the supervisor.
//!
//! # Architecture
//!
//! ```text
//!  id:   0 .. worker_num | worker_num .. core_worker_num | core_worker_num ..
//!        event workers   | task workers                  | user workers
//! ```
//!
//! A slot outlives the workers that occupy it. Its inbound [`Pipe`] is read
//! by whichever incarnation is current, so work queued during a respawn is
//! picked up by the replacement. Replies addressed to one incarnation (task
//! results, command responses) travel on that incarnation's own
//! [`ReplyPipes`], registered in the slot under its generation.

mod affinity;
mod budget;

pub use affinity::{available_cpus, cpu_count, cpu_for, pin_current_thread};
pub use budget::{BudgetState, RequestBudget};

use crate::connection::unix_micros;
use crate::dispatch::WorkerLoad;
use crate::ipc::Pipe;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};

/// Requests below which `max_request_grace` gets no default.
pub const WORKER_MIN_REQUEST: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    Manager,
    ReactorThread,
    EventWorker,
    TaskWorker,
    UserWorker,
}

impl ProcessType {
    pub fn code(self) -> u8 {
        match self {
            ProcessType::Manager => 1,
            ProcessType::ReactorThread => 2,
            ProcessType::EventWorker => 3,
            ProcessType::TaskWorker => 4,
            ProcessType::UserWorker => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => ProcessType::Manager,
            2 => ProcessType::ReactorThread,
            3 => ProcessType::EventWorker,
            4 => ProcessType::TaskWorker,
            5 => ProcessType::UserWorker,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            ProcessType::Manager => "manager",
            ProcessType::ReactorThread => "reactor thread",
            ProcessType::EventWorker => "event worker",
            ProcessType::TaskWorker => "task worker",
            ProcessType::UserWorker => "user worker",
        }
    }
}

/// Pack the sender's process type and generation into an envelope `aux` word.
pub fn pack_origin(kind: ProcessType, generation: u32) -> u32 {
    (kind.code() as u32) << 24 | (generation & 0x00ff_ffff)
}

pub fn unpack_origin(aux: u32) -> Option<(ProcessType, u32)> {
    let kind = ProcessType::from_code((aux >> 24) as u8)?;
    Some((kind, aux & 0x00ff_ffff))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WorkerStatus {
    Starting = 0,
    Idle = 1,
    Busy = 2,
    /// Draining: no new work is read from the slot pipe.
    Exiting = 3,
    Exited = 4,
}

impl WorkerStatus {
    fn from_u8(v: u8) -> WorkerStatus {
        match v {
            1 => WorkerStatus::Idle,
            2 => WorkerStatus::Busy,
            3 => WorkerStatus::Exiting,
            4 => WorkerStatus::Exited,
            _ => WorkerStatus::Starting,
        }
    }
}

/// Pipes private to one worker incarnation.
#[derive(Debug)]
pub struct ReplyPipes {
    /// Asynchronous replies, read by the incarnation's reactor.
    pub reply: Pipe,
    /// Results of synchronous task waits, read with a blocking timeout.
    pub sync: Pipe,
}

impl ReplyPipes {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            reply: Pipe::new()?,
            sync: Pipe::blocking()?,
        })
    }
}

/// Identity of the thread currently occupying a slot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Incarnation {
    pub generation: u32,
    pub pid: u32,
    pub thread_name: String,
    pub started_at: u64,
}

pub struct WorkerSlot {
    pub id: u32,
    pub kind: ProcessType,
    /// Inbound work for whichever incarnation is current.
    pub pipe: Pipe,
    status: AtomicU8,
    request_count: AtomicU64,
    response_count: AtomicU64,
    dispatch_count: AtomicU64,
    concurrency: AtomicU32,
    generation: AtomicU32,
    incarnation: ArcSwap<Incarnation>,
    replies: ArcSwap<HashMap<u32, Arc<ReplyPipes>>>,
}

impl WorkerSlot {
    fn new(id: u32, kind: ProcessType) -> io::Result<Self> {
        Ok(Self {
            id,
            kind,
            pipe: Pipe::new()?,
            status: AtomicU8::new(WorkerStatus::Starting as u8),
            request_count: AtomicU64::new(0),
            response_count: AtomicU64::new(0),
            dispatch_count: AtomicU64::new(0),
            concurrency: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            incarnation: ArcSwap::from_pointee(Incarnation::default()),
            replies: ArcSwap::from_pointee(HashMap::new()),
        })
    }

    pub fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: WorkerStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    pub fn is_idle(&self) -> bool {
        self.status() == WorkerStatus::Idle
    }

    /// Start a new incarnation: fresh counters, next generation.
    ///
    /// The concurrency gauge is shared by every incarnation of the slot and
    /// is left alone; a draining predecessor still releases its own units.
    pub fn begin_incarnation(&self, thread_name: String) -> u32 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.request_count.store(0, Ordering::Release);
        self.response_count.store(0, Ordering::Release);
        self.dispatch_count.store(0, Ordering::Release);
        self.set_status(WorkerStatus::Starting);
        self.incarnation.store(Arc::new(Incarnation {
            generation,
            pid: std::process::id(),
            thread_name,
            started_at: unix_micros(),
        }));
        generation
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn incarnation(&self) -> Arc<Incarnation> {
        self.incarnation.load_full()
    }

    pub fn register_replies(&self, generation: u32, pipes: Arc<ReplyPipes>) {
        self.replies.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(generation, pipes.clone());
            next
        });
    }

    pub fn unregister_replies(&self, generation: u32) {
        self.replies.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(&generation);
            next
        });
    }

    /// Reply pipes of a live incarnation.
    pub fn replies(&self, generation: u32) -> Option<Arc<ReplyPipes>> {
        self.replies.load().get(&generation).cloned()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn incr_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn response_count(&self) -> u64 {
        self.response_count.load(Ordering::Relaxed)
    }

    pub fn incr_response(&self) {
        self.response_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count.load(Ordering::Relaxed)
    }

    pub fn incr_dispatch(&self) {
        self.dispatch_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::Acquire)
    }

    pub fn enter(&self) {
        self.concurrency.fetch_add(1, Ordering::AcqRel);
    }

    pub fn leave(&self) {
        let _ = self
            .concurrency
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some(c.saturating_sub(1)));
    }

    /// Count one unit of work until the guard drops, unwinding included.
    pub fn busy(&self) -> BusyGuard<'_> {
        self.enter();
        BusyGuard(self)
    }
}

pub struct BusyGuard<'a>(&'a WorkerSlot);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.leave();
    }
}

impl std::fmt::Debug for WorkerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSlot")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("generation", &self.generation())
            .finish()
    }
}

/// Every slot of the server plus the reactor thread's and supervisor's pipes.
#[derive(Debug)]
pub struct WorkerTable {
    slots: Vec<WorkerSlot>,
    worker_num: u32,
    task_worker_num: u32,
    user_worker_num: u32,
    /// Inbound pipe of the reactor thread.
    pub master: Pipe,
    /// Inbound pipe of the supervisor.
    pub manager: Pipe,
}

impl WorkerTable {
    pub fn new(worker_num: u32, task_worker_num: u32, user_worker_num: u32) -> io::Result<Self> {
        let mut slots = Vec::new();
        let kinds = std::iter::repeat_n(ProcessType::EventWorker, worker_num as usize)
            .chain(std::iter::repeat_n(ProcessType::TaskWorker, task_worker_num as usize))
            .chain(std::iter::repeat_n(ProcessType::UserWorker, user_worker_num as usize));
        for (id, kind) in kinds.enumerate() {
            slots.push(WorkerSlot::new(id as u32, kind)?);
        }
        Ok(Self {
            slots,
            worker_num,
            task_worker_num,
            user_worker_num,
            master: Pipe::new()?,
            manager: Pipe::new()?,
        })
    }

    pub fn worker_num(&self) -> u32 {
        self.worker_num
    }

    pub fn task_worker_num(&self) -> u32 {
        self.task_worker_num
    }

    pub fn user_worker_num(&self) -> u32 {
        self.user_worker_num
    }

    /// Event plus task workers.
    pub fn core_worker_num(&self) -> u32 {
        self.worker_num + self.task_worker_num
    }

    pub fn slot(&self, id: u32) -> Option<&WorkerSlot> {
        self.slots.get(id as usize)
    }

    pub fn slots(&self) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter()
    }

    pub fn event_worker(&self, id: u32) -> Option<&WorkerSlot> {
        (id < self.worker_num).then(|| &self.slots[id as usize])
    }

    /// Task worker by index within the task pool.
    pub fn task_worker(&self, index: u32) -> Option<&WorkerSlot> {
        (index < self.task_worker_num).then(|| &self.slots[(self.worker_num + index) as usize])
    }

    pub fn user_worker(&self, index: u32) -> Option<&WorkerSlot> {
        (index < self.user_worker_num)
            .then(|| &self.slots[(self.core_worker_num() + index) as usize])
    }

    pub fn of_kind(&self, kind: ProcessType) -> impl Iterator<Item = &WorkerSlot> {
        self.slots.iter().filter(move |s| s.kind == kind)
    }

    pub fn idle_count(&self, kind: ProcessType) -> u32 {
        self.of_kind(kind).filter(|s| s.is_idle()).count() as u32
    }

    /// Inbound pipe of a process addressed as (type, index within its pool).
    pub fn inbound(&self, kind: ProcessType, index: u32) -> Option<&Pipe> {
        match kind {
            ProcessType::Manager => (index == 0).then_some(&self.manager),
            ProcessType::ReactorThread => (index == 0).then_some(&self.master),
            ProcessType::EventWorker => self.event_worker(index).map(|s| &s.pipe),
            ProcessType::TaskWorker => self.task_worker(index).map(|s| &s.pipe),
            ProcessType::UserWorker => self.user_worker(index).map(|s| &s.pipe),
        }
    }
}

impl WorkerLoad for WorkerTable {
    fn concurrency(&self, worker_id: u32) -> u32 {
        self.event_worker(worker_id)
            .map(|s| s.concurrency())
            .unwrap_or(u32::MAX)
    }
}
