use super::id::TaskId;
use super::tracker::TaskResult;
use crate::error::{IpcError, TaskError};
use crate::ipc::{Envelope, Kind, TaskFlags, spool};
use crate::stats::{Counters, SharedBlock};
use crate::worker::{ProcessType, ReplyPipes, WorkerSlot, WorkerTable, pack_origin, unpack_origin};
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identity of the worker incarnation a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskOrigin {
    pub worker_id: u32,
    pub kind: ProcessType,
    pub generation: u32,
}

/// A task as seen by the task worker executing it.
#[derive(Debug)]
pub struct IncomingTask {
    pub id: TaskId,
    pub src_worker_id: u32,
    pub flags: TaskFlags,
    pub data: Bytes,
    origin: u32,
    reply: RefCell<Option<Bytes>>,
    finished: Cell<bool>,
}

impl IncomingTask {
    /// Set the result sent back to the caller. Only the first call counts.
    pub fn finish(&self, data: Bytes) -> bool {
        if self.finished.replace(true) {
            warn!(task_id = %self.id, "task already finished, result ignored");
            return false;
        }
        *self.reply.borrow_mut() = Some(data);
        true
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    fn take_reply(&self) -> Option<Bytes> {
        self.reply.borrow_mut().take()
    }
}

/// Result as received by the dispatching worker.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedTask {
    pub id: TaskId,
    pub task_worker_id: u32,
    pub flags: TaskFlags,
    pub data: Bytes,
}

impl FinishedTask {
    pub fn is_failed(&self) -> bool {
        self.flags.contains(TaskFlags::FAILED)
    }

    /// The result as handed to the caller.
    pub fn into_result(self) -> TaskResult {
        if self.is_failed() {
            Err(TaskError::Failed)
        } else {
            Ok(self.data)
        }
    }
}

/// Routes tasks to task workers and their results back to the origin.
pub struct TaskChannel {
    workers: Arc<WorkerTable>,
    counters: Arc<SharedBlock>,
    cursor: AtomicU32,
    tmpdir: PathBuf,
}

impl TaskChannel {
    pub fn new(workers: Arc<WorkerTable>, counters: Arc<SharedBlock>, tmpdir: PathBuf) -> Self {
        Self {
            workers,
            counters,
            cursor: AtomicU32::new(0),
            tmpdir,
        }
    }

    /// Task worker for `dst`, or the first idle one from a round-robin cursor.
    pub fn select(&self, dst: Option<u32>) -> Result<&WorkerSlot, TaskError> {
        let n = self.workers.task_worker_num();
        if n == 0 {
            return Err(TaskError::NoTaskWorker);
        }
        if let Some(index) = dst {
            return self
                .workers
                .task_worker(index)
                .ok_or(TaskError::InvalidTarget(index));
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        (0..n)
            .filter_map(|k| self.workers.task_worker((start + k) % n))
            .find(|slot| slot.is_idle())
            .or_else(|| self.workers.task_worker(start))
            .ok_or(TaskError::InvalidTarget(start))
    }

    /// Send a task; returns the index of the task worker it went to.
    pub fn dispatch(
        &self,
        origin: &TaskOrigin,
        id: TaskId,
        data: Bytes,
        flags: TaskFlags,
        dst: Option<u32>,
    ) -> Result<u32, TaskError> {
        let slot = self.select(dst)?;
        let (payload, flags) = spool::pack(data, flags, &self.tmpdir).map_err(|e| {
            warn!(task_id = %id, error = %e, "failed to spool task payload");
            TaskError::DispatchFailed
        })?;
        let env = Envelope::new(Kind::Task, id.raw(), payload)
            .with_source(origin.worker_id as u16)
            .with_aux(pack_origin(origin.kind, origin.generation))
            .with_task_flags(flags);

        self.counters.tasking_num.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = slot.pipe.send(&env) {
            self.counters.tasking_num.fetch_sub(1, Ordering::AcqRel);
            discard_spool(&env);
            warn!(task_id = %id, dst = slot.id, error = %e, "task dispatch failed");
            return Err(TaskError::DispatchFailed);
        }
        Counters::incr(&self.counters.task_count);
        slot.incr_dispatch();
        debug!(task_id = %id, dst = slot.id, ?flags, "task dispatched");
        Ok(slot.id - self.workers.worker_num())
    }

    /// Decode a task envelope read by a task worker.
    pub fn receive(env: &Envelope) -> Result<IncomingTask, IpcError> {
        let (data, flags) = spool::unpack(&env.payload, env.header.ext_flags)?;
        Ok(IncomingTask {
            id: TaskId::from_raw(env.header.fd),
            src_worker_id: env.header.source as u32,
            flags,
            data,
            origin: env.header.aux,
            reply: RefCell::new(None),
            finished: Cell::new(false),
        })
    }

    /// Account for a processed task and send its result, if any, home.
    ///
    /// Called exactly once per task.
    pub fn complete(&self, task: &IncomingTask, task_worker_id: u32) {
        self.counters.tasking_num.fetch_sub(1, Ordering::AcqRel);
        let Some(data) = task.take_reply() else {
            return;
        };
        if task.flags.contains(TaskFlags::NOREPLY) {
            return;
        }
        if let Err(e) = self.reply(task, task_worker_id, data) {
            warn!(task_id = %task.id, error = %e, "task result not delivered");
        }
    }

    /// Account for a task envelope that could not be decoded and tell the
    /// caller it failed, so nobody waits for it until a timeout.
    pub fn reject(&self, env: &Envelope, task_worker_id: u32) {
        self.counters.tasking_num.fetch_sub(1, Ordering::AcqRel);
        discard_spool(env);
        let flags = env.header.ext_flags;
        if flags.contains(TaskFlags::NOREPLY) {
            return;
        }
        let task = IncomingTask {
            id: TaskId::from_raw(env.header.fd),
            src_worker_id: env.header.source as u32,
            flags: flags.without(TaskFlags::TMPFILE) | TaskFlags::FAILED,
            data: Bytes::new(),
            origin: env.header.aux,
            reply: RefCell::new(None),
            finished: Cell::new(true),
        };
        if let Err(e) = self.reply(&task, task_worker_id, Bytes::new()) {
            warn!(task_id = %task.id, error = %e, "task failure not delivered");
        }
    }

    fn reply(&self, task: &IncomingTask, task_worker_id: u32, data: Bytes) -> Result<(), TaskError> {
        let Some((_, generation)) = unpack_origin(task.origin) else {
            warn!(task_id = %task.id, "task without origin, result dropped");
            return Ok(());
        };
        let Some(replies) = self
            .workers
            .slot(task.src_worker_id)
            .and_then(|slot| slot.replies(generation))
        else {
            warn!(
                task_id = %task.id,
                src_worker_id = task.src_worker_id,
                generation,
                "task origin is gone, result dropped"
            );
            return Ok(());
        };
        let flags = task.flags.without(TaskFlags::TMPFILE | TaskFlags::PEEK);
        let (payload, flags) =
            spool::pack(data, flags, &self.tmpdir).map_err(|_| TaskError::DispatchFailed)?;
        let env = Envelope::new(Kind::Finish, task.id.raw(), payload)
            .with_source(task_worker_id as u16)
            .with_task_flags(flags);
        let pipe = if flags.contains(TaskFlags::NONBLOCK) {
            &replies.reply
        } else {
            &replies.sync
        };
        pipe.send(&env).map_err(|e| {
            discard_spool(&env);
            warn!(task_id = %task.id, error = %e, "failed to send task result");
            TaskError::DispatchFailed
        })
    }

    /// Decode a task result read by the dispatching worker.
    pub fn finished(env: &Envelope) -> Result<FinishedTask, IpcError> {
        let (data, flags) = spool::unpack(&env.payload, env.header.ext_flags)?;
        Ok(FinishedTask {
            id: TaskId::from_raw(env.header.fd),
            task_worker_id: env.header.source as u32,
            flags,
            data,
        })
    }

    /// Block on the synchronous result channel until every id in `ids` has
    /// a result or `timeout` elapses. Results for other ids are discarded.
    pub fn wait_sync(replies: &ReplyPipes, ids: &[TaskId], timeout: Duration) -> Vec<TaskResult> {
        let deadline = Instant::now() + timeout;
        let mut results: Vec<Option<TaskResult>> = vec![None; ids.len()];
        let mut remaining = ids.len();
        while remaining > 0 {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            let env = match replies.sync.recv_timeout(left) {
                Ok(Some(env)) => env,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "task result channel failed");
                    break;
                }
            };
            if env.kind() != Kind::Finish {
                warn!(kind = ?env.kind(), "unexpected envelope on task result channel");
                continue;
            }
            let finished = match Self::finished(&env) {
                Ok(finished) => finished,
                Err(e) => {
                    warn!(error = %e, "malformed task result");
                    continue;
                }
            };
            match ids.iter().position(|id| *id == finished.id) {
                Some(index) if results[index].is_none() => {
                    results[index] = Some(finished.into_result());
                    remaining -= 1;
                }
                _ => warn!(task_id = %finished.id, "discarding result of a task nobody waits for"),
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(TaskError::Timeout)))
            .collect()
    }
}

fn discard_spool(env: &Envelope) {
    if env.header.ext_flags.contains(TaskFlags::TMPFILE)
        && let Ok((_, path)) = spool::spool_ref(&env.payload)
    {
        let _ = std::fs::remove_file(path);
    }
}
