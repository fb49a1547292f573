//! Worker threads.
//!
//! Each incarnation owns a [`Reactor`] driven as a local task on a
//! current-thread tokio runtime, so coroutines spawned through
//! [`Context::go`] run between loop iterations. The reactor watches the
//! slot's inbound pipe and the incarnation's reply pipe.
//!
//! A worker drains when its request budget runs out or the supervisor asks
//! it to stop: it tells the supervisor (which starts a replacement right
//! away), keeps reading until its pipe is empty or the grace budget is spent,
//! then leaves the loop once its coroutines, timers and outstanding replies
//! are done. `max_wait_time` caps the whole drain.

use super::ServerShared;
use super::context::Context;
use super::event::Event;
use super::listener::decode_packet;
use crate::connection::CloseReason;
use crate::ipc::{Assembler, Envelope, Header, Kind};
use crate::reactor::{ExitTag, Interest, Reactor, ReactorHandle, TokioRuntime};
use crate::stats::Counters;
use crate::task::TaskChannel;
use crate::worker::{
    BudgetState, ProcessType, ReplyPipes, RequestBudget, WorkerSlot, WorkerStatus, available_cpus,
    cpu_count, cpu_for, pin_current_thread,
};
use bytes::Bytes;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::runtime::Builder;
use tracing::{debug, error, info, warn};

/// Poll bound of worker reactors.
pub(crate) const WORKER_MAX_WAIT: Duration = Duration::from_millis(20);
/// Envelopes read from a pipe per readiness event.
const READ_BATCH: usize = 64;

/// Start a new incarnation of slot `slot_id`; returns its generation.
pub(crate) fn spawn(shared: &Arc<ServerShared>, slot_id: u32) -> io::Result<(u32, JoinHandle<()>)> {
    let slot = shared
        .workers
        .slot(slot_id)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such worker slot"))?;
    let name = match slot.kind {
        ProcessType::TaskWorker => format!("spindle-task-{slot_id}"),
        ProcessType::UserWorker => format!("spindle-user-{slot_id}"),
        _ => format!("spindle-worker-{slot_id}"),
    };
    let generation = slot.begin_incarnation(name.clone());
    let shared = shared.clone();
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || run(shared, slot_id, generation))?;
    Ok((generation, handle))
}

fn run(shared: Arc<ServerShared>, slot_id: u32, generation: u32) {
    let Some(slot) = shared.workers.slot(slot_id) else {
        return;
    };
    let failed = match catch_unwind(AssertUnwindSafe(|| run_incarnation(&shared, slot, generation))) {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            error!(worker_id = slot_id, generation, error = %e, "worker failed to start");
            true
        }
        Err(_) => {
            error!(worker_id = slot_id, generation, "worker panicked");
            true
        }
    };
    slot.unregister_replies(generation);
    if slot.generation() == generation {
        slot.set_status(WorkerStatus::Exited);
    }
    let exited = Envelope::control(Kind::WorkerExited, 0)
        .with_source(slot_id as u16)
        .with_target(failed as u16)
        .with_aux(generation);
    if let Err(e) = shared.workers.manager.send(&exited) {
        error!(worker_id = slot_id, error = %e, "could not report worker exit");
    }
}

fn run_incarnation(shared: &Arc<ServerShared>, slot: &WorkerSlot, generation: u32) -> io::Result<()> {
    let replies = Arc::new(ReplyPipes::new()?);
    slot.register_replies(generation, replies.clone());

    if shared.config.open_cpu_affinity {
        let cpus = available_cpus(cpu_count(), &shared.config.cpu_affinity_ignore)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        if let Some(cpu) = cpu_for(slot.id, &cpus)
            && let Err(errno) = pin_current_thread(cpu)
        {
            warn!(worker_id = slot.id, cpu, %errno, "failed to set cpu affinity");
        }
    }

    let rt = Builder::new_current_thread().build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, async {
        let reactor = Reactor::with_max_wait(WORKER_MAX_WAIT);
        let ctx = Context::new(
            slot.kind,
            slot.id,
            generation,
            shared.clone(),
            reactor.handle(),
            Some(replies.clone()),
        );
        let result = match slot.kind {
            ProcessType::UserWorker => run_user_worker(shared, slot, &reactor, &ctx, &replies).await,
            _ => run_core_worker(shared, slot, generation, &reactor, &ctx, &replies).await,
        };
        ctx.clear_pending();
        result
    })
}

struct WorkerState {
    ctx: Context,
    slot_id: u32,
    kind: ProcessType,
    generation: u32,
    budget: RefCell<RequestBudget>,
    inbound: RefCell<Assembler>,
    replies: RefCell<Assembler>,
    draining: Cell<bool>,
}

async fn run_core_worker(
    shared: &Arc<ServerShared>,
    slot: &WorkerSlot,
    generation: u32,
    reactor: &Reactor,
    ctx: &Context,
    replies: &Arc<ReplyPipes>,
) -> io::Result<()> {
    let budget = match slot.kind {
        ProcessType::TaskWorker => shared.config.task_worker_budget(),
        _ => shared.config.worker_budget(),
    };
    let state = Rc::new(WorkerState {
        ctx: ctx.clone(),
        slot_id: slot.id,
        kind: slot.kind,
        generation,
        budget: RefCell::new(budget),
        inbound: RefCell::new(Assembler::default()),
        replies: RefCell::new(Assembler::default()),
        draining: Cell::new(false),
    });

    let inbound = state.clone();
    reactor
        .add(slot.pipe.rx_fd(), Interest::READABLE, move |h, fd, _| {
            inbound.on_inbound(h, fd)
        })
        .map_err(io::Error::from)?;
    let reply_fd = replies.reply.rx_fd();
    let reply_state = state.clone();
    let reply_pipes = replies.clone();
    reactor
        .add(reply_fd, Interest::READABLE, move |_, _, _| {
            reply_state.on_reply(&reply_pipes)
        })
        .map_err(io::Error::from)?;

    let co = ctx.clone();
    reactor.set_exit_condition(ExitTag::Coroutines, move |_, _| co.coroutine_num() == 0);
    let draining = state.clone();
    reactor.set_exit_condition(ExitTag::Custom("replies"), move |h, event_num| {
        if draining.draining.get() && !draining.ctx.has_pending() && h.contains(reply_fd) {
            *event_num = event_num.saturating_sub(1);
        }
        true
    });

    info!(worker_id = slot.id, generation, kind = slot.kind.name(), "worker started");
    ctx.emit(Event::WorkerStart { worker_id: slot.id });
    if slot.generation() == generation {
        slot.set_status(WorkerStatus::Idle);
    }

    let code = reactor.run_with::<TokioRuntime>().await;
    ctx.emit(Event::WorkerExit { worker_id: slot.id });
    info!(
        worker_id = slot.id,
        generation,
        served = state.budget.borrow().served(),
        code,
        "worker exited"
    );
    Ok(())
}

impl WorkerState {
    fn slot(&self) -> Option<&WorkerSlot> {
        self.ctx.shared().workers.slot(self.slot_id)
    }

    fn is_current(&self, slot: &WorkerSlot) -> bool {
        slot.generation() == self.generation
    }

    fn on_inbound(&self, h: &ReactorHandle, fd: RawFd) {
        let Some(slot) = self.slot() else {
            return;
        };
        for _ in 0..READ_BATCH {
            if self.budget.borrow().state() == BudgetState::Exhausted {
                self.stop_reading(h, fd);
                return;
            }
            let env = match slot.pipe.try_recv() {
                Ok(Some(env)) => env,
                Ok(None) => {
                    if self.draining.get() {
                        self.stop_reading(h, fd);
                    }
                    return;
                }
                Err(e) => {
                    warn!(worker_id = self.slot_id, error = %e, "bad envelope on worker pipe");
                    continue;
                }
            };
            if env.kind() == Kind::Stop {
                if !self.on_stop(h, fd, slot, env) {
                    return;
                }
                continue;
            }
            let assembled = self.inbound.borrow_mut().push(env);
            let Some((header, payload)) = assembled else {
                continue;
            };
            if self.is_current(slot) {
                slot.set_status(WorkerStatus::Busy);
            }
            {
                let _busy = slot.busy();
                self.handle(h, slot, &header, payload);
            }
            if self.is_current(slot) && !self.draining.get() {
                slot.set_status(WorkerStatus::Idle);
            }
        }
    }

    /// Returns false if reading must stop for this readiness event.
    fn on_stop(&self, h: &ReactorHandle, fd: RawFd, slot: &WorkerSlot, env: Envelope) -> bool {
        let target = env.header.aux;
        if target == self.generation {
            debug!(worker_id = self.slot_id, generation = target, "stop requested");
            self.begin_drain(h, "stop requested");
            true
        } else if target > self.generation {
            // Meant for a newer incarnation reading the same pipe.
            if let Err(e) = slot.pipe.send(&env) {
                warn!(worker_id = self.slot_id, error = %e, "could not requeue stop");
            }
            if self.draining.get() {
                self.stop_reading(h, fd);
            }
            false
        } else {
            true
        }
    }

    fn handle(&self, h: &ReactorHandle, slot: &WorkerSlot, header: &Header, payload: Bytes) {
        let ctx = &self.ctx;
        match (header.kind, self.kind) {
            (Kind::Command, _) => ctx.serve_command(header, &payload),
            (Kind::PipeMessage, _) => {
                ctx.emit(Event::PipeMessage {
                    src_worker_id: header.source as u32,
                    data: &payload,
                });
            }
            (Kind::Connect, ProcessType::EventWorker) => {
                ctx.emit(Event::Connect {
                    session_id: header.fd,
                    listener: header.target,
                });
            }
            (Kind::Receive, ProcessType::EventWorker) => {
                slot.incr_request();
                Counters::incr(&ctx.shared().counters.request_count);
                ctx.emit(Event::Receive {
                    session_id: header.fd,
                    listener: header.target,
                    data: &payload,
                });
                self.count_request(h);
            }
            (Kind::Close, ProcessType::EventWorker) => {
                ctx.reset_senders(header.fd);
                self.inbound.borrow_mut().discard(header.fd);
                ctx.emit(Event::Close {
                    session_id: header.fd,
                    reason: CloseReason::from_u8(header.aux as u8),
                });
            }
            (Kind::Packet, ProcessType::EventWorker) => {
                slot.incr_request();
                Counters::incr(&ctx.shared().counters.request_count);
                match decode_packet(payload) {
                    Ok((peer, data)) => {
                        ctx.emit(Event::Packet {
                            listener: header.target,
                            peer: &peer,
                            data: &data,
                        });
                    }
                    Err(e) => warn!(worker_id = self.slot_id, error = %e, "malformed packet dropped"),
                }
                self.count_request(h);
            }
            (Kind::BufferFull, ProcessType::EventWorker) => {
                ctx.emit(Event::BufferFull { session_id: header.fd });
            }
            (Kind::BufferEmpty, ProcessType::EventWorker) => {
                ctx.wake_senders(header.fd);
                ctx.emit(Event::BufferEmpty { session_id: header.fd });
            }
            (Kind::Task, ProcessType::TaskWorker) => {
                let env = Envelope {
                    header: *header,
                    payload,
                };
                match TaskChannel::receive(&env) {
                    Ok(task) => {
                        slot.incr_request();
                        let task = Rc::new(task);
                        ctx.set_current_task(Some(task.clone()));
                        ctx.emit(Event::Task(task.as_ref()));
                        ctx.set_current_task(None);
                        ctx.shared().tasks.complete(&task, self.slot_id);
                    }
                    Err(e) => {
                        warn!(worker_id = self.slot_id, task_id = header.fd, error = %e, "task dropped");
                        ctx.shared().tasks.reject(&env, self.slot_id);
                    }
                }
                self.count_request(h);
            }
            (kind, worker) => {
                warn!(?kind, worker = worker.name(), "unexpected envelope dropped");
            }
        }
    }

    fn count_request(&self, h: &ReactorHandle) {
        let state = self.budget.borrow_mut().on_request();
        if state != BudgetState::Running {
            self.begin_drain(h, "max_request reached");
        }
    }

    fn begin_drain(&self, h: &ReactorHandle, why: &'static str) {
        if self.draining.replace(true) {
            return;
        }
        self.budget.borrow_mut().begin_drain();
        let Some(slot) = self.slot() else {
            return;
        };
        if self.is_current(slot) {
            slot.set_status(WorkerStatus::Exiting);
        }
        info!(worker_id = self.slot_id, generation = self.generation, why, "worker draining");
        let stopping = Envelope::control(Kind::WorkerStopping, 0)
            .with_source(self.slot_id as u16)
            .with_aux(self.generation);
        if let Err(e) = self.ctx.shared().workers.manager.send(&stopping) {
            warn!(worker_id = self.slot_id, error = %e, "could not notify the supervisor");
        }
        self.ctx.emit(Event::WorkerStop { worker_id: self.slot_id });

        let worker_id = self.slot_id;
        let max_wait = self.ctx.config().max_wait_duration();
        h.add_detached_timer(max_wait, move |h| {
            warn!(worker_id, ?max_wait, "max_wait_time exceeded, forcing exit");
            h.stop();
        });
    }

    fn stop_reading(&self, h: &ReactorHandle, fd: RawFd) {
        if h.remove(fd) {
            debug!(worker_id = self.slot_id, "worker stopped reading its pipe");
        }
    }

    fn on_reply(&self, pipes: &ReplyPipes) {
        for _ in 0..READ_BATCH {
            let env = match pipes.reply.try_recv() {
                Ok(Some(env)) => env,
                Ok(None) => return,
                Err(e) => {
                    warn!(worker_id = self.slot_id, error = %e, "bad envelope on reply pipe");
                    continue;
                }
            };
            let assembled = self.replies.borrow_mut().push(env);
            let Some((header, payload)) = assembled else {
                continue;
            };
            match header.kind {
                Kind::Finish => {
                    let env = Envelope { header, payload };
                    match TaskChannel::finished(&env) {
                        Ok(finished) => self.ctx.resolve_task(finished),
                        Err(e) => warn!(task_id = header.fd, error = %e, "malformed task result"),
                    }
                }
                Kind::CommandResponse => self.ctx.on_command_response(&header, &payload),
                kind => warn!(?kind, "unexpected envelope on reply pipe"),
            }
        }
    }
}

/// A user worker runs its closure, then keeps its reactor alive for as long
/// as the closure left timers or coroutines behind.
async fn run_user_worker(
    shared: &Arc<ServerShared>,
    slot: &WorkerSlot,
    reactor: &Reactor,
    ctx: &Context,
    replies: &Arc<ReplyPipes>,
) -> io::Result<()> {
    let index = slot.id - shared.workers.core_worker_num();
    let Some(body) = shared.user_workers.get(index as usize).cloned() else {
        return Err(io::Error::new(io::ErrorKind::NotFound, "no user worker body"));
    };

    let inbound_ctx = ctx.clone();
    let slot_id = slot.id;
    let generation = ctx.generation();
    let assembler = Rc::new(RefCell::new(Assembler::default()));
    let inbound_assembler = assembler.clone();
    reactor
        .add(slot.pipe.rx_fd(), Interest::READABLE, move |h, _, _| {
            let Some(slot) = inbound_ctx.shared().workers.slot(slot_id) else {
                return;
            };
            for _ in 0..READ_BATCH {
                let env = match slot.pipe.try_recv() {
                    Ok(Some(env)) => env,
                    Ok(None) => return,
                    Err(e) => {
                        warn!(worker_id = slot_id, error = %e, "bad envelope on worker pipe");
                        continue;
                    }
                };
                if env.kind() == Kind::Stop {
                    if env.header.aux > generation {
                        let _ = slot.pipe.send(&env);
                        return;
                    }
                    if env.header.aux == generation {
                        h.stop();
                    }
                    continue;
                }
                let assembled = inbound_assembler.borrow_mut().push(env);
                match assembled {
                    Some((header, payload)) if header.kind == Kind::Command => {
                        inbound_ctx.serve_command(&header, &payload)
                    }
                    Some((header, _)) => warn!(kind = ?header.kind, "unexpected envelope dropped"),
                    None => {}
                }
            }
        })
        .map_err(io::Error::from)?;
    let reply_ctx = ctx.clone();
    let reply_pipes = replies.clone();
    reactor
        .add(replies.reply.rx_fd(), Interest::READABLE, move |_, _, _| {
            while let Ok(Some(env)) = reply_pipes.reply.try_recv() {
                let assembled = assembler.borrow_mut().push(env);
                if let Some((header, payload)) = assembled
                    && header.kind == Kind::CommandResponse
                {
                    reply_ctx.on_command_response(&header, &payload);
                }
            }
        })
        .map_err(io::Error::from)?;
    let co = ctx.clone();
    reactor.set_exit_condition(ExitTag::Coroutines, move |_, _| co.coroutine_num() == 0);
    let pending = ctx.clone();
    reactor.set_exit_condition(ExitTag::Custom("pipes"), move |_, event_num| {
        if !pending.has_pending() {
            *event_num = event_num.saturating_sub(2);
        }
        true
    });

    info!(worker_id = slot.id, generation, "user worker started");
    if slot.generation() == generation {
        slot.set_status(WorkerStatus::Busy);
    }
    body(ctx);
    reactor.run_with::<TokioRuntime>().await;
    info!(worker_id = slot.id, generation, "user worker exited");
    Ok(())
}
