//! The supervisor.
//!
//! Runs on the thread that called [`Server::start`](super::Server::start).
//! It starts the reactor thread and every worker slot, then serves its own
//! pipe: replacement spawns for draining workers, respawns after unexpected
//! exits, reload and shutdown requests, and commands addressed to the
//! manager. Process signals are bound here when enabled.

use super::ServerShared;
use super::context::Context;
use super::event::Event;
use super::listener::BoundListener;
use super::{master, worker};
use crate::connection::unix_micros;
use crate::error::{Error, Result};
use crate::ipc::{Assembler, Envelope, Header, Kind};
use crate::reactor::{Interest, Reactor, ReactorHandle};
use crate::signal::{SafetyMode, SignalBridge};
use crate::stats::Counters;
use crate::worker::ProcessType;
use nix::libc;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Incarnations that lived shorter than this are respawned after the same delay.
const RESPAWN_THROTTLE: Duration = Duration::from_secs(1);
const PIPE_BATCH: usize = 64;

type Incarnation = (u32, u32);

struct Supervisor {
    ctx: Context,
    shared: Arc<ServerShared>,
    threads: RefCell<HashMap<Incarnation, JoinHandle<()>>>,
    /// Draining incarnations whose replacement is already running.
    replaced: RefCell<HashSet<Incarnation>>,
    reloading: RefCell<HashSet<Incarnation>>,
    assembler: RefCell<Assembler>,
    spawn_failed: Cell<bool>,
}

pub(crate) fn run(shared: &Arc<ServerShared>, listeners: Vec<BoundListener>) -> Result<()> {
    let reactor = Reactor::new();
    let h = reactor.handle();
    let sup = Rc::new(Supervisor {
        ctx: Context::new(ProcessType::Manager, 0, 0, shared.clone(), h.clone(), None),
        shared: shared.clone(),
        threads: RefCell::new(HashMap::new()),
        replaced: RefCell::new(HashSet::new()),
        reloading: RefCell::new(HashSet::new()),
        assembler: RefCell::new(Assembler::default()),
        spawn_failed: Cell::new(false),
    });

    // Registered before any thread exists so kernel-queue masks are inherited.
    let bridge = if shared.config.enable_signals {
        let bridge = SignalBridge::new(shared.config.signal_backend);
        bridge.bind_to_reactor(&h);
        bind_signals(&bridge, &sup)?;
        Some(bridge)
    } else {
        None
    };

    let s = sup.clone();
    h.add(shared.workers.manager.rx_fd(), Interest::READABLE, move |h, _, _| s.on_pipe(h))
        .map_err(|errno| Error::fatal("supervisor pipe", errno))?;

    sup.ctx.emit(Event::ManagerStart);
    let master = match master::spawn(shared.clone(), listeners) {
        Ok(handle) => handle,
        Err(e) => {
            error!(error = %e, "failed to start the reactor thread");
            sup.ctx.emit(Event::ManagerStop);
            if let Some(bridge) = &bridge {
                bridge.clear();
            }
            return Err(Error::fatal("reactor thread", e));
        }
    };
    info!(
        pid = std::process::id(),
        worker_num = shared.workers.worker_num(),
        task_worker_num = shared.workers.task_worker_num(),
        user_worker_num = shared.workers.user_worker_num(),
        "supervisor started"
    );
    for slot in shared.workers.slots() {
        if !sup.spawn(slot.id) {
            sup.spawn_failed.set(true);
            sup.begin_shutdown(&h);
            break;
        }
    }

    let code = reactor.run();
    debug!(code, "supervisor loop exited");

    if !shared.shutting_down.load(Ordering::Acquire) {
        shared.shutting_down.store(true, Ordering::Release);
        let _ = shared.workers.master.send(&Envelope::control(Kind::Shutdown, 0));
    }
    if master.join().is_err() {
        error!("reactor thread panicked");
    }
    let leftover = sup.threads.borrow().len();
    if leftover > 0 {
        warn!(leftover, "workers still running at supervisor exit, detaching");
        sup.threads.borrow_mut().clear();
    }
    sup.ctx.emit(Event::ManagerStop);
    if let Some(bridge) = &bridge {
        bridge.clear();
    }
    info!("supervisor stopped");

    if sup.spawn_failed.get() {
        return Err(Error::fatal(
            "worker spawn",
            std::io::Error::other("a worker thread could not be started"),
        ));
    }
    Ok(())
}

fn bind_signals(bridge: &SignalBridge, sup: &Rc<Supervisor>) -> Result<()> {
    for signo in [libc::SIGTERM, libc::SIGINT] {
        let s = sup.clone();
        bridge.register(
            signo,
            move |signo| {
                info!(signo, "shutdown signal received");
                s.begin_shutdown(s.ctx.reactor());
            },
            SafetyMode::Safe,
        )?;
    }
    for (signo, only_task) in [(libc::SIGUSR1, false), (libc::SIGUSR2, true)] {
        let s = sup.clone();
        bridge.register(
            signo,
            move |signo| {
                info!(signo, only_task, "reload signal received");
                s.reload(only_task);
            },
            SafetyMode::Safe,
        )?;
    }
    Ok(())
}

impl Supervisor {
    fn is_shutting_down(&self) -> bool {
        self.shared.shutting_down.load(Ordering::Acquire)
    }

    fn spawn(&self, slot_id: u32) -> bool {
        match worker::spawn(&self.shared, slot_id) {
            Ok((generation, handle)) => {
                debug!(worker_id = slot_id, generation, "worker spawned");
                self.threads.borrow_mut().insert((slot_id, generation), handle);
                true
            }
            Err(e) => {
                error!(worker_id = slot_id, error = %e, "failed to spawn worker");
                false
            }
        }
    }

    fn on_pipe(self: &Rc<Self>, h: &ReactorHandle) {
        for _ in 0..PIPE_BATCH {
            let env = match self.shared.workers.manager.try_recv() {
                Ok(Some(env)) => env,
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "bad envelope on supervisor pipe");
                    continue;
                }
            };
            let assembled = self.assembler.borrow_mut().push(env);
            let Some((header, payload)) = assembled else {
                continue;
            };
            match header.kind {
                Kind::WorkerStopping => self.on_worker_stopping(&header),
                Kind::WorkerExited => self.on_worker_exited(h, &header),
                Kind::Reload => self.reload(header.target != 0),
                Kind::Shutdown => self.begin_shutdown(h),
                Kind::Command => self.ctx.serve_command(&header, &payload),
                kind => warn!(?kind, "unexpected envelope on supervisor pipe"),
            }
        }
    }

    /// A worker began draining: start its replacement right away.
    fn on_worker_stopping(&self, header: &Header) {
        let slot_id = header.source as u32;
        let generation = header.aux;
        if self.is_shutting_down() {
            return;
        }
        let Some(slot) = self.shared.workers.slot(slot_id) else {
            return;
        };
        if slot.generation() != generation {
            debug!(worker_id = slot_id, generation, "stale drain notice");
            return;
        }
        if self.spawn(slot_id) {
            self.replaced.borrow_mut().insert((slot_id, generation));
        }
    }

    fn on_worker_exited(self: &Rc<Self>, h: &ReactorHandle, header: &Header) {
        let slot_id = header.source as u32;
        let generation = header.aux;
        let failed = header.target != 0;
        let key = (slot_id, generation);

        let handle = self.threads.borrow_mut().remove(&key);
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(worker_id = slot_id, generation, "worker thread ended abnormally");
        }
        if failed {
            self.ctx.emit(Event::WorkerError {
                worker_id: slot_id,
                generation,
            });
        }
        info!(worker_id = slot_id, generation, failed, "worker exited");

        let finished_reload = {
            let mut reloading = self.reloading.borrow_mut();
            reloading.remove(&key) && reloading.is_empty()
        };
        if finished_reload {
            info!("reload finished");
            self.ctx.emit(Event::AfterReload);
        }

        let replaced = self.replaced.borrow_mut().remove(&key);
        if self.is_shutting_down() {
            if self.threads.borrow().is_empty() {
                h.stop();
            }
            return;
        }
        let Some(slot) = self.shared.workers.slot(slot_id) else {
            return;
        };
        if replaced || slot.generation() != generation {
            return;
        }

        Counters::incr(&self.shared.counters.worker_respawn_count);
        let lived = unix_micros().saturating_sub(slot.incarnation().started_at);
        if lived < RESPAWN_THROTTLE.as_micros() as u64 {
            debug!(worker_id = slot_id, lived_us = lived, "worker exited quickly, delaying respawn");
            let s = self.clone();
            h.add_timer(RESPAWN_THROTTLE, move |_| {
                if !s.is_shutting_down() {
                    s.spawn(slot_id);
                }
            });
        } else {
            self.spawn(slot_id);
        }
    }

    fn reload(&self, only_task_workers: bool) {
        if self.is_shutting_down() {
            warn!("reload ignored during shutdown");
            return;
        }
        self.ctx.emit(Event::BeforeReload);
        Counters::incr(&self.shared.counters.reload_count);
        let mut targets = Vec::new();
        for slot in self.shared.workers.slots() {
            let wanted = match slot.kind {
                ProcessType::TaskWorker => true,
                ProcessType::EventWorker => !only_task_workers,
                _ => false,
            };
            if wanted {
                targets.push((slot.id, slot.generation()));
            }
        }
        info!(only_task_workers, workers = targets.len(), "reloading workers");
        if targets.is_empty() {
            self.ctx.emit(Event::AfterReload);
            return;
        }
        self.reloading.borrow_mut().extend(targets.iter().copied());
        for (slot_id, generation) in targets {
            self.send_stop(slot_id, generation);
        }
    }

    fn send_stop(&self, slot_id: u32, generation: u32) {
        let Some(slot) = self.shared.workers.slot(slot_id) else {
            return;
        };
        if let Err(e) = slot.pipe.send(&Envelope::control(Kind::Stop, 0).with_aux(generation)) {
            warn!(worker_id = slot_id, error = %e, "stop request not sent");
        }
    }

    fn begin_shutdown(&self, h: &ReactorHandle) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(workers = self.threads.borrow().len(), "shutting down");
        if let Err(e) = self.shared.workers.master.send(&Envelope::control(Kind::Shutdown, 0)) {
            warn!(error = %e, "shutdown not delivered to the reactor thread");
        }
        for slot in self.shared.workers.slots() {
            self.send_stop(slot.id, slot.generation());
        }
        let max_wait = self.shared.config.max_wait_duration() + Duration::from_secs(1);
        h.add_detached_timer(max_wait, move |h| {
            warn!(?max_wait, "workers did not stop in time");
            h.stop();
        });
        if self.threads.borrow().is_empty() {
            h.stop();
        }
    }
}
