//! Server assembly and lifecycle.
//!
//! A [`Server`] collects configuration, callbacks, commands and user worker
//! bodies, then [`Server::start`] turns the calling thread into the
//! supervisor and blocks until shutdown.
//!
//! # Architecture
//!
//! ```text
//!            caller thread: supervisor (signals, respawn, reload)
//!                 |
//!   +-------------+----------------+-------------------+
//!   |                              |                   |
//! spindle-reactor            spindle-worker-N     spindle-task-N / spindle-user-N
//! (listeners, streams,  <--->  (event callbacks,   (task handler,
//!  dispatch, output)            send, tasks)         user bodies)
//! ```
//!
//! Every thread runs its own [`Reactor`](crate::reactor::Reactor); they talk
//! only through envelopes on datagram pipes and the shared counter block.
//!
//! # Example
//!
//! ```no_run
//! use spindle::server::{Event, Server, ServerConfig};
//!
//! let config = ServerConfig::new()
//!     .listen_tcp("127.0.0.1:9501".parse().unwrap())
//!     .worker_num(2);
//! let mut server = Server::new(config).on_event(spindle::server::ServerEvent::Receive, |ctx, ev| {
//!     if let Event::Receive { session_id, data, .. } = ev {
//!         let _ = ctx.send(session_id, data.clone());
//!     }
//! });
//! server.start().unwrap();
//! ```

mod config;
mod context;
mod event;
mod listener;
mod manager;
mod master;
mod send_yield;
mod worker;

pub use config::{
    DEFAULT_MAX_CONNECTION, DEFAULT_OUTPUT_BUFFER_SIZE, DEFAULT_PIPE_BUFFER_SIZE, MAX_CONNECTION,
    MAX_WORKERS, MAX_WORKERS_PER_CPU, ServerConfig,
};
pub use context::Context;
pub use event::{Event, EventHandler, ServerEvent};
pub use listener::{ListenAddr, ListenerConfig};

use crate::command::{CommandRegistry, ProcessTypes, SERVER_STATS};
use crate::connection::{ConnectionTable, SessionId, unix_micros};
use crate::dispatch::{DispatchContext, DispatchDecision, DispatchFn};
use crate::error::{BoxError, ConfigError, Error, Result};
use crate::ipc::{Envelope, Kind};
use crate::stats::{Counters, SharedBlock, StatsSnapshot};
use crate::task::{IncomingTask, TaskChannel};
use crate::worker::{ProcessType, WorkerTable};
use bytes::Bytes;
use event::EventTable;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Body of a user worker, run once per incarnation.
pub type UserWorkerFn = Arc<dyn Fn(&Context) + Send + Sync>;

/// State shared by every thread of a running server.
pub(crate) struct ServerShared {
    pub config: ServerConfig,
    pub counters: Arc<SharedBlock>,
    pub connections: ConnectionTable,
    pub workers: Arc<WorkerTable>,
    pub tasks: TaskChannel,
    pub events: EventTable,
    pub commands: CommandRegistry<Context>,
    pub dispatch_func: Option<Arc<DispatchFn>>,
    pub user_workers: Vec<UserWorkerFn>,
    pub shutting_down: AtomicBool,
    pub lifecycle: Arc<Lifecycle>,
}

impl ServerShared {
    pub fn stats(&self) -> StatsSnapshot {
        let mut stats = StatsSnapshot::from_counters(&self.counters);
        stats.connection_num = self.connections.len() as u64;
        stats.session_round = self.connections.session_round();
        if let Some((min_fd, max_fd)) = self.connections.fd_range() {
            stats.min_fd = min_fd;
            stats.max_fd = max_fd;
        }
        stats.worker_num = self.workers.worker_num();
        stats.task_worker_num = self.workers.task_worker_num();
        stats.user_worker_num = self.workers.user_worker_num();
        stats.idle_worker_num = self.workers.idle_count(ProcessType::EventWorker);
        stats.task_idle_worker_num = self.workers.idle_count(ProcessType::TaskWorker);
        stats
    }

    pub fn request_reload(&self, only_task_workers: bool) -> Result<()> {
        let env = Envelope::control(Kind::Reload, 0).with_target(only_task_workers as u16);
        self.workers.manager.send(&env)?;
        Ok(())
    }

    pub fn request_shutdown(&self) -> Result<()> {
        self.workers.manager.send(&Envelope::control(Kind::Shutdown, 0))?;
        Ok(())
    }
}

#[derive(Default)]
struct LifecycleState {
    started: bool,
    stopped: bool,
    shared: Option<Arc<ServerShared>>,
    local_addrs: Vec<ListenAddr>,
}

/// Start/stop notifications observed through [`ServerHandle`].
#[derive(Default)]
pub(crate) struct Lifecycle {
    state: Mutex<LifecycleState>,
    cond: Condvar,
}

impl Lifecycle {
    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock()
    }

    fn attach(&self, shared: Arc<ServerShared>, local_addrs: Vec<ListenAddr>) {
        let mut state = self.lock();
        state.shared = Some(shared);
        state.local_addrs = local_addrs;
    }

    fn detach(&self) {
        let mut state = self.lock();
        state.shared = None;
        state.stopped = true;
        self.cond.notify_all();
    }

    /// Listeners are open and the reactor thread is serving.
    pub fn mark_started(&self) {
        let mut state = self.lock();
        state.started = true;
        self.cond.notify_all();
    }

    fn shared(&self) -> Option<Arc<ServerShared>> {
        self.lock().shared.clone()
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&LifecycleState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        while !done(&state) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.cond.wait_until(&mut state, deadline);
        }
        true
    }
}

/// Thread-safe control surface of a server, usable from any thread.
#[derive(Clone)]
pub struct ServerHandle {
    lifecycle: Arc<Lifecycle>,
}

impl ServerHandle {
    fn shared(&self) -> Result<Arc<ServerShared>> {
        self.lifecycle.shared().ok_or(Error::NotRunning)
    }

    /// Gracefully restart event and task workers, or task workers only.
    pub fn reload(&self, only_task_workers: bool) -> Result<()> {
        self.shared()?.request_reload(only_task_workers)
    }

    /// Stop accepting, drain workers and make [`Server::start`] return.
    pub fn shutdown(&self) -> Result<()> {
        self.shared()?.request_shutdown()
    }

    pub fn stats(&self) -> Result<StatsSnapshot> {
        Ok(self.shared()?.stats())
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.shared().is_some()
    }

    /// Wait until the server accepts connections. False on timeout or if the
    /// server stopped without starting.
    pub fn wait_started(&self, timeout: Duration) -> bool {
        self.lifecycle
            .wait_until(timeout, |s| s.started || s.stopped)
            && self.lifecycle.lock().started
    }

    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_until(timeout, |s| s.stopped)
    }

    /// Bound addresses, with ephemeral ports resolved.
    pub fn local_addrs(&self) -> Vec<ListenAddr> {
        self.lifecycle.lock().local_addrs.clone()
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("running", &self.is_running())
            .finish()
    }
}

/// Builder and owner of one server instance.
pub struct Server {
    config: ServerConfig,
    events: EventTable,
    commands: CommandRegistry<Context>,
    dispatch_func: Option<Arc<DispatchFn>>,
    user_workers: Vec<UserWorkerFn>,
    lifecycle: Arc<Lifecycle>,
    started: bool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let mut commands = CommandRegistry::new();
        if let Err(e) = commands.register_builtin(
            SERVER_STATS,
            ProcessTypes::ALL,
            Arc::new(|ctx: &Context, _: &str| -> std::result::Result<String, BoxError> {
                Ok(serde_json::to_string(&ctx.stats())?)
            }),
        ) {
            warn!(error = %e, "builtin command not registered");
        }
        Self {
            config,
            events: EventTable::default(),
            commands,
            dispatch_func: None,
            user_workers: Vec::new(),
            lifecycle: Arc::new(Lifecycle::default()),
            started: false,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Register a callback by event name (`"receive"`, `"onWorkerStart"`, ...).
    pub fn on<F>(self, name: &str, handler: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&Context, Event<'_>) + Send + Sync + 'static,
    {
        let kind = ServerEvent::from_name(name).ok_or_else(|| ConfigError::UnknownEvent(name.to_string()))?;
        Ok(self.on_event(kind, handler))
    }

    pub fn on_event<F>(mut self, kind: ServerEvent, handler: F) -> Self
    where
        F: Fn(&Context, Event<'_>) + Send + Sync + 'static,
    {
        self.events.set(kind, Arc::new(handler));
        self
    }

    /// Shorthand for a Receive callback.
    pub fn on_receive<F>(self, handler: F) -> Self
    where
        F: Fn(&Context, SessionId, &Bytes) + Send + Sync + 'static,
    {
        self.on_event(ServerEvent::Receive, move |ctx, event| {
            if let Event::Receive { session_id, data, .. } = event {
                handler(ctx, session_id, data);
            }
        })
    }

    /// Task handler; a returned value is sent back as the task result.
    pub fn on_task<F>(self, handler: F) -> Self
    where
        F: Fn(&Context, &IncomingTask) -> Option<Bytes> + Send + Sync + 'static,
    {
        self.on_event(ServerEvent::Task, move |ctx, event| {
            if let Event::Task(task) = event
                && let Some(result) = handler(ctx, task)
            {
                task.finish(result);
            }
        })
    }

    /// Route connections and packets with `f`; the configured mode becomes the fallback.
    pub fn set_dispatch_func<F>(mut self, f: F) -> Self
    where
        F: Fn(&DispatchContext<'_>, u32) -> DispatchDecision + Send + Sync + 'static,
    {
        self.dispatch_func = Some(Arc::new(f));
        self
    }

    pub fn add_command<F>(
        mut self,
        name: &str,
        accepted: ProcessTypes,
        handler: F,
    ) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&Context, &str) -> std::result::Result<String, BoxError> + Send + Sync + 'static,
    {
        self.commands.register(name, accepted, handler)?;
        Ok(self)
    }

    /// Run `body` on a dedicated thread for the life of the server. The body
    /// may start coroutines with [`Context::go`]; it is run again if it
    /// returns before shutdown.
    pub fn add_user_worker<F>(mut self, body: F) -> Self
    where
        F: Fn(&Context) + Send + Sync + 'static,
    {
        self.user_workers.push(Arc::new(body));
        self
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            lifecycle: self.lifecycle.clone(),
        }
    }

    /// Bind the listeners, start every thread and supervise them until shutdown.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            error!("server is already running");
            return Err(Error::AlreadyRunning);
        }
        self.config.validate()?;
        if self.config.task_worker_num > 0 && !self.events.has(ServerEvent::Task) {
            return Err(ConfigError::MissingTaskHandler.into());
        }
        self.started = true;
        let result = self.launch();
        self.lifecycle.detach();
        if let Err(e) = &result {
            error!(error = %e, "server stopped with an error");
        }
        result
    }

    fn launch(&mut self) -> Result<()> {
        let config = self.config.clone();
        let mut listeners = Vec::with_capacity(config.listeners.len());
        for (index, listener) in config.listeners.iter().enumerate() {
            let bound = listener::bind(index as u16, listener, config.backlog).map_err(|e| {
                error!(addr = %listener.addr, error = %e, "failed to bind listener");
                Error::fatal("listener", e)
            })?;
            listeners.push(bound);
        }

        let counters = Arc::new(SharedBlock::new().map_err(|e| Error::fatal("shared counters", e))?);
        Counters::add(&counters.start_time, unix_micros() / 1_000_000);
        let workers = Arc::new(
            WorkerTable::new(
                config.worker_num,
                config.task_worker_num,
                self.user_workers.len() as u32,
            )
            .map_err(|e| Error::fatal("worker pipes", e))?,
        );
        self.commands.seal();
        let local_addrs = listeners.iter().map(|l| l.local.clone()).collect::<Vec<_>>();
        let shared = Arc::new(ServerShared {
            connections: ConnectionTable::new(config.max_connection, config.start_session_id),
            tasks: TaskChannel::new(workers.clone(), counters.clone(), config.task_tmpdir.clone()),
            counters,
            workers,
            events: self.events.clone(),
            commands: std::mem::take(&mut self.commands),
            dispatch_func: self.dispatch_func.clone(),
            user_workers: self.user_workers.clone(),
            shutting_down: AtomicBool::new(false),
            lifecycle: self.lifecycle.clone(),
            config,
        });
        info!(
            listeners = ?local_addrs.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "server starting"
        );
        self.lifecycle.attach(shared.clone(), local_addrs);
        manager::run(&shared, listeners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_rejects_missing_task_handler() {
        let config = ServerConfig::new()
            .listen_tcp("127.0.0.1:0".parse().unwrap())
            .worker_num(1)
            .task_worker_num(1)
            .enable_signals(false);
        let mut server = Server::new(config);
        let err = server.start().unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::MissingTaskHandler)));
    }

    #[test]
    fn test_start_rejects_missing_listener() {
        let mut server = Server::new(ServerConfig::new().worker_num(1));
        assert!(matches!(
            server.start().unwrap_err(),
            Error::Config(ConfigError::NoListener)
        ));
    }

    #[test]
    fn test_unknown_event_name() {
        let server = Server::new(ServerConfig::new());
        let err = server.on("request", |_, _| {}).err().unwrap();
        assert_eq!(err, ConfigError::UnknownEvent("request".to_string()));
    }

    #[test]
    fn test_builtin_command_name_is_taken() {
        let server = Server::new(ServerConfig::new());
        let err = server
            .add_command(SERVER_STATS, ProcessTypes::WORKERS, |_, _| Ok(String::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Command(..)));
    }

    #[test]
    fn test_handle_before_start() {
        let server = Server::new(ServerConfig::new());
        let handle = server.handle();
        assert!(!handle.is_running());
        assert!(matches!(handle.shutdown(), Err(Error::NotRunning)));
        assert!(!handle.wait_started(Duration::from_millis(10)));
        assert!(handle.local_addrs().is_empty());
    }
}
