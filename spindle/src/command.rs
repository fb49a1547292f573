//! Control-plane RPC between execution units.
//!
//! Commands are registered by name before the server starts, each with the
//! set of process types allowed to run it. An invocation travels as a
//! `Command` envelope to the target's inbound pipe; the target runs the
//! handler and answers with a `CommandResponse` carrying the request id.
//!
//! The reactor thread never runs user handlers. Only built-in commands such
//! as [`SERVER_STATS`] are accepted there.

use crate::error::{BoxError, CommandError, ConfigError};
use crate::worker::ProcessType;
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::warn;

/// Built-in command returning the statistics snapshot as JSON.
pub const SERVER_STATS: &str = "server_stats";

/// Set of process types a command may run in.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ProcessTypes(u8);

impl ProcessTypes {
    pub const MANAGER: ProcessTypes = ProcessTypes(1);
    pub const REACTOR_THREAD: ProcessTypes = ProcessTypes(1 << 1);
    pub const EVENT_WORKER: ProcessTypes = ProcessTypes(1 << 2);
    pub const TASK_WORKER: ProcessTypes = ProcessTypes(1 << 3);
    pub const WORKERS: ProcessTypes = ProcessTypes(1 << 2 | 1 << 3);
    pub const ALL: ProcessTypes = ProcessTypes(0b1111);

    pub fn of(kind: ProcessType) -> ProcessTypes {
        match kind {
            ProcessType::Manager => Self::MANAGER,
            ProcessType::ReactorThread => Self::REACTOR_THREAD,
            ProcessType::EventWorker => Self::EVENT_WORKER,
            ProcessType::TaskWorker => Self::TASK_WORKER,
            ProcessType::UserWorker => ProcessTypes(0),
        }
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: ProcessTypes) -> bool {
        self.0 & other.0 != 0
    }

    pub fn accepts(self, kind: ProcessType) -> bool {
        self.intersects(Self::of(kind))
    }
}

impl BitOr for ProcessTypes {
    type Output = ProcessTypes;
    fn bitor(self, rhs: ProcessTypes) -> ProcessTypes {
        ProcessTypes(self.0 | rhs.0)
    }
}

impl fmt::Debug for ProcessTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::MANAGER, "MANAGER"),
            (Self::REACTOR_THREAD, "REACTOR_THREAD"),
            (Self::EVENT_WORKER, "EVENT_WORKER"),
            (Self::TASK_WORKER, "TASK_WORKER"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.intersects(*bit))
        .map(|(_, name)| name)
        .collect();
        write!(f, "ProcessTypes({})", names.join("|"))
    }
}

pub type CommandHandler<C> = Arc<dyn Fn(&C, &str) -> Result<String, BoxError> + Send + Sync>;

pub struct Command<C> {
    pub id: u16,
    pub name: String,
    pub accepted: ProcessTypes,
    handler: CommandHandler<C>,
}

/// Structured error payload returned in place of a handler's output.
pub fn error_json(code: i32, data: &str) -> String {
    serde_json::json!({ "code": code, "data": data }).to_string()
}

/// Named commands, generic over the context handed to handlers.
pub struct CommandRegistry<C> {
    by_name: HashMap<String, u16>,
    commands: Vec<Command<C>>,
    sealed: bool,
}

impl<C> Default for CommandRegistry<C> {
    fn default() -> Self {
        Self {
            by_name: HashMap::new(),
            commands: Vec::new(),
            sealed: false,
        }
    }
}

impl<C> CommandRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, accepted: ProcessTypes, handler: F) -> Result<u16, ConfigError>
    where
        F: Fn(&C, &str) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        if accepted.intersects(ProcessTypes::REACTOR_THREAD) {
            return Err(ConfigError::Command(
                name.to_string(),
                "the reactor thread cannot run user commands",
            ));
        }
        self.insert(name, accepted, Arc::new(handler))
    }

    pub(crate) fn register_builtin(
        &mut self,
        name: &str,
        accepted: ProcessTypes,
        handler: CommandHandler<C>,
    ) -> Result<u16, ConfigError> {
        self.insert(name, accepted, handler)
    }

    fn insert(&mut self, name: &str, accepted: ProcessTypes, handler: CommandHandler<C>) -> Result<u16, ConfigError> {
        if self.sealed {
            return Err(ConfigError::Command(name.to_string(), "server already started"));
        }
        if name.is_empty() {
            return Err(ConfigError::Command(name.to_string(), "empty name"));
        }
        if accepted.is_empty() {
            return Err(ConfigError::Command(name.to_string(), "empty process type mask"));
        }
        if self.by_name.contains_key(name) {
            return Err(ConfigError::Command(name.to_string(), "already registered"));
        }
        let id = u16::try_from(self.commands.len())
            .map_err(|_| ConfigError::Command(name.to_string(), "too many commands"))?;
        self.by_name.insert(name.to_string(), id);
        self.commands.push(Command {
            id,
            name: name.to_string(),
            accepted,
            handler,
        });
        Ok(id)
    }

    /// Freeze the registry; later registrations fail.
    pub fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn lookup(&self, name: &str) -> Option<&Command<C>> {
        let id = self.by_name.get(name)?;
        self.commands.get(*id as usize)
    }

    pub fn get(&self, id: u16) -> Option<&Command<C>> {
        self.commands.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Run command `id` and produce its response payload. Failures become a
    /// structured error payload.
    pub fn execute(&self, ctx: &C, id: u16, payload: &str) -> String {
        let Some(command) = self.get(id) else {
            warn!(command_id = id, "request for an unknown command");
            return error_json(-3, "unknown command");
        };
        match catch_unwind(AssertUnwindSafe(|| (command.handler)(ctx, payload))) {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => {
                warn!(command = %command.name, error = %e, "command handler failed");
                error_json(-1, "failed to call function")
            }
            Err(_) => {
                warn!(command = %command.name, "command handler panicked");
                error_json(-2, "handler panicked")
            }
        }
    }
}

/// Outstanding invocations of one execution unit, keyed by request id.
#[derive(Default)]
pub struct PendingCommands {
    next: u64,
    waiting: HashMap<u64, oneshot::Sender<Result<String, CommandError>>>,
}

impl PendingCommands {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self) -> (u64, oneshot::Receiver<Result<String, CommandError>>) {
        let (tx, rx) = oneshot::channel();
        self.next += 1;
        self.waiting.insert(self.next, tx);
        (self.next, rx)
    }

    /// Deliver a response; false if the request already completed or expired.
    pub fn complete(&mut self, request_id: u64, response: String) -> bool {
        self.resolve(request_id, Ok(response))
    }

    pub fn fail(&mut self, request_id: u64, error: CommandError) -> bool {
        self.resolve(request_id, Err(error))
    }

    fn resolve(&mut self, request_id: u64, result: Result<String, CommandError>) -> bool {
        match self.waiting.remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    pub fn clear(&mut self) {
        self.waiting.clear();
    }
}
