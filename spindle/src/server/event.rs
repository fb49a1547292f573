use super::context::Context;
use crate::connection::{CloseReason, PeerAddr, SessionId};
use crate::task::{IncomingTask, TaskId};
use bytes::Bytes;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::error;

/// Server callbacks, in handler-table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEvent {
    Start,
    Shutdown,
    ManagerStart,
    ManagerStop,
    WorkerStart,
    WorkerStop,
    WorkerExit,
    WorkerError,
    BeforeReload,
    AfterReload,
    Connect,
    Receive,
    Close,
    Packet,
    BufferFull,
    BufferEmpty,
    Task,
    Finish,
    PipeMessage,
}

const EVENT_NUM: usize = 19;

impl ServerEvent {
    pub const ALL: [ServerEvent; EVENT_NUM] = [
        ServerEvent::Start,
        ServerEvent::Shutdown,
        ServerEvent::ManagerStart,
        ServerEvent::ManagerStop,
        ServerEvent::WorkerStart,
        ServerEvent::WorkerStop,
        ServerEvent::WorkerExit,
        ServerEvent::WorkerError,
        ServerEvent::BeforeReload,
        ServerEvent::AfterReload,
        ServerEvent::Connect,
        ServerEvent::Receive,
        ServerEvent::Close,
        ServerEvent::Packet,
        ServerEvent::BufferFull,
        ServerEvent::BufferEmpty,
        ServerEvent::Task,
        ServerEvent::Finish,
        ServerEvent::PipeMessage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ServerEvent::Start => "start",
            ServerEvent::Shutdown => "shutdown",
            ServerEvent::ManagerStart => "manager_start",
            ServerEvent::ManagerStop => "manager_stop",
            ServerEvent::WorkerStart => "worker_start",
            ServerEvent::WorkerStop => "worker_stop",
            ServerEvent::WorkerExit => "worker_exit",
            ServerEvent::WorkerError => "worker_error",
            ServerEvent::BeforeReload => "before_reload",
            ServerEvent::AfterReload => "after_reload",
            ServerEvent::Connect => "connect",
            ServerEvent::Receive => "receive",
            ServerEvent::Close => "close",
            ServerEvent::Packet => "packet",
            ServerEvent::BufferFull => "buffer_full",
            ServerEvent::BufferEmpty => "buffer_empty",
            ServerEvent::Task => "task",
            ServerEvent::Finish => "finish",
            ServerEvent::PipeMessage => "pipe_message",
        }
    }

    /// Case-insensitive lookup; `workerStart` and `worker_start` both match.
    pub fn from_name(name: &str) -> Option<ServerEvent> {
        let wanted: String = name
            .chars()
            .filter(|c| *c != '_')
            .flat_map(char::to_lowercase)
            .collect();
        let wanted = wanted.strip_prefix("on").unwrap_or(&wanted);
        Self::ALL
            .into_iter()
            .find(|ev| ev.name().replace('_', "") == wanted)
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Payload of a callback invocation.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Start,
    Shutdown,
    ManagerStart,
    ManagerStop,
    WorkerStart { worker_id: u32 },
    WorkerStop { worker_id: u32 },
    WorkerExit { worker_id: u32 },
    WorkerError { worker_id: u32, generation: u32 },
    BeforeReload,
    AfterReload,
    Connect { session_id: SessionId, listener: u16 },
    Receive { session_id: SessionId, listener: u16, data: &'a Bytes },
    Close { session_id: SessionId, reason: CloseReason },
    Packet { listener: u16, peer: &'a PeerAddr, data: &'a Bytes },
    BufferFull { session_id: SessionId },
    BufferEmpty { session_id: SessionId },
    Task(&'a IncomingTask),
    Finish { task_id: TaskId, data: &'a Bytes },
    PipeMessage { src_worker_id: u32, data: &'a Bytes },
}

impl Event<'_> {
    pub fn kind(&self) -> ServerEvent {
        match self {
            Event::Start => ServerEvent::Start,
            Event::Shutdown => ServerEvent::Shutdown,
            Event::ManagerStart => ServerEvent::ManagerStart,
            Event::ManagerStop => ServerEvent::ManagerStop,
            Event::WorkerStart { .. } => ServerEvent::WorkerStart,
            Event::WorkerStop { .. } => ServerEvent::WorkerStop,
            Event::WorkerExit { .. } => ServerEvent::WorkerExit,
            Event::WorkerError { .. } => ServerEvent::WorkerError,
            Event::BeforeReload => ServerEvent::BeforeReload,
            Event::AfterReload => ServerEvent::AfterReload,
            Event::Connect { .. } => ServerEvent::Connect,
            Event::Receive { .. } => ServerEvent::Receive,
            Event::Close { .. } => ServerEvent::Close,
            Event::Packet { .. } => ServerEvent::Packet,
            Event::BufferFull { .. } => ServerEvent::BufferFull,
            Event::BufferEmpty { .. } => ServerEvent::BufferEmpty,
            Event::Task(_) => ServerEvent::Task,
            Event::Finish { .. } => ServerEvent::Finish,
            Event::PipeMessage { .. } => ServerEvent::PipeMessage,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&Context, Event<'_>) + Send + Sync>;

/// Fixed-size handler table indexed by [`ServerEvent`].
#[derive(Clone, Default)]
pub struct EventTable {
    handlers: [Option<EventHandler>; EVENT_NUM],
}

impl EventTable {
    pub fn set(&mut self, kind: ServerEvent, handler: EventHandler) {
        self.handlers[kind.index()] = Some(handler);
    }

    pub fn has(&self, kind: ServerEvent) -> bool {
        self.handlers[kind.index()].is_some()
    }

    /// Invoke the handler for `event`. A panicking handler is logged and
    /// treated as handled. Returns false if no handler is set.
    pub fn emit(&self, ctx: &Context, event: Event<'_>) -> bool {
        let kind = event.kind();
        let Some(handler) = &self.handlers[kind.index()] else {
            return false;
        };
        if catch_unwind(AssertUnwindSafe(|| handler(ctx, event))).is_err() {
            error!(
                event = kind.name(),
                worker_id = ctx.worker_id(),
                "event handler panicked"
            );
        }
        true
    }
}
