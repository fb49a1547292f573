use nix::errno::Errno;
use std::io;
use thiserror::Error;

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid setup parameter, rejected before anything starts.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// `start()` called on a server that is already running.
    #[error("server is already running")]
    AlreadyRunning,
    #[error("server is not running")]
    NotRunning,
    /// The operation is not available in the calling process role.
    #[error("operation not allowed in {0}")]
    WrongProcess(&'static str),
    /// Message target is this worker or outside the event and task pools.
    #[error("invalid target worker {0}")]
    InvalidWorker(u32),
    /// Core infrastructure (reactor, sockets, shared memory) could not be created.
    #[error("fatal: {context}: {source}")]
    Fatal {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error(transparent)]
    Ipc(#[from] IpcError),
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn fatal(context: &'static str, source: impl Into<io::Error>) -> Self {
        Error::Fatal {
            context,
            source: source.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error returned by user command handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must be in {min}..={max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
    #[error("send_yield requires dispatch mode fd-mod or ip-mod")]
    SendYieldDispatchMode,
    #[error("cpu_affinity_ignore covers all {0} cpus")]
    NoAvailableCpu(usize),
    #[error("task_worker_num > 0 requires a task handler")]
    MissingTaskHandler,
    #[error("unknown event name `{0}`")]
    UnknownEvent(String),
    #[error("unknown dispatch mode {0}")]
    UnknownDispatchMode(u8),
    #[error("no listener configured")]
    NoListener,
    #[error("command `{0}`: {1}")]
    Command(String, &'static str),
    #[error("{0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("invalid signal number {0}")]
    InvalidSigno(i32),
    #[error("signal backend setup failed: {0}")]
    Backend(Errno),
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed envelope: {0}")]
    Malformed(&'static str),
    #[error("payload too large for a single datagram: {0} bytes")]
    TooLarge(usize),
    #[error("spool file: {0}")]
    Spool(#[source] io::Error),
    #[error("outbound backlog full: {queued} bytes queued, {limit} allowed")]
    Backlog { queued: usize, limit: usize },
    #[error("ipc transport: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("task timed out")]
    Timeout,
    #[error("no task worker {0}")]
    InvalidTarget(u32),
    #[error("task dispatch failed")]
    DispatchFailed,
    #[error("task workers are not configured")]
    NoTaskWorker,
    #[error("tasks cannot be dispatched from {0}")]
    WrongProcess(&'static str),
    #[error("too many tasks in one join: {0}")]
    TooMany(usize),
    #[error("task waiter dropped")]
    Canceled,
    #[error("task could not be run by the task worker")]
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command `{0}`")]
    Unknown(String),
    #[error("command `{0}` is not accepted by the target process type")]
    NotAccepted(String),
    #[error("no such process {0:?}#{1}")]
    NoSuchProcess(crate::worker::ProcessType, u32),
    #[error("command timed out")]
    Timeout,
    #[error("command transport failed")]
    Transport,
    #[error("commands cannot be invoked from {0}")]
    WrongProcess(&'static str),
    #[error("command waiter dropped")]
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("session {0} does not exist")]
    NoSession(i64),
    #[error("session {0} is closing")]
    Closing(i64),
    #[error("output buffer of session {0} is full")]
    BufferFull(i64),
    #[error("connection reset while waiting to send")]
    ConnectionReset,
    #[error("send timed out")]
    Timeout,
    #[error("ipc send to the reactor thread failed")]
    Transport,
    #[error("operation not allowed in {0}")]
    WrongProcess(&'static str),
}
