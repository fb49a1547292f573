//! Offloading work to task workers.
//!
//! A task is an opaque payload sent to a task worker through its slot pipe.
//! The result travels back on one of the origin incarnation's
//! [`ReplyPipes`](crate::worker::ReplyPipes):
//!
//! - synchronous waits read the blocking `sync` pipe directly
//! - callbacks and parked coroutines are resolved by the origin's reactor
//!   when the result lands on its `reply` pipe, through the [`TaskTracker`]
//! - fire-and-forget tasks (`NOREPLY`) send nothing back
//!
//! Payloads larger than one datagram are spooled to a temp file in both
//! directions.

mod channel;
mod id;
mod tracker;

pub use channel::{FinishedTask, IncomingTask, TaskChannel, TaskOrigin};
pub use id::{TaskId, TaskIdGen};
pub use tracker::{CoKey, Completion, TaskCallback, TaskResult, TaskTracker};

/// Largest number of tasks joined by one multi-wait.
pub const TASK_JOIN_MAX: usize = 1024;
