//! Reactor, worker pool and task offload runtime for network servers.
//!
//! spindle accepts connections on one reactor thread, routes every connection
//! and datagram to a pool of event worker threads under a selectable
//! [`DispatchMode`](dispatch::DispatchMode), and offloads blocking work to a
//! separate pool of task workers reachable only through IPC envelopes. A
//! supervisor on the calling thread spawns, recycles and respawns workers and
//! drives zero-downtime reloads.
//!
//! Each execution unit runs its own single-threaded [`Reactor`](reactor::Reactor).
//! Worker reactors are driven as local tasks of a current-thread tokio
//! runtime, so callbacks can start coroutines with [`Context::go`] and
//! suspend on tasks, commands or full output buffers.
//!
//! # Quick start
//!
//! ```no_run
//! use spindle::{Server, ServerConfig};
//!
//! let config = ServerConfig::new()
//!     .listen_tcp("127.0.0.1:9501".parse().unwrap())
//!     .worker_num(4)
//!     .task_worker_num(2);
//! let mut server = Server::new(config)
//!     .on_receive(|ctx, session_id, data| {
//!         let _ = ctx.task(data.clone(), None);
//!         let _ = ctx.send(session_id, data.clone());
//!     })
//!     .on_task(|_, task| Some(task.data.clone()));
//! server.start().unwrap();
//! ```

pub mod command;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod reactor;
pub mod server;
pub mod signal;
pub mod stats;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
pub use server::{Context, Event, Server, ServerConfig, ServerEvent, ServerHandle};
