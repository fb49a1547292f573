//! Echo/task demo application
//!
//! A tiny text protocol over spindle, one request per write:
//!
//! | Request | Reply |
//! |---------|-------|
//! | `task:<text>` | `done:<TEXT>`, uppercased by a task worker from a coroutine |
//! | `tasks:<a>,<b>,..` | `done:<A>,<B>,..` joined from a coroutine, `!` for a missing result |
//! | `big:<n>` | `done:<n>` once a task of `n` bytes came back uppercased |
//! | `callback:<text>` | `done:<TEXT>` through a task callback |
//! | `noreply:<text>` | `queued`, the task result is never sent back |
//! | `cmd:<name>:<process_type>:<id>` | the command response |
//! | `bind:<uid>` | `bound` or `taken` |
//! | `worker` | id of the event worker that read the request |
//! | `block:<ms>` | `blocked` after stalling the event worker thread |
//! | `pause:<ms>` | `paused`; reading resumes after `ms` |
//! | `yield:<k>:<n>` | `k` coroutines each `send_yield` `n` bytes of one letter |
//! | `panic` | the event worker panics |
//! | `stats` | the statistics snapshot as JSON |
//! | `close` | the server closes the connection |
//! | anything else | echoed back |
//!
//! Task payloads `drop:<text>` produce no result and `sleep:<ms>:<text>`
//! stalls the task worker first.

use bytes::Bytes;
use spindle::command::ProcessTypes;
use spindle::connection::SessionId;
use spindle::error::SendError;
use spindle::server::ListenerConfig;
use spindle::worker::ProcessType;
use spindle::{Context, Event, Server, ServerConfig, ServerEvent};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout of task waits and command invocations made by the demo.
pub const TASK_TIMEOUT: Duration = Duration::from_secs(1);

/// Event counts observed by the demo callbacks.
#[derive(Debug, Default)]
pub struct EchoStats {
    pub connects: AtomicU64,
    pub closes: AtomicU64,
    pub tasks: AtomicU64,
    pub pipe_messages: AtomicU64,
    pub worker_starts: AtomicU64,
    pub worker_errors: AtomicU64,
    pub after_reload: AtomicU64,
    /// Yielded sends that went through.
    pub yield_sent: AtomicU64,
    /// Yielded sends failed because their connection closed while waiting.
    pub yield_resets: AtomicU64,
}

impl EchoStats {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Acquire)
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::AcqRel);
    }
}

/// Configuration used by the tests: loopback TCP on an ephemeral port, two
/// event workers, two task workers, no process signals.
pub fn test_config() -> ServerConfig {
    ServerConfig::new()
        .listen(ListenerConfig::tcp("127.0.0.1:0".parse().unwrap()))
        .worker_num(2)
        .task_worker_num(2)
        .max_wait_time(1.0)
        .enable_signals(false)
}

/// Build the demo server.
pub fn echo_server(config: ServerConfig) -> (Server, Arc<EchoStats>) {
    let stats = Arc::new(EchoStats::default());
    let s = stats.clone();
    let y = stats.clone();
    let server = Server::new(config)
        .on_receive(move |ctx, session_id, data| on_receive(ctx, session_id, data, &y))
        .on_task(move |_, task| {
            EchoStats::incr(&s.tasks);
            run_task(&task.data)
        })
        .on_event(ServerEvent::Packet, |ctx, event| {
            if let Event::Packet { listener, peer, data } = event
                && let Err(e) = ctx.send_to(listener, peer, data)
            {
                warn!(%peer, error = %e, "datagram echo failed");
            }
        });
    let server = count_events(server, &stats);
    let server = server
        .add_command("ping", ProcessTypes::WORKERS | ProcessTypes::MANAGER, |ctx, payload| {
            Ok(format!("pong:{}:{}", ctx.worker_id(), payload))
        })
        .and_then(|server| server.add_command("fail", ProcessTypes::WORKERS, |_, _| Err("refused".into())))
        .expect("demo commands register once");
    (server, stats)
}

fn count_events(server: Server, stats: &Arc<EchoStats>) -> Server {
    let events: [(ServerEvent, fn(&EchoStats) -> &AtomicU64); 6] = [
        (ServerEvent::Connect, |s| &s.connects),
        (ServerEvent::Close, |s| &s.closes),
        (ServerEvent::WorkerStart, |s| &s.worker_starts),
        (ServerEvent::WorkerError, |s| &s.worker_errors),
        (ServerEvent::AfterReload, |s| &s.after_reload),
        (ServerEvent::PipeMessage, |s| &s.pipe_messages),
    ];
    events.into_iter().fold(server, |server, (kind, counter)| {
        let stats = stats.clone();
        server.on_event(kind, move |_, _| EchoStats::incr(counter(&stats)))
    })
}

fn run_task(data: &Bytes) -> Option<Bytes> {
    let text = String::from_utf8_lossy(data);
    if text.starts_with("drop:") {
        return None;
    }
    let text = match text.strip_prefix("sleep:") {
        Some(rest) => {
            let (ms, text) = rest.split_once(':').unwrap_or((rest, ""));
            std::thread::sleep(Duration::from_millis(ms.parse().unwrap_or(0)));
            text.to_string()
        }
        None => text.into_owned(),
    };
    Some(Bytes::from(text.to_uppercase()))
}

fn spawn<F>(ctx: &Context, fut: F)
where
    F: Future<Output = ()> + 'static,
{
    if let Err(e) = ctx.go(fut) {
        warn!(error = %e, "coroutine not started");
    }
}

fn reply(ctx: &Context, session_id: SessionId, data: impl Into<Bytes>) {
    if let Err(e) = ctx.send(session_id, data) {
        debug!(session_id, error = %e, "reply dropped");
    }
}

fn on_receive(ctx: &Context, session_id: SessionId, data: &Bytes, stats: &Arc<EchoStats>) {
    let text = String::from_utf8_lossy(data).into_owned();
    let (verb, arg) = text.split_once(':').unwrap_or((text.as_str(), ""));
    let arg = arg.to_string();
    match verb {
        "task" => {
            let c = ctx.clone();
            spawn(ctx, async move {
                let out = match c.task_co(arg, None, TASK_TIMEOUT).await {
                    Ok(result) => format!("done:{}", String::from_utf8_lossy(&result)),
                    Err(e) => format!("error:{e}"),
                };
                reply(&c, session_id, out);
            });
        }
        "tasks" => {
            let payloads = arg
                .split(',')
                .map(|p| Bytes::copy_from_slice(p.as_bytes()))
                .collect();
            let c = ctx.clone();
            spawn(ctx, async move {
                let out = match c.task_wait_co(payloads, TASK_TIMEOUT).await {
                    Ok(results) => {
                        let parts: Vec<String> = results
                            .iter()
                            .map(|r| match r {
                                Ok(b) => String::from_utf8_lossy(b).into_owned(),
                                Err(_) => "!".to_string(),
                            })
                            .collect();
                        format!("done:{}", parts.join(","))
                    }
                    Err(e) => format!("error:{e}"),
                };
                reply(&c, session_id, out);
            });
        }
        "big" => {
            let len: usize = arg.parse().unwrap_or(0);
            let c = ctx.clone();
            spawn(ctx, async move {
                let out = match c.task_co(vec![b'x'; len], None, TASK_TIMEOUT).await {
                    Ok(result) if result.len() == len && result.iter().all(|b| *b == b'X') => {
                        format!("done:{len}")
                    }
                    Ok(result) => format!("error:unexpected result of {} bytes", result.len()),
                    Err(e) => format!("error:{e}"),
                };
                reply(&c, session_id, out);
            });
        }
        "callback" => {
            let dispatched = ctx.task_with_callback(arg, None, move |ctx, _, result| {
                let out = match result {
                    Ok(b) => format!("done:{}", String::from_utf8_lossy(&b)),
                    Err(e) => format!("error:{e}"),
                };
                reply(ctx, session_id, out);
            });
            if let Err(e) = dispatched {
                reply(ctx, session_id, format!("error:{e}"));
            }
        }
        "noreply" => match ctx.task_noreply(arg, None) {
            Ok(_) => reply(ctx, session_id, "queued"),
            Err(e) => reply(ctx, session_id, format!("error:{e}")),
        },
        "cmd" => {
            let mut parts = arg.splitn(3, ':');
            let name = parts.next().unwrap_or_default().to_string();
            let kind = parts.next().unwrap_or_default();
            let id = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
            let Ok(kind) = serde_json::from_value::<ProcessType>(serde_json::Value::from(kind)) else {
                reply(ctx, session_id, "error:bad process type");
                return;
            };
            let c = ctx.clone();
            spawn(ctx, async move {
                let out = match c.command(&name, id, kind, "hi", TASK_TIMEOUT).await {
                    Ok(response) => response,
                    Err(e) => format!("error:{e}"),
                };
                reply(&c, session_id, out);
            });
        }
        "bind" => {
            let bound = arg.parse().is_ok_and(|uid| ctx.bind(session_id, uid));
            reply(ctx, session_id, if bound { "bound" } else { "taken" });
        }
        "worker" => reply(ctx, session_id, ctx.worker_id().to_string()),
        "block" => {
            std::thread::sleep(Duration::from_millis(arg.parse().unwrap_or(0)));
            reply(ctx, session_id, "blocked");
        }
        "pause" => {
            if let Err(e) = ctx.pause(session_id) {
                reply(ctx, session_id, format!("error:{e}"));
                return;
            }
            let c = ctx.clone();
            ctx.reactor()
                .add_timer(Duration::from_millis(arg.parse().unwrap_or(0)), move |_| {
                    if let Err(e) = c.resume(session_id) {
                        debug!(session_id, error = %e, "resume failed");
                    }
                });
            reply(ctx, session_id, "paused");
        }
        "yield" => {
            let (k, n) = arg.split_once(':').unwrap_or((arg.as_str(), "0"));
            let (k, n): (u8, usize) = (k.parse().unwrap_or(0), n.parse().unwrap_or(0));
            for j in 0..k.min(26) {
                let c = ctx.clone();
                let stats = stats.clone();
                let chunk = Bytes::from(vec![b'a' + j; n]);
                spawn(ctx, async move {
                    match c.send_yield(session_id, chunk).await {
                        Ok(()) => EchoStats::incr(&stats.yield_sent),
                        Err(SendError::ConnectionReset) => EchoStats::incr(&stats.yield_resets),
                        Err(e) => debug!(session_id, error = %e, "yielded send failed"),
                    }
                });
            }
        }
        "panic" => panic!("panic requested by session {session_id}"),
        "stats" => match serde_json::to_string(&ctx.stats()) {
            Ok(json) => reply(ctx, session_id, json),
            Err(e) => reply(ctx, session_id, format!("error:{e}")),
        },
        "close" => {
            if let Err(e) = ctx.close(session_id, false) {
                debug!(session_id, error = %e, "close request failed");
            }
        }
        _ => reply(ctx, session_id, data.clone()),
    }
}
