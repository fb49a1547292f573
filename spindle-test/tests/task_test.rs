//! Task offload from event workers: coroutine waits, joins, callbacks and
//! fire-and-forget dispatch.

use serial_test::serial;
use spindle::Server;
use spindle_test::echo_server::{EchoStats, echo_server, test_config};
use spindle_test::util::{RunningServer, connect, init_tracing, request, wait_until};
use std::time::{Duration, Instant};

#[test]
#[serial]
fn test_task_coroutine() {
    init_tracing();
    let (server, stats) = echo_server(test_config());
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    assert_eq!(request(&mut client, "task:hello"), "done:HELLO");
    assert_eq!(request(&mut client, "task:sleep:50:slow"), "done:SLOW");
    assert_eq!(EchoStats::get(&stats.tasks), 2);

    let snapshot = server.handle().stats().unwrap();
    assert_eq!(snapshot.task_count, 2);
    assert_eq!(snapshot.tasking_num, 0);
    assert_eq!(snapshot.task_idle_worker_num, 2);
}

#[test]
#[serial]
fn test_task_join_marks_missing_results() {
    init_tracing();
    let (server, _) = echo_server(test_config());
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    assert_eq!(request(&mut client, "tasks:a,b,c"), "done:A,B,C");

    // The middle task never produces a result, so the join waits out its timeout.
    let started = Instant::now();
    assert_eq!(request(&mut client, "tasks:x,drop:y,z"), "done:X,!,Z");
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[test]
#[serial]
fn test_task_timeout() {
    init_tracing();
    let (server, _) = echo_server(test_config());
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    let reply = request(&mut client, "task:drop:nothing");
    println!("reply: {reply}");
    assert!(reply.starts_with("error:"));

    // The event worker stays responsive after a timed-out wait.
    assert_eq!(request(&mut client, "task:again"), "done:AGAIN");
}

#[test]
#[serial]
fn test_task_callback_and_noreply() {
    init_tracing();
    let (server, stats) = echo_server(test_config());
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    assert_eq!(request(&mut client, "callback:cb"), "done:CB");
    assert_eq!(request(&mut client, "noreply:quiet"), "queued");
    assert!(wait_until(Duration::from_secs(5), || EchoStats::get(&stats.tasks) == 2));
    assert!(wait_until(Duration::from_secs(5), || {
        server.handle().stats().map(|s| s.tasking_num == 0).unwrap_or(false)
    }));
}

#[test]
#[serial]
fn test_task_without_task_workers() {
    init_tracing();
    let (server, _) = echo_server(test_config().task_worker_num(0));
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    let reply = request(&mut client, "task:hello");
    println!("reply: {reply}");
    assert!(reply.starts_with("error:"));
}

#[test]
fn test_task_workers_need_a_handler() {
    let mut server = Server::new(test_config());
    assert!(server.start().is_err());
}

#[test]
#[serial]
fn test_large_task_payload() {
    init_tracing();
    let spool = tempfile::tempdir().unwrap();
    let (server, _) = echo_server(test_config().task_tmpdir(spool.path()));
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    // Larger than one envelope, so the payload and the result are spooled.
    assert_eq!(request(&mut client, "big:200000"), "done:200000");
    assert_eq!(std::fs::read_dir(spool.path()).unwrap().count(), 0);
}
