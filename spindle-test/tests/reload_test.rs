//! Worker recycling: graceful reload and max_request replacement.

use serial_test::serial;
use spindle_test::echo_server::{EchoStats, echo_server, test_config};
use spindle_test::util::{RunningServer, connect, echo, init_tracing, request, wait_until};
use std::io::Write;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

#[test]
#[serial]
fn test_reload_all_workers() {
    init_tracing();
    let (server, stats) = echo_server(test_config());
    let server = RunningServer::start(server);
    assert!(wait_until(WAIT, || EchoStats::get(&stats.worker_starts) == 4));

    let mut client = connect(server.tcp_addr());
    assert_eq!(request(&mut client, "task:before"), "done:BEFORE");

    server.handle().reload(false).unwrap();
    assert!(wait_until(WAIT, || EchoStats::get(&stats.after_reload) == 1));
    assert!(wait_until(WAIT, || EchoStats::get(&stats.worker_starts) == 8));

    let snapshot = server.handle().stats().unwrap();
    println!("after reload: {snapshot:?}");
    assert_eq!(snapshot.reload_count, 1);
    assert_eq!(snapshot.worker_respawn_count, 0);
    assert_eq!(EchoStats::get(&stats.worker_errors), 0);

    // The connection outlives the workers that served it.
    assert_eq!(request(&mut client, "task:after"), "done:AFTER");
    assert_eq!(echo(&mut client, b"still open"), b"still open");
}

#[test]
#[serial]
fn test_reload_task_workers_only() {
    init_tracing();
    let (server, stats) = echo_server(test_config());
    let server = RunningServer::start(server);
    assert!(wait_until(WAIT, || EchoStats::get(&stats.worker_starts) == 4));

    server.handle().reload(true).unwrap();
    assert!(wait_until(WAIT, || EchoStats::get(&stats.after_reload) == 1));
    assert!(wait_until(WAIT, || EchoStats::get(&stats.worker_starts) == 6));

    let mut client = connect(server.tcp_addr());
    assert_eq!(request(&mut client, "task:fresh"), "done:FRESH");
}

#[test]
#[serial]
fn test_max_request_recycles_without_losing_requests() {
    init_tracing();
    let config = test_config()
        .worker_num(1)
        .task_worker_num(0)
        .max_request(3)
        .max_request_grace(0);
    let (server, stats) = echo_server(config);
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    for i in 0..12 {
        let msg = format!("request {i}");
        assert_eq!(echo(&mut client, msg.as_bytes()), msg.as_bytes());
    }
    // One start for the first incarnation, one per three requests after that.
    assert!(wait_until(WAIT, || EchoStats::get(&stats.worker_starts) >= 4));

    let snapshot = server.handle().stats().unwrap();
    assert_eq!(snapshot.worker_respawn_count, 0);
    assert_eq!(snapshot.request_count, 12);
}

#[test]
#[serial]
fn test_shutdown_returns_cleanly() {
    init_tracing();
    let (server, _) = echo_server(test_config());
    let server = RunningServer::start(server);
    let handle = server.handle().clone();
    let mut client = connect(server.tcp_addr());
    assert_eq!(request(&mut client, "task:bye"), "done:BYE");

    server.stop().unwrap();
    assert!(handle.wait_stopped(WAIT));
    assert!(!handle.is_running());
    assert!(handle.reload(false).is_err());
}

#[test]
#[serial]
fn test_panicking_worker_is_respawned() {
    init_tracing();
    let config = test_config().worker_num(1).task_worker_num(0);
    let (server, stats) = echo_server(config);
    let server = RunningServer::start(server);
    assert!(wait_until(WAIT, || EchoStats::get(&stats.worker_starts) == 1));

    let mut client = connect(server.tcp_addr());
    assert_eq!(echo(&mut client, b"before"), b"before");
    client.write_all(b"panic").unwrap();

    assert!(wait_until(WAIT, || EchoStats::get(&stats.worker_errors) >= 1));
    assert!(wait_until(WAIT, || EchoStats::get(&stats.worker_starts) == 2));
    assert!(server.handle().stats().unwrap().worker_respawn_count >= 1);

    // The connection is held by the reactor thread and survives the worker.
    assert_eq!(echo(&mut client, b"after"), b"after");
}

#[test]
#[serial]
fn test_task_max_request_recycles_task_worker() {
    init_tracing();
    let config = test_config()
        .worker_num(1)
        .task_worker_num(1)
        .task_max_request(100)
        .task_max_request_grace(50);
    let (server, stats) = echo_server(config);
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    for batch in 0..8 {
        let payloads: Vec<String> = (0..50).map(|i| format!("b{batch}t{i}")).collect();
        let expected: Vec<String> = payloads.iter().map(|p| p.to_uppercase()).collect();
        let reply = request(&mut client, &format!("tasks:{}", payloads.join(",")));
        assert_eq!(reply, format!("done:{}", expected.join(",")), "batch {batch}");
    }
    assert_eq!(EchoStats::get(&stats.tasks), 400);

    // The event worker plus three to five task worker incarnations.
    assert!(wait_until(WAIT, || EchoStats::get(&stats.worker_starts) >= 4));
    let starts = EchoStats::get(&stats.worker_starts);
    println!("worker starts: {starts}");
    assert!(starts <= 6);
    assert_eq!(server.handle().stats().unwrap().worker_respawn_count, 0);
}
