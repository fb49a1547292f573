//! Routing of requests to event workers and messages between workers.

use serial_test::serial;
use spindle::Server;
use spindle::dispatch::{DispatchDecision, DispatchMode};
use spindle_test::echo_server::{EchoStats, echo_server, test_config};
use spindle_test::util::{RunningServer, connect, init_tracing, request, wait_closed, wait_until};
use std::time::Duration;

#[test]
#[serial]
fn test_round_robin_spreads_requests() {
    init_tracing();
    let config = test_config()
        .worker_num(4)
        .task_worker_num(0)
        .dispatch_mode(DispatchMode::RoundRobin);
    let (server, stats) = echo_server(config);
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    let seen: Vec<String> = (0..8).map(|_| request(&mut client, "worker")).collect();
    assert_eq!(seen, ["0", "1", "2", "3", "0", "1", "2", "3"]);

    // Connections move between workers, so no connect/close events.
    drop(client);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(EchoStats::get(&stats.connects), 0);
    assert_eq!(EchoStats::get(&stats.closes), 0);
}

#[test]
#[serial]
fn test_fd_mod_pins_connection() {
    init_tracing();
    let (server, _) = echo_server(test_config().worker_num(4).task_worker_num(0));
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    let first = request(&mut client, "worker");
    for _ in 0..5 {
        assert_eq!(request(&mut client, "worker"), first);
    }
}

#[test]
#[serial]
fn test_dispatch_func() {
    init_tracing();
    let config = test_config().worker_num(3).task_worker_num(0);
    let (server, _) = echo_server(config);
    let server = server.set_dispatch_func(|ctx, worker_num| match ctx.data {
        Some(b"reject") => DispatchDecision::Close,
        Some(_) => DispatchDecision::Worker(worker_num - 1),
        None => DispatchDecision::Fallback,
    });
    let server = RunningServer::start(server);

    let mut client = connect(server.tcp_addr());
    assert_eq!(request(&mut client, "worker"), "2");
    assert_eq!(request(&mut client, "worker"), "2");

    let mut rejected = connect(server.tcp_addr());
    use std::io::Write;
    rejected.write_all(b"reject").unwrap();
    assert!(wait_closed(&mut rejected));
}

#[test]
#[serial]
fn test_user_worker_messages() {
    init_tracing();
    let (server, stats) = echo_server(test_config().task_worker_num(0));
    let server = server.add_user_worker(|ctx| {
        for dst in 0..2 {
            if let Err(e) = ctx.send_message(dst, "hello from a user worker") {
                println!("send_message failed: {e}");
            }
        }
        // Keep the worker alive until shutdown.
        ctx.reactor().add_timer(Duration::from_secs(3600), |_| {});
    });
    let server = RunningServer::start(server);

    assert!(wait_until(Duration::from_secs(5), || EchoStats::get(&stats.pipe_messages) == 2));
    let snapshot = server.handle().stats().unwrap();
    assert_eq!(snapshot.user_worker_num, 1);
}
