//! Commands invoked from an event worker against every kind of execution unit.

use serial_test::serial;
use spindle::stats::StatsSnapshot;
use spindle_test::echo_server::{echo_server, test_config};
use spindle_test::util::{RunningServer, connect, init_tracing, request};

#[test]
#[serial]
fn test_commands() {
    init_tracing();
    let (server, _) = echo_server(test_config());
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    // Builtin, answered by the reactor thread.
    let reply = request(&mut client, "cmd:server_stats:reactor_thread:0");
    let stats: StatsSnapshot = serde_json::from_str(&reply).unwrap();
    assert_eq!(stats.worker_num, 2);
    assert_eq!(stats.task_worker_num, 2);
    assert_eq!(stats.connection_num, 1);
    assert_eq!(stats.worker_id, None);

    // Task worker 1 is worker id 3 behind two event workers.
    assert_eq!(request(&mut client, "cmd:ping:task_worker:1"), "pong:3:hi");
    assert_eq!(request(&mut client, "cmd:ping:manager:0"), "pong:0:hi");
    for id in 0..2 {
        assert_eq!(
            request(&mut client, &format!("cmd:ping:event_worker:{id}")),
            format!("pong:{id}:hi")
        );
    }

    let reply = request(&mut client, "cmd:fail:task_worker:0");
    let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(value["code"], -1);
}

#[test]
#[serial]
fn test_command_errors() {
    init_tracing();
    let (server, _) = echo_server(test_config());
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    for req in [
        "cmd:missing:event_worker:0",
        "cmd:ping:reactor_thread:0",
        "cmd:ping:event_worker:9",
        "cmd:ping:nowhere:0",
    ] {
        let reply = request(&mut client, req);
        println!("{req} -> {reply}");
        assert!(reply.starts_with("error:"), "{req} -> {reply}");
    }
}
