//! Echo round trips over TCP and UDP, connection events and server-side close.

use serial_test::serial;
use spindle::connection::SessionId;
use spindle::server::ListenerConfig;
use spindle::{Event, Server, ServerEvent};
use spindle_test::echo_server::{EchoStats, echo_server, test_config};
use spindle_test::util::{RunningServer, connect, echo, init_tracing, request, udp_request, wait_closed, wait_until};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
#[serial]
fn test_tcp_echo() {
    init_tracing();
    let (server, stats) = echo_server(test_config());
    let server = RunningServer::start(server);
    let addr = server.tcp_addr();
    println!("echo server on {addr}");

    let mut client = connect(addr);
    for msg in ["hello", "spindle", "one more line"] {
        assert_eq!(echo(&mut client, msg.as_bytes()), msg.as_bytes());
    }

    // 200KB in one write comes back intact even when split across reads.
    let big: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
    assert_eq!(echo(&mut client, &big), big);
    drop(client);

    assert!(wait_until(Duration::from_secs(5), || {
        EchoStats::get(&stats.closes) == 1
    }));
    assert_eq!(EchoStats::get(&stats.connects), 1);

    let snapshot = server.handle().stats().unwrap();
    println!("stats: {snapshot:?}");
    assert_eq!(snapshot.accept_count, 1);
    assert_eq!(snapshot.close_count, 1);
    assert_eq!(snapshot.connection_num, 0);
    assert!(snapshot.total_recv_bytes >= big.len() as u64);
    assert!(snapshot.request_count >= 4);
    assert_eq!(snapshot.worker_num, 2);
    assert_eq!(snapshot.task_worker_num, 2);

    server.stop().unwrap();
}

#[test]
#[serial]
fn test_many_clients() {
    init_tracing();
    let (server, stats) = echo_server(test_config().worker_num(4));
    let server = RunningServer::start(server);
    let addr = server.tcp_addr();

    let clients: Vec<_> = (0..8)
        .map(|i| {
            std::thread::spawn(move || {
                let mut client = connect(addr);
                for round in 0..20 {
                    let msg = format!("client {i} round {round}");
                    assert_eq!(echo(&mut client, msg.as_bytes()), msg.as_bytes());
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        EchoStats::get(&stats.closes) == 8
    }));
    assert_eq!(EchoStats::get(&stats.connects), 8);
    let snapshot = server.handle().stats().unwrap();
    assert!(snapshot.request_count >= 160);
    assert_eq!(snapshot.response_count, snapshot.request_count);
}

#[test]
#[serial]
fn test_udp_echo() {
    init_tracing();
    let config = test_config().listen(ListenerConfig::udp("127.0.0.1:0".parse().unwrap()));
    let (server, _) = echo_server(config);
    let server = RunningServer::start(server);
    let udp = server.addr(1);
    println!("udp listener on {udp}");

    assert_eq!(udp_request(udp, b"datagram"), b"datagram");
    assert_eq!(udp_request(udp, b"another one"), b"another one");

    let snapshot = server.handle().stats().unwrap();
    assert_eq!(snapshot.accept_count, 0);
    assert!(snapshot.total_send_bytes >= 19);
}

#[test]
#[serial]
fn test_server_close_and_bind() {
    init_tracing();
    let (server, stats) = echo_server(test_config());
    let server = RunningServer::start(server);
    let addr = server.tcp_addr();

    let mut first = connect(addr);
    let mut second = connect(addr);
    assert_eq!(request(&mut first, "bind:42"), "bound");
    assert_eq!(request(&mut first, "bind:43"), "taken");
    assert_eq!(request(&mut second, "bind:42"), "bound");

    first.write_all(b"close").unwrap();
    assert!(wait_closed(&mut first));
    assert!(wait_until(Duration::from_secs(5), || {
        EchoStats::get(&stats.closes) == 1
    }));
    assert_eq!(request(&mut second, "still here"), "still here");
}

#[test]
#[serial]
fn test_heartbeat_evicts_idle_connections() {
    init_tracing();
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let r = reasons.clone();
    let config = test_config().task_worker_num(0).heartbeat(0.2, 0.5);
    let server = Server::new(config)
        .on_receive(|ctx, session_id: SessionId, data| {
            let _ = ctx.send(session_id, data.clone());
        })
        .on_event(ServerEvent::Close, move |_, event| {
            if let Event::Close { reason, .. } = event {
                r.lock().unwrap().push(reason);
            }
        });
    let server = RunningServer::start(server);

    let mut idle = connect(server.tcp_addr());
    assert_eq!(echo(&mut idle, b"ping"), b"ping");
    assert!(wait_closed(&mut idle));
    assert!(wait_until(Duration::from_secs(5), || !reasons.lock().unwrap().is_empty()));
    let reasons = reasons.lock().unwrap();
    println!("close reasons: {reasons:?}");
    assert_eq!(reasons.len(), 1);
    assert_eq!(reasons[0], spindle::connection::CloseReason::Heartbeat);
}
