//! Output flow control: yielded sends and paused reads.

use serial_test::serial;
use spindle_test::echo_server::{EchoStats, echo_server, test_config};
use spindle_test::util::{RunningServer, connect, echo, init_tracing, request, wait_until};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(10);
const CHUNK: usize = 1024 * 1024;

#[test]
#[serial]
fn test_yielded_sends_arrive_in_order() {
    init_tracing();
    let (server, stats) = echo_server(test_config().task_worker_num(0).send_yield(true));
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    client.write_all(format!("yield:26:{CHUNK}").as_bytes()).unwrap();
    // Let the output buffer fill so most senders suspend.
    std::thread::sleep(Duration::from_millis(300));

    let mut chunk = vec![0u8; CHUNK];
    for j in 0..26u8 {
        client.read_exact(&mut chunk).unwrap();
        let letter = b'a' + j;
        assert!(
            chunk.iter().all(|b| *b == letter),
            "chunk {j} is not all '{}'",
            letter as char
        );
    }
    assert!(wait_until(WAIT, || EchoStats::get(&stats.yield_sent) == 26));
    assert_eq!(EchoStats::get(&stats.yield_resets), 0);
    assert_eq!(echo(&mut client, b"after"), b"after");
}

#[test]
#[serial]
fn test_suspended_senders_reset_on_close() {
    init_tracing();
    let (server, stats) = echo_server(test_config().task_worker_num(0).send_yield(true));
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    client.write_all(format!("yield:26:{CHUNK}").as_bytes()).unwrap();
    std::thread::sleep(Duration::from_millis(300));
    drop(client);

    assert!(wait_until(WAIT, || EchoStats::get(&stats.yield_resets) >= 1));
    assert!(EchoStats::get(&stats.yield_sent) < 26);
    assert!(wait_until(WAIT, || {
        server.handle().stats().unwrap().connection_num == 0
    }));
}

#[test]
#[serial]
fn test_paused_connection_resumes_reading() {
    init_tracing();
    let (server, _) = echo_server(test_config().task_worker_num(0));
    let server = RunningServer::start(server);
    let mut client = connect(server.tcp_addr());

    assert_eq!(request(&mut client, "pause:400"), "paused");
    let started = Instant::now();
    assert_eq!(echo(&mut client, b"held back"), b"held back");
    let elapsed = started.elapsed();
    println!("echo after pause took {elapsed:?}");
    assert!(elapsed >= Duration::from_millis(250));
    assert!(elapsed < WAIT);
}
