use spindle::server::ListenAddr;
use spindle::{Server, ServerHandle};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub const START_TIMEOUT: Duration = Duration::from_secs(5);
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a test-friendly subscriber once per process. `RUST_LOG` overrides
/// the default `info` level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_ansi(false)
        .with_test_writer()
        .try_init();
}

/// A server started on a background thread.
pub struct RunningServer {
    handle: ServerHandle,
    thread: Option<JoinHandle<spindle::Result<()>>>,
}

impl RunningServer {
    pub fn start(mut server: Server) -> Self {
        let handle = server.handle();
        let thread = std::thread::Builder::new()
            .name("spindle-test-server".to_string())
            .spawn(move || server.start())
            .unwrap();
        assert!(handle.wait_started(START_TIMEOUT), "server did not start in time");
        Self {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    /// Bound address of listener `index`.
    pub fn addr(&self, index: usize) -> SocketAddr {
        match self.handle.local_addrs().get(index) {
            Some(ListenAddr::Inet(addr)) => *addr,
            other => panic!("listener {index} is not an inet socket: {other:?}"),
        }
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.addr(0)
    }

    /// Shut the server down and return what `Server::start` returned.
    pub fn stop(mut self) -> spindle::Result<()> {
        self.shutdown_and_join().unwrap_or(Ok(()))
    }

    fn shutdown_and_join(&mut self) -> Option<spindle::Result<()>> {
        let thread = self.thread.take()?;
        let _ = self.handle.shutdown();
        Some(thread.join().expect("server thread panicked"))
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.shutdown_and_join() {
            println!("server stopped with an error: {e}");
        }
    }
}

pub fn connect(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

/// Write one request and read one reply.
pub fn request(stream: &mut TcpStream, req: &str) -> String {
    stream.write_all(req.as_bytes()).unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    let n = stream.read(&mut buf).unwrap();
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

/// Write `data` and read until as many bytes came back.
pub fn echo(stream: &mut TcpStream, data: &[u8]) -> Vec<u8> {
    stream.write_all(data).unwrap();
    let mut out = vec![0u8; data.len()];
    stream.read_exact(&mut out).unwrap();
    out
}

/// True once the peer closed the connection.
pub fn wait_closed(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 256];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => return true,
            Err(_) => return false,
        }
    }
}

pub fn udp_request(addr: SocketAddr, data: &[u8]) -> Vec<u8> {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(IO_TIMEOUT)).unwrap();
    socket.send_to(data, addr).unwrap();
    let mut buf = vec![0u8; 64 * 1024];
    let (n, from) = socket.recv_from(&mut buf).unwrap();
    assert_eq!(from, addr);
    buf.truncate(n);
    buf
}

/// Poll `cond` every 10ms until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}
