use super::envelope::{Envelope, IPC_MAX_SIZE};
use crate::error::IpcError;
use nix::errno::Errno;
use nix::sys::socket::{MsgFlags, send};
use socket2::SockRef;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::time::Duration;
use tracing::debug;

/// How long a sender may block on a full peer queue.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Datagram channel into one execution unit.
///
/// Any thread may send; only the owner of the unit reads. The channel belongs
/// to a worker slot rather than to a worker incarnation, so datagrams queued
/// while a worker is being replaced are read by its successor.
#[derive(Debug)]
pub struct Pipe {
    tx: UnixDatagram,
    rx: UnixDatagram,
}

impl Pipe {
    /// Pipe whose receiving end is non-blocking, for use with a reactor.
    pub fn new() -> io::Result<Self> {
        Self::with_mode(false)
    }

    /// Pipe whose receiving end blocks with a timeout.
    pub fn blocking() -> io::Result<Self> {
        Self::with_mode(true)
    }

    fn with_mode(blocking_rx: bool) -> io::Result<Self> {
        let (tx, rx) = UnixDatagram::pair()?;
        tx.set_write_timeout(Some(SEND_TIMEOUT))?;
        rx.set_nonblocking(!blocking_rx)?;
        for sock in [&tx, &rx] {
            let sock = SockRef::from(sock);
            if let Err(e) = sock
                .set_send_buffer_size(SOCKET_BUFFER_SIZE)
                .and_then(|_| sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE))
            {
                debug!(error = %e, "could not enlarge ipc socket buffers");
            }
        }
        Ok(Self { tx, rx })
    }

    /// Send one envelope, blocking up to [`SEND_TIMEOUT`] while the peer queue is full.
    pub fn send(&self, env: &Envelope) -> Result<(), IpcError> {
        let buf = env.encode()?;
        self.tx.send(&buf)?;
        Ok(())
    }

    /// Send one envelope without blocking. `Ok(false)` means the peer queue
    /// is full and nothing was sent.
    pub fn try_send(&self, env: &Envelope) -> Result<bool, IpcError> {
        let buf = env.encode()?;
        loop {
            match send(self.tx.as_raw_fd(), &buf, MsgFlags::MSG_DONTWAIT) {
                Ok(_) => return Ok(true),
                Err(Errno::EAGAIN) => return Ok(false),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(io::Error::from(errno).into()),
            }
        }
    }

    /// Read one envelope without blocking.
    pub fn try_recv(&self) -> Result<Option<Envelope>, IpcError> {
        let mut buf = [0u8; IPC_MAX_SIZE];
        match self.rx.recv(&mut buf) {
            Ok(n) => Envelope::decode(&buf[..n]).map(Some),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Block up to `timeout` for one envelope. Only valid on [`Pipe::blocking`] pipes.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Envelope>, IpcError> {
        self.rx
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = [0u8; IPC_MAX_SIZE];
        match self.rx.recv(&mut buf) {
            Ok(n) => Envelope::decode(&buf[..n]).map(Some),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Descriptor to register with the owner's reactor.
    pub fn rx_fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }

    /// Sending descriptor; it polls writable once the peer queue has room.
    pub fn tx_fd(&self) -> RawFd {
        self.tx.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Kind;
    use bytes::Bytes;

    #[test]
    fn test_send_and_try_recv() {
        let pipe = Pipe::new().unwrap();
        assert!(pipe.try_recv().unwrap().is_none());
        let env = Envelope::new(Kind::PipeMessage, 3, Bytes::from_static(b"hi")).with_source(2);
        pipe.send(&env).unwrap();
        assert_eq!(pipe.try_recv().unwrap(), Some(env));
    }

    #[test]
    fn test_try_send_reports_full_queue() {
        let pipe = Pipe::new().unwrap();
        let env = Envelope::new(Kind::Receive, 1, vec![0u8; 4096]);
        let started = std::time::Instant::now();
        let mut sent = 0;
        while pipe.try_send(&env).unwrap() {
            sent += 1;
            assert!(sent < 1_000_000);
        }
        assert!(started.elapsed() < SEND_TIMEOUT);
        assert!(pipe.try_recv().unwrap().is_some());
        assert!(pipe.try_send(&env).unwrap());
    }

    #[test]
    fn test_blocking_recv_times_out() {
        let pipe = Pipe::blocking().unwrap();
        let started = std::time::Instant::now();
        assert!(pipe.recv_timeout(Duration::from_millis(20)).unwrap().is_none());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_senders_from_other_threads() {
        let pipe = std::sync::Arc::new(Pipe::blocking().unwrap());
        let sender = pipe.clone();
        std::thread::spawn(move || {
            sender.send(&Envelope::control(Kind::Stop, 9)).unwrap();
        })
        .join()
        .unwrap();
        let got = pipe.recv_timeout(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(got.kind(), Kind::Stop);
        assert_eq!(got.header.fd, 9);
    }
}
