//! Listening sockets and accepted streams.

use crate::connection::{PeerAddr, SocketType};
use crate::error::IpcError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::{UnixDatagram, UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Inet(addr) => write!(f, "{addr}"),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub addr: ListenAddr,
    pub socket_type: SocketType,
}

impl ListenerConfig {
    pub fn tcp(addr: SocketAddr) -> Self {
        let socket_type = if addr.is_ipv6() { SocketType::Tcp6 } else { SocketType::Tcp };
        Self {
            addr: ListenAddr::Inet(addr),
            socket_type,
        }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        let socket_type = if addr.is_ipv6() { SocketType::Udp6 } else { SocketType::Udp };
        Self {
            addr: ListenAddr::Inet(addr),
            socket_type,
        }
    }

    pub fn unix_stream(path: impl Into<PathBuf>) -> Self {
        Self {
            addr: ListenAddr::Unix(path.into()),
            socket_type: SocketType::UnixStream,
        }
    }

    pub fn unix_dgram(path: impl Into<PathBuf>) -> Self {
        Self {
            addr: ListenAddr::Unix(path.into()),
            socket_type: SocketType::UnixDgram,
        }
    }
}

pub(crate) enum ListenSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
    UnixStream(UnixListener),
    UnixDgram(UnixDatagram),
}

/// A bound, non-blocking listening socket.
pub(crate) struct BoundListener {
    pub index: u16,
    pub socket_type: SocketType,
    pub local: ListenAddr,
    socket: ListenSocket,
}

fn inet_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    Ok(socket)
}

fn unix_socket(path: &Path, ty: Type) -> io::Result<Socket> {
    if path.exists() {
        debug!(path = %path.display(), "removing stale unix socket");
        std::fs::remove_file(path)?;
    }
    let socket = Socket::new(Domain::UNIX, ty, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    Ok(socket)
}

pub(crate) fn bind(index: u16, config: &ListenerConfig, backlog: i32) -> io::Result<BoundListener> {
    let socket = match (&config.addr, config.socket_type) {
        (ListenAddr::Inet(addr), SocketType::Tcp | SocketType::Tcp6) => {
            let socket = inet_socket(*addr, Type::STREAM, Protocol::TCP)?;
            socket.listen(backlog)?;
            socket.set_nonblocking(true)?;
            ListenSocket::Tcp(socket.into())
        }
        (ListenAddr::Inet(addr), SocketType::Udp | SocketType::Udp6) => {
            let socket = inet_socket(*addr, Type::DGRAM, Protocol::UDP)?;
            socket.set_nonblocking(true)?;
            ListenSocket::Udp(socket.into())
        }
        (ListenAddr::Unix(path), SocketType::UnixStream) => {
            let socket = unix_socket(path, Type::STREAM)?;
            socket.listen(backlog)?;
            socket.set_nonblocking(true)?;
            ListenSocket::UnixStream(socket.into())
        }
        (ListenAddr::Unix(path), SocketType::UnixDgram) => {
            let socket = unix_socket(path, Type::DGRAM)?;
            socket.set_nonblocking(true)?;
            ListenSocket::UnixDgram(socket.into())
        }
        _ => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address family does not match socket type",
            ));
        }
    };
    let local = match &socket {
        ListenSocket::Tcp(l) => ListenAddr::Inet(l.local_addr()?),
        ListenSocket::Udp(s) => ListenAddr::Inet(s.local_addr()?),
        ListenSocket::UnixStream(_) | ListenSocket::UnixDgram(_) => config.addr.clone(),
    };
    debug!(index, %local, socket_type = ?config.socket_type, "listener bound");
    Ok(BoundListener {
        index,
        socket_type: config.socket_type,
        local,
        socket,
    })
}

fn would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

impl BoundListener {
    pub fn raw_fd(&self) -> RawFd {
        match &self.socket {
            ListenSocket::Tcp(l) => l.as_raw_fd(),
            ListenSocket::Udp(s) => s.as_raw_fd(),
            ListenSocket::UnixStream(l) => l.as_raw_fd(),
            ListenSocket::UnixDgram(s) => s.as_raw_fd(),
        }
    }

    pub fn is_stream(&self) -> bool {
        self.socket_type.is_stream()
    }

    /// Accept one pending connection, `None` when there is none.
    pub fn accept(&self) -> io::Result<Option<(Stream, PeerAddr)>> {
        let accepted = match &self.socket {
            ListenSocket::Tcp(l) => l
                .accept()
                .map(|(s, addr)| (Stream::Tcp(s), PeerAddr::Inet(addr))),
            ListenSocket::UnixStream(l) => l.accept().map(|(s, addr)| {
                let path = addr.as_pathname().map(|p| p.to_path_buf());
                (Stream::Unix(s), PeerAddr::Unix(path))
            }),
            _ => return Err(io::Error::from(io::ErrorKind::Unsupported)),
        };
        match accepted {
            Ok((stream, peer)) => {
                stream.set_nonblocking()?;
                Ok(Some((stream, peer)))
            }
            Err(e) if would_block(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Read one datagram, `None` when there is none.
    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, PeerAddr)>> {
        let received = match &self.socket {
            ListenSocket::Udp(s) => s.recv_from(buf).map(|(n, addr)| (n, PeerAddr::Inet(addr))),
            ListenSocket::UnixDgram(s) => s.recv_from(buf).map(|(n, addr)| {
                (n, PeerAddr::Unix(addr.as_pathname().map(|p| p.to_path_buf())))
            }),
            _ => return Err(io::Error::from(io::ErrorKind::Unsupported)),
        };
        match received {
            Ok(r) => Ok(Some(r)),
            Err(e) if would_block(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn send_to(&self, data: &[u8], peer: &PeerAddr) -> io::Result<usize> {
        match (&self.socket, peer) {
            (ListenSocket::Udp(s), PeerAddr::Inet(addr)) => s.send_to(data, addr),
            (ListenSocket::UnixDgram(s), PeerAddr::Unix(Some(path))) => s.send_to(data, path),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "peer address does not match the listener",
            )),
        }
    }
}

impl Drop for BoundListener {
    fn drop(&mut self) {
        if let ListenAddr::Unix(path) = &self.local
            && let Err(e) = std::fs::remove_file(path)
        {
            warn!(path = %path.display(), error = %e, "failed to remove unix socket");
        }
    }
}

/// An accepted stream connection.
pub(crate) enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    pub fn raw_fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => {
                s.set_nodelay(true)?;
                s.set_nonblocking(true)
            }
            Stream::Unix(s) => s.set_nonblocking(true),
        }
    }

    /// Make the next close send a reset instead of a graceful shutdown.
    pub fn set_reset_on_close(&self) {
        let result = match self {
            Stream::Tcp(s) => SockRef::from(s).set_linger(Some(Duration::ZERO)),
            Stream::Unix(s) => SockRef::from(s).set_linger(Some(Duration::ZERO)),
        };
        if let Err(e) = result {
            debug!(error = %e, "could not set SO_LINGER");
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

const PEER_INET: u8 = 0;
const PEER_UNIX: u8 = 1;
const PEER_UNNAMED: u8 = 2;

/// Prefix a datagram with its peer address: `[tag: u8][len: u16 LE][addr][data]`.
pub(crate) fn encode_packet(peer: &PeerAddr, data: &[u8]) -> Bytes {
    let (tag, addr): (u8, Vec<u8>) = match peer {
        PeerAddr::Inet(addr) => (PEER_INET, addr.to_string().into_bytes()),
        PeerAddr::Unix(Some(path)) => (PEER_UNIX, path.as_os_str().as_bytes().to_vec()),
        PeerAddr::Unix(None) => (PEER_UNNAMED, Vec::new()),
    };
    let mut buf = BytesMut::with_capacity(3 + addr.len() + data.len());
    buf.put_u8(tag);
    buf.put_u16_le(addr.len() as u16);
    buf.put_slice(&addr);
    buf.put_slice(data);
    buf.freeze()
}

pub(crate) fn decode_packet(mut payload: Bytes) -> Result<(PeerAddr, Bytes), IpcError> {
    if payload.len() < 3 {
        return Err(IpcError::Malformed("short packet header"));
    }
    let tag = payload.get_u8();
    let len = payload.get_u16_le() as usize;
    if payload.len() < len {
        return Err(IpcError::Malformed("truncated packet address"));
    }
    let addr = payload.split_to(len);
    let peer = match tag {
        PEER_INET => {
            let text = std::str::from_utf8(&addr).map_err(|_| IpcError::Malformed("packet address"))?;
            PeerAddr::Inet(text.parse().map_err(|_| IpcError::Malformed("packet address"))?)
        }
        PEER_UNIX => PeerAddr::Unix(Some(PathBuf::from(std::ffi::OsStr::from_bytes(&addr)))),
        PEER_UNNAMED => PeerAddr::Unix(None),
        _ => return Err(IpcError::Malformed("packet address tag")),
    };
    Ok((peer, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_accept_nonblocking() {
        let listener = bind(0, &ListenerConfig::tcp("127.0.0.1:0".parse().unwrap()), 16).unwrap();
        let ListenAddr::Inet(addr) = listener.local.clone() else {
            panic!("tcp listener without inet address");
        };
        assert!(listener.accept().unwrap().is_none());
        let _client = TcpStream::connect(addr).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            if let Some(a) = listener.accept().unwrap() {
                accepted = Some(a);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let (_, peer) = accepted.unwrap();
        assert!(matches!(peer, PeerAddr::Inet(a) if a.ip().is_loopback()));
    }

    #[test]
    fn test_udp_recv_and_reply() {
        let listener = bind(1, &ListenerConfig::udp("127.0.0.1:0".parse().unwrap()), 16).unwrap();
        let ListenAddr::Inet(addr) = listener.local.clone() else {
            panic!("udp listener without inet address");
        };
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client.send_to(b"hello", addr).unwrap();
        let mut buf = [0u8; 64];
        let mut got = None;
        for _ in 0..100 {
            if let Some(r) = listener.recv_from(&mut buf).unwrap() {
                got = Some(r);
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        let (n, peer) = got.unwrap();
        assert_eq!(&buf[..n], b"hello");
        listener.send_to(b"back", &peer).unwrap();
        let (n, _) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"back");
    }

    #[test]
    fn test_unix_socket_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.sock");
        let listener = bind(0, &ListenerConfig::unix_stream(&path), 16).unwrap();
        assert!(path.exists());
        let _client = UnixStream::connect(&path).unwrap();
        drop(listener);
        assert!(!path.exists());
    }

    #[test]
    fn test_mismatched_family_rejected() {
        let config = ListenerConfig {
            addr: ListenAddr::Unix("/tmp/x".into()),
            socket_type: SocketType::Tcp,
        };
        assert!(bind(0, &config, 16).is_err());
    }

    #[test]
    fn test_packet_framing() {
        let peer = PeerAddr::Inet("10.1.2.3:53".parse().unwrap());
        let (back, data) = decode_packet(encode_packet(&peer, b"query")).unwrap();
        assert_eq!(back, peer);
        assert_eq!(&data[..], b"query");

        let unnamed = PeerAddr::Unix(None);
        assert_eq!(decode_packet(encode_packet(&unnamed, b"")).unwrap().0, unnamed);
        assert!(decode_packet(Bytes::from_static(&[9, 0, 0])).is_err());
    }
}
