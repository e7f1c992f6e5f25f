//! A single client connection endpoint and its two state machines.
//!
//! `SocketSlot` owns one OS socket (UDP, TCP, or TCP-over-TLS) plus the
//! bookkeeping the sender and receiver loops need to drive it without
//! blocking: an outbound staging buffer for a write that returned
//! `WouldBlock`, a read accumulator for TCP framing, and handshake
//! timestamps for `cumulative_tcp_hs`/`cumulative_tls_hs` accounting.

use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;

use mio::net::{TcpStream, UdpSocket};
use rustls::{ClientConfig, ClientConnection};
use rustls_pki_types::ServerName;

use crate::config::Transport;

/// Maximum size of an EDNS0 UDP packet we are willing to stage for retry.
pub const MAX_EDNS_PACKET: usize = 4096;

/// Send-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    Closed,
    TcpHandshake,
    TlsHandshake,
    Ready,
    /// A prior write returned `WouldBlock`; `staged` must be flushed before
    /// any new write on this socket.
    Sending,
    /// `num_sent == max_tcp_q`; the socket will close and reopen once
    /// `num_in_flight` drops to zero.
    TcpSentMax,
}

/// Receive-side state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    Closed,
    Handshake,
    Ready,
    Reading,
}

enum Io {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls {
        stream: TcpStream,
        conn: Box<ClientConnection>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SocketIoError {
    #[error("operation would block")]
    WouldBlock,
    #[error("fatal socket error: {0}")]
    Fatal(#[from] io::Error),
    #[error("fatal TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

pub struct SocketSlot {
    pub shard_id: usize,
    pub index: u16,
    port_offset: u16,
    /// Bumped every time the socket is closed and reopened; paired with
    /// `QuerySlot::sock_generation` to reject responses meant for a
    /// predecessor connection (see `DESIGN.md`).
    generation: u32,

    transport: Transport,
    server: SocketAddr,
    local_addr: SocketAddr,
    tls_config: Option<Arc<ClientConfig>>,
    server_name: Option<ServerName<'static>>,
    max_tcp_q: Option<u64>,

    io: Option<Io>,
    pub send_state: SendState,
    pub recv_state: RecvState,

    staged: Vec<u8>,
    /// 0 = expect a 2-byte length prefix next; > 0 = bytes of payload still
    /// needed to complete the current frame.
    tcp_to_read: usize,
    read_accum: Vec<u8>,

    pub num_sent: u64,
    pub num_recv: u64,
    pub num_in_flight: u64,

    pub con_start: u64,
    pub tcp_hs_done: u64,
    pub tls_hs_done: u64,
    pub cumulative_tcp_hs: u64,
    pub cumulative_tls_hs: u64,
}

pub enum HandshakeProgress {
    Pending,
    Done,
}

impl SocketSlot {
    pub fn new(
        shard_id: usize,
        index: u16,
        port_offset: u16,
        transport: Transport,
        server: SocketAddr,
        local_addr: SocketAddr,
        tls_config: Option<Arc<ClientConfig>>,
        server_name: Option<ServerName<'static>>,
        max_tcp_q: Option<u64>,
    ) -> Self {
        Self {
            shard_id,
            index,
            port_offset,
            generation: 0,
            transport,
            server,
            local_addr,
            tls_config,
            server_name,
            max_tcp_q,
            io: None,
            send_state: SendState::Closed,
            recv_state: RecvState::Closed,
            staged: Vec::new(),
            tcp_to_read: 0,
            read_accum: Vec::new(),
            num_sent: 0,
            num_recv: 0,
            num_in_flight: 0,
            con_start: 0,
            tcp_hs_done: 0,
            tls_hs_done: 0,
            cumulative_tcp_hs: 0,
            cumulative_tls_hs: 0,
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn is_tcp_like(&self) -> bool {
        !matches!(self.transport, Transport::Udp)
    }

    /// Opens the underlying socket, always from an OS-assigned ephemeral
    /// source port: binding to `port_offset` as a literal port number
    /// would need root on most systems for the low end of the range and
    /// collide across shards at the high end, so `port_offset` (part of
    /// this slot's `{shard_id, index, port_offset}` identity per the data
    /// model) is kept only for logging/test identity, not as a bind
    /// target. `reopen` and `now` are accepted to match the source
    /// contract's `open(reopen: bool)`; `reopen` has no effect beyond
    /// that identity distinction since every open is already ephemeral.
    pub fn open(&mut self, now: u64, reopen: bool) -> anyhow::Result<()> {
        use anyhow::Context as _;

        let _ = reopen;
        let bind_addr = SocketAddr::new(self.local_addr.ip(), 0);

        match self.transport {
            Transport::Udp => {
                let socket = bind_udp(bind_addr).context("Failed to bind UDP socket")?;
                socket.connect(self.server).context("Failed to connect UDP socket")?;
                self.io = Some(Io::Udp(socket));
                self.send_state = SendState::Ready;
                self.recv_state = RecvState::Ready;
            }
            Transport::Tcp => {
                let stream = connect_tcp(bind_addr, self.server).context("Failed to open TCP socket")?;
                self.io = Some(Io::Tcp(stream));
                self.send_state = SendState::TcpHandshake;
                self.recv_state = RecvState::Handshake;
            }
            Transport::Tls => {
                let stream = connect_tcp(bind_addr, self.server).context("Failed to open TCP socket")?;
                let config = self
                    .tls_config
                    .clone()
                    .context("TLS transport selected without a TLS client configuration")?;
                let name = self
                    .server_name
                    .clone()
                    .context("TLS transport selected without a server name")?;
                let conn = ClientConnection::new(config, name).context("Failed to start TLS session")?;
                self.io = Some(Io::Tls {
                    stream,
                    conn: Box::new(conn),
                });
                self.send_state = SendState::TcpHandshake;
                self.recv_state = RecvState::Handshake;
            }
        }

        self.con_start = now;
        self.tcp_to_read = 0;
        self.read_accum.clear();
        self.staged.clear();
        self.num_in_flight = 0;

        Ok(())
    }

    /// Registers this socket's fd with a `mio` poll registry under `token`.
    pub fn register(&mut self, registry: &mio::Registry, token: mio::Token) -> io::Result<()> {
        match self.io.as_mut() {
            Some(Io::Udp(s)) => registry.register(s, token, mio::Interest::READABLE),
            Some(Io::Tcp(s)) => {
                registry.register(s, token, mio::Interest::READABLE | mio::Interest::WRITABLE)
            }
            Some(Io::Tls { stream, .. }) => registry.register(
                stream,
                token,
                mio::Interest::READABLE | mio::Interest::WRITABLE,
            ),
            None => Ok(()),
        }
    }

    pub fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        match self.io.as_mut() {
            Some(Io::Udp(s)) => registry.deregister(s),
            Some(Io::Tcp(s)) => registry.deregister(s),
            Some(Io::Tls { stream, .. }) => registry.deregister(stream),
            None => Ok(()),
        }
    }

    /// Drives the TCP connect and, for TLS transports, the TLS handshake
    /// one step further. Returns `Pending` until both are complete.
    pub fn advance_handshake(&mut self, now: u64) -> Result<HandshakeProgress, SocketIoError> {
        match self.send_state {
            SendState::TcpHandshake => {
                let stream = match self.io.as_ref() {
                    Some(Io::Tcp(s)) => s,
                    Some(Io::Tls { stream, .. }) => stream,
                    _ => unreachable!("TcpHandshake state implies a TCP-based connection"),
                };

                // A non-blocking `connect` has completed once the fd reports
                // no pending SO_ERROR and is actually connected; until then
                // `peer_addr()` fails with `NotConnected`.
                if !tcp_connect_complete(stream)? {
                    return Ok(HandshakeProgress::Pending);
                }

                self.tcp_hs_done = now;
                self.send_state = match self.transport {
                    Transport::Tls => SendState::TlsHandshake,
                    Transport::Udp | Transport::Tcp => SendState::Ready,
                };
                self.recv_state = match self.transport {
                    Transport::Tls => RecvState::Handshake,
                    Transport::Udp | Transport::Tcp => RecvState::Ready,
                };
                Ok(HandshakeProgress::Pending)
            }
            SendState::TlsHandshake => {
                let Some(Io::Tls { stream, conn }) = self.io.as_mut() else {
                    unreachable!("TlsHandshake state implies a TLS connection")
                };

                drive_tls_handshake(stream, conn)?;

                if conn.is_handshaking() {
                    return Ok(HandshakeProgress::Pending);
                }

                self.tls_hs_done = now;
                self.send_state = SendState::Ready;
                self.recv_state = RecvState::Ready;
                Ok(HandshakeProgress::Done)
            }
            SendState::Ready | SendState::Sending | SendState::TcpSentMax | SendState::Closed => {
                Ok(HandshakeProgress::Done)
            }
        }
    }

    /// Writes `bytes` (already length-prefixed by the caller for TCP/TLS).
    pub fn send(&mut self, bytes: &[u8]) -> Result<(), SocketIoError> {
        debug_assert_ne!(self.send_state, SendState::Closed);

        match self.write_raw(bytes) {
            Ok(()) => Ok(()),
            Err(SocketIoError::WouldBlock) => {
                self.staged.clear();
                self.staged.extend_from_slice(bytes);
                self.send_state = SendState::Sending;
                Err(SocketIoError::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    /// Retries a previously staged write. Only valid in `SendState::Sending`.
    pub fn retry_staged(&mut self) -> Result<(), SocketIoError> {
        debug_assert_eq!(self.send_state, SendState::Sending);
        let staged = std::mem::take(&mut self.staged);

        match self.write_raw(&staged) {
            Ok(()) => {
                self.send_state = SendState::Ready;
                Ok(())
            }
            Err(SocketIoError::WouldBlock) => {
                self.staged = staged;
                Err(SocketIoError::WouldBlock)
            }
            Err(e) => Err(e),
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), SocketIoError> {
        match self.io.as_mut().expect("socket must be open to send") {
            Io::Udp(s) => match s.send(bytes) {
                Ok(_) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(SocketIoError::WouldBlock),
                Err(e) => Err(SocketIoError::Fatal(e)),
            },
            Io::Tcp(s) => write_all_nonblocking(s, bytes),
            Io::Tls { stream, conn } => {
                conn.writer()
                    .write_all(bytes)
                    .map_err(SocketIoError::Fatal)?;
                flush_tls(stream, conn)
            }
        }
    }

    /// Reads the next complete DNS message. `None` means "not ready yet";
    /// callers must retry on the next readiness notification.
    pub fn recv_frame(&mut self, scratch: &mut Vec<u8>) -> Result<Option<Vec<u8>>, SocketIoError> {
        match self.transport {
            Transport::Udp => {
                scratch.resize(65535, 0);
                let Some(Io::Udp(s)) = self.io.as_mut() else {
                    unreachable!()
                };
                match s.recv(scratch) {
                    Ok(n) => Ok(Some(scratch[..n].to_vec())),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
                    Err(e) => Err(SocketIoError::Fatal(e)),
                }
            }
            Transport::Tcp | Transport::Tls => self.recv_tcp_framed(),
        }
    }

    /// Two-phase TCP/TLS framing: a 2-byte big-endian length prefix
    /// followed by exactly that many payload bytes. Rather than probing
    /// the OS for a pending-byte count (unavailable portably from `mio`),
    /// this drains whatever is currently readable into `read_accum` and
    /// only yields a frame once it holds the full message — a streaming
    /// variant of the same two-phase machine (see `DESIGN.md`).
    fn recv_tcp_framed(&mut self) -> Result<Option<Vec<u8>>, SocketIoError> {
        let mut buf = [0u8; 4096];

        loop {
            let read = match self.io.as_mut().expect("socket must be open to recv") {
                Io::Tcp(s) => match s.read(&mut buf) {
                    Ok(0) => return Err(SocketIoError::Fatal(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed TCP connection",
                    ))),
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                    Err(e) => return Err(SocketIoError::Fatal(e)),
                },
                Io::Tls { stream, conn } => match read_tls_plaintext(stream, conn, &mut buf)? {
                    Some(n) => n,
                    None => 0,
                },
                Io::Udp(_) => unreachable!("UDP does not use framed recv"),
            };

            if read == 0 {
                break;
            }
            self.read_accum.extend_from_slice(&buf[..read]);
        }

        if self.tcp_to_read == 0 {
            if self.read_accum.len() < 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([self.read_accum[0], self.read_accum[1]]) as usize;
            self.tcp_to_read = len;
            self.read_accum.drain(0..2);
            self.recv_state = RecvState::Reading;
        }

        if self.read_accum.len() < self.tcp_to_read {
            return Ok(None);
        }

        let frame: Vec<u8> = self.read_accum.drain(0..self.tcp_to_read).collect();
        self.tcp_to_read = 0;
        self.recv_state = RecvState::Ready;

        Ok(Some(frame))
    }

    pub fn mark_tcp_sent_max(&mut self) {
        self.send_state = SendState::TcpSentMax;
    }

    pub fn should_rotate(&self) -> bool {
        self.send_state == SendState::TcpSentMax && self.num_in_flight == 0
    }

    pub fn close(&mut self, now: u64) {
        if let Some(Io::Tls { mut stream, mut conn }) = self.io.take() {
            conn.send_close_notify();
            let _ = flush_tls(&mut stream, &mut conn);
        }
        self.io = None;

        if self.tcp_hs_done > 0 {
            self.cumulative_tcp_hs += self.tcp_hs_done.saturating_sub(self.con_start);
        }
        if self.tls_hs_done > 0 {
            self.cumulative_tls_hs += self.tls_hs_done.saturating_sub(self.tcp_hs_done);
        }

        let _ = now;
        self.send_state = SendState::Closed;
        self.recv_state = RecvState::Closed;
        self.tcp_to_read = 0;
        self.read_accum.clear();
        self.staged.clear();
        self.tcp_hs_done = 0;
        self.tls_hs_done = 0;
        self.generation += 1;
    }
}

fn bind_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let domain = socket2::Domain::for_address(addr);
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(UdpSocket::from_std(socket.into()))
}

fn connect_tcp(bind_addr: SocketAddr, server: SocketAddr) -> io::Result<TcpStream> {
    let domain = socket2::Domain::for_address(bind_addr);
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&bind_addr.into())?;

    match socket.connect(&server.into()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc_einprogress()) => {}
        Err(e) => return Err(e),
    }

    Ok(TcpStream::from_std(socket.into()))
}

#[cfg(unix)]
fn libc_einprogress() -> i32 {
    libc::EINPROGRESS
}

#[cfg(not(unix))]
fn libc_einprogress() -> i32 {
    i32::MIN
}

/// Checks whether a non-blocking `connect` has finished: `take_error`
/// surfaces any pending `SO_ERROR` (a refused/failed connect), and
/// `peer_addr` fails with `NotConnected` while the handshake is still in
/// flight.
fn tcp_connect_complete(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }

    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}

fn write_all_nonblocking(stream: &mut TcpStream, bytes: &[u8]) -> Result<(), SocketIoError> {
    match stream.write(bytes) {
        Ok(n) if n == bytes.len() => Ok(()),
        Ok(_) => Err(SocketIoError::WouldBlock), // partial write; caller stages the whole buffer
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(SocketIoError::WouldBlock),
        Err(e) => Err(SocketIoError::Fatal(e)),
    }
}

fn drive_tls_handshake(
    stream: &mut TcpStream,
    conn: &mut ClientConnection,
) -> Result<(), SocketIoError> {
    flush_tls(stream, conn)?;

    if conn.wants_read() {
        match conn.read_tls(stream) {
            Ok(0) => {
                return Err(SocketIoError::Fatal(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection during TLS handshake",
                )));
            }
            Ok(_) => {
                conn.process_new_packets()?;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(SocketIoError::Fatal(e)),
        }
    }

    flush_tls(stream, conn)
}

fn flush_tls(stream: &mut TcpStream, conn: &mut ClientConnection) -> Result<(), SocketIoError> {
    while conn.wants_write() {
        match conn.write_tls(stream) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(SocketIoError::WouldBlock),
            Err(e) => return Err(SocketIoError::Fatal(e)),
        }
    }
    Ok(())
}

fn read_tls_plaintext(
    stream: &mut TcpStream,
    conn: &mut ClientConnection,
    buf: &mut [u8],
) -> Result<Option<usize>, SocketIoError> {
    match conn.read_tls(stream) {
        Ok(0) => {
            return Err(SocketIoError::Fatal(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed TLS connection",
            )));
        }
        Ok(_) => {
            conn.process_new_packets()?;
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(SocketIoError::Fatal(e)),
    }

    match conn.reader().read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(SocketIoError::Fatal(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cumulative_handshake_time_is_zero_without_tls() {
        let mut slot = SocketSlot::new(
            0,
            0,
            0,
            Transport::Udp,
            "127.0.0.1:53".parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
            None,
            None,
            None,
        );
        slot.tcp_hs_done = 0;
        slot.tls_hs_done = 0;
        slot.close(1_000);

        assert_eq!(slot.cumulative_tls_hs, 0);
        assert_eq!(slot.cumulative_tcp_hs, 0);
    }
}
