//! End-to-end scenarios against loopback UDP/TCP echo servers.
//!
//! These exercise the full sender/receiver/orchestrator pipeline rather
//! than any one module in isolation. Each scenario builds a `Config`
//! directly (bypassing `Cli` parsing, which is covered in `config.rs`)
//! and keeps `time_limit`/`timeout` short so the suite stays fast.

#![allow(clippy::unwrap_used)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dnsdrill::config::{Config, Transport};
use dnsdrill::orchestrator::Orchestrator;

fn base_config(server: SocketAddr, transport: Transport) -> Config {
    Config {
        server,
        server_host: server.ip().to_string(),
        local_addr: "127.0.0.1".parse().unwrap(),
        datafile: write_datafile("www.example.com A\nwww.example.org AAAA\nmail.example.net MX\n"),
        is_update: false,
        threads: 1,
        clients: 2,
        max_qps: 0,
        max_outstanding: 50,
        timeout: Duration::from_millis(300),
        time_limit: Some(Duration::from_millis(500)),
        max_runs: 0,
        transport,
        max_tcp_queries: None,
        edns: false,
        dnssec: false,
        tsig: None,
        report_interval: None,
        verbose: 0,
    }
}

fn write_datafile(contents: &str) -> std::path::PathBuf {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file.into_temp_path().keep().unwrap()
}

/// Echoes every UDP datagram back to its sender unmodified. A query's
/// header already carries `RCODE=0` in the bytes the receiver inspects,
/// so an unmodified echo reads as a `NOERROR` response.
fn spawn_udp_echo() -> (SocketAddr, Arc<AtomicBool>) {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_millis(50))).unwrap();
    let addr = socket.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();

    thread::spawn(move || {
        let mut buf = [0u8; 65535];
        while !stop_thread.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let _ = socket.send_to(&buf[..n], from);
                }
                Err(_) => continue,
            }
        }
    });

    (addr, stop)
}

struct EchoConn {
    stream: std::net::TcpStream,
    buf: Vec<u8>,
}

impl EchoConn {
    /// Drains whatever is readable, echoes back every complete
    /// length-prefixed frame, and reports whether the peer is still open.
    fn poll(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => return false,
            }
        }

        while self.buf.len() >= 2 {
            let len = u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize;
            if self.buf.len() < 2 + len {
                break;
            }
            let frame: Vec<u8> = self.buf.drain(0..2 + len).collect();
            if self.stream.write_all(&frame).is_err() {
                return false;
            }
        }

        true
    }
}

fn spawn_tcp_echo() -> (SocketAddr, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_thread = stop.clone();

    thread::spawn(move || {
        let mut conns: Vec<EchoConn> = Vec::new();
        while !stop_thread.load(Ordering::Relaxed) {
            if let Ok((stream, _)) = listener.accept() {
                stream.set_nonblocking(true).unwrap();
                let _ = stream.set_nodelay(true);
                conns.push(EchoConn { stream, buf: Vec::new() });
            }
            conns.retain_mut(EchoConn::poll);
            thread::sleep(Duration::from_millis(5));
        }
    });

    (addr, stop)
}

#[test]
fn udp_queries_complete_against_an_echo_server() {
    let (server, stop) = spawn_udp_echo();
    let config = base_config(server, Transport::Udp);

    let report = Orchestrator::new(config).run().unwrap();
    stop.store(true, Ordering::Relaxed);

    assert!(report.stats.num_completed > 0);
    assert_eq!(report.stats.num_completed, report.stats.rcode_counts[0]);
    assert!(report.stats.accounting_closure_holds());
}

#[test]
fn queries_time_out_when_nothing_answers() {
    // Bind and immediately drop a UDP socket: its port is very unlikely
    // to be reused for the life of the test, so every query to it times
    // out rather than getting an ICMP-port-unreachable-driven error.
    let placeholder = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dead_addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let mut config = base_config(dead_addr, Transport::Udp);
    config.timeout = Duration::from_millis(80);
    config.time_limit = Some(Duration::from_millis(400));

    let report = Orchestrator::new(config).run().unwrap();

    assert_eq!(report.stats.num_completed, 0);
    assert!(report.stats.num_timedout > 0);
    assert!(report.stats.accounting_closure_holds());
}

#[test]
fn max_qps_bounds_total_queries_sent() {
    let (server, stop) = spawn_udp_echo();
    let mut config = base_config(server, Transport::Udp);
    config.max_qps = 20;
    config.time_limit = Some(Duration::from_millis(500));
    config.max_outstanding = 1000;

    let report = Orchestrator::new(config).run().unwrap();
    stop.store(true, Ordering::Relaxed);

    // 20 qps over 0.5s plus slack for scheduling jitter.
    assert!(
        report.stats.num_sent <= 40,
        "expected max_qps to bound num_sent, got {}",
        report.stats.num_sent
    );
}

#[test]
fn max_outstanding_caps_concurrency_before_anything_times_out() {
    // Same dead-socket trick as the timeout scenario, but with a timeout
    // longer than the run so nothing has expired by the time it ends:
    // num_sent should then be bounded by max_outstanding, not by input size.
    let placeholder = UdpSocket::bind("127.0.0.1:0").unwrap();
    let dead_addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let mut config = base_config(dead_addr, Transport::Udp);
    config.max_outstanding = 5;
    config.timeout = Duration::from_secs(10);
    config.time_limit = Some(Duration::from_millis(200));
    config.datafile = write_repeated_datafile("probe.example.com A\n", 500);

    let report = Orchestrator::new(config).run().unwrap();

    assert!(
        report.stats.num_sent <= 5,
        "expected max_outstanding to cap num_sent, got {}",
        report.stats.num_sent
    );
}

#[test]
fn tcp_connection_rotates_after_max_tcp_queries() {
    let (server, stop) = spawn_tcp_echo();
    let mut config = base_config(server, Transport::Tcp);
    config.clients = 1;
    config.max_tcp_queries = Some(2);
    config.time_limit = Some(Duration::from_millis(800));
    config.datafile = write_repeated_datafile("probe.example.com A\n", 200);

    let report = Orchestrator::new(config).run().unwrap();
    stop.store(true, Ordering::Relaxed);

    assert!(report.stats.num_completed >= 4);
    assert!(
        report.stats.num_tcp_conns >= 2,
        "expected at least one rotation beyond the initial connect, got {}",
        report.stats.num_tcp_conns
    );
}

fn write_repeated_datafile(line: &str, n: usize) -> std::path::PathBuf {
    write_datafile(&line.repeat(n))
}

/// Drives `receiver::run` directly with a pre-set interrupt flag, the way
/// a shard would observe mid-run `SIGINT`: outstanding queries should be
/// cancelled and accounted for without ever touching a real socket.
#[test]
fn interrupt_flag_cancels_outstanding_queries() {
    use dnsdrill::clock::Clock;
    use dnsdrill::receiver;
    use dnsdrill::shard::{RunParams, ThreadShard};
    use dnsdrill::socket_slot::SocketSlot;

    let socket = SocketSlot::new(
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
    let shard = Arc::new(ThreadShard::new(0, vec![socket]));

    {
        let mut state = shard.state.lock();
        for _ in 0..5 {
            let id = state.slots.reserve().unwrap();
            state.slots.commit(id, 0, 0, 0);
        }
        state.done_sending = true;
    }

    let params = Arc::new(RunParams {
        shard_id: 0,
        transport: Transport::Udp,
        timeout_us: 1_000_000_000,
        max_qps: 0,
        max_outstanding: 100,
        max_tcp_queries: None,
        edns: false,
        dnssec: false,
        tsig: None,
        is_update: false,
        start_time: 0,
        stop_time: u64::MAX,
    });

    let clock = Clock::start();
    let interrupt = Arc::new(AtomicBool::new(true));
    let poll = mio::Poll::new().unwrap();

    receiver::run(shard.clone(), params, clock, interrupt, poll);

    let state = shard.state.lock();
    assert_eq!(state.stats.num_interrupted, 5);
    assert_eq!(state.slots.num_outstanding(), 0);
}
