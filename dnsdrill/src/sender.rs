//! The sender loop: reads input, builds wire messages, and drives pacing,
//! rate limiting, and concurrency limiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::Clock;
use crate::codec::{self, create_ctx};
use crate::config::Transport;
use crate::datafile::{DataFile, NextRecord};
use crate::selector::select_tcp_socket;
use crate::shard::{RunParams, ThreadShard};
use crate::socket_slot::SocketIoError;

/// Runs until end-of-input, the process `stop_time` is reached, `interrupt`
/// is set, or the input stops yielding records. Intended to be the body of
/// a dedicated OS thread, one per shard (see [`crate::orchestrator`]).
///
/// Returns the number of passes the input file made (`DataFile::nruns`),
/// which the orchestrator folds into the final report so it can say
/// whether the run ended on `--time-limit`, `--max-runs`, or end-of-input.
pub fn run(
    shard: Arc<ThreadShard>,
    mut datafile: DataFile,
    params: Arc<RunParams>,
    clock: Clock,
    interrupt: Arc<AtomicBool>,
) -> u32 {
    let ctx = create_ctx(params.is_update);
    let mut line = String::new();
    let mut wire = Vec::new();
    let mut framed = Vec::new();

    loop {
        let now = clock.now();
        if now >= params.stop_time || interrupt.load(Ordering::Relaxed) {
            break;
        }

        if anti_burst_pacing(&shard, &params) {
            thread::sleep(Duration::from_millis(1));
            continue;
        }

        if let Some(sleep_for) = rate_limit_delay(&shard, &params, now) {
            thread::sleep(sleep_for);
            continue;
        }

        if wait_for_concurrency_slot(&shard, &params, &clock, now, &interrupt) {
            continue;
        }

        let Some(sock_idx) = select_socket(&shard, &params, &clock) else {
            continue;
        };

        match datafile.next(&mut line, params.is_update) {
            Ok(NextRecord::Ok) => {}
            Ok(NextRecord::Eof) => break,
            Ok(NextRecord::InvalidFile) => {
                warn!(shard = shard.id, "skipping an unreadable input line");
                continue;
            }
            Err(e) => {
                warn!(shard = shard.id, error = %e, "failed to read input, ending run");
                break;
            }
        }

        let id = {
            let mut state = shard.state.lock();
            match state.slots.reserve() {
                Ok(id) => id,
                // Unreachable in practice: max_outstanding is capped at
                // 65536 per shard (see Config::from_cli), so the
                // concurrency gate above always trips first.
                Err(_) => continue,
            }
        };

        wire.clear();
        if let Err(e) = codec::build_request(
            ctx,
            &line,
            id,
            params.edns,
            params.dnssec,
            params.tsig.as_ref(),
            &mut wire,
        ) {
            debug!(shard = shard.id, error = %e, "malformed input line, dropping slot");
            let mut state = shard.state.lock();
            state.slots.release(id);
            state.stats.record_dropped_malformed();
            continue;
        }

        let bytes: &[u8] = if params.transport == Transport::Udp {
            &wire
        } else {
            framed.clear();
            framed.extend_from_slice(&(wire.len() as u16).to_be_bytes());
            framed.extend_from_slice(&wire);
            &framed
        };

        send_and_account(&shard, &params, &clock, sock_idx, id, bytes);
    }

    let mut state = shard.state.lock();
    state.done_sending = true;
    state.done_send_time = clock.now();
    drop(state);
    shard.cond.notify_all();

    datafile.nruns()
}

/// Avoids a cold-start burst overrunning kernel send buffers before any
/// response has given the sender feedback.
fn anti_burst_pacing(shard: &ThreadShard, params: &RunParams) -> bool {
    let state = shard.state.lock();
    state.stats.num_sent < params.max_outstanding
        && state.stats.num_sent % 2 == 1
        && state.stats.num_completed == 0
}

/// Returns how long to sleep before re-checking, or `None` if the ideal
/// send time has already arrived.
fn rate_limit_delay(shard: &ThreadShard, params: &RunParams, now: u64) -> Option<Duration> {
    if params.max_qps == 0 {
        return None;
    }

    let num_sent = shard.state.lock().stats.num_sent;
    let ideal_us = num_sent.saturating_mul(1_000_000) / params.max_qps;
    let elapsed = now.saturating_sub(params.start_time);

    (ideal_us > elapsed).then(|| Duration::from_micros(ideal_us - elapsed))
}

/// Returns `true` if the sender had to wait (caller should restart its
/// loop), `false` if there's room to send immediately.
fn wait_for_concurrency_slot(
    shard: &ThreadShard,
    params: &RunParams,
    clock: &Clock,
    now: u64,
    interrupt: &AtomicBool,
) -> bool {
    let mut state = shard.state.lock();
    if (state.slots.num_outstanding() as u64) < params.max_outstanding {
        return false;
    }
    // Checked before waiting so a `SIGINT` that raced ahead of this lock
    // doesn't park the sender until `stop_time` (unbounded by default).
    if interrupt.load(Ordering::Relaxed) {
        return true;
    }

    let deadline = clock.deadline_after_us(params.stop_time.saturating_sub(now));
    shard.cond.wait_until(&mut state, deadline);
    true
}

/// Round-robins over UDP sockets directly, or defers to
/// [`select_tcp_socket`] for TCP/TLS (handshakes, staged retries, skips).
fn select_socket(shard: &ThreadShard, params: &RunParams, clock: &Clock) -> Option<usize> {
    let mut state = shard.state.lock();

    match params.transport {
        Transport::Udp => {
            if state.sockets.is_empty() {
                return None;
            }
            let idx = state.current_sock % state.sockets.len();
            state.current_sock = (idx + 1) % state.sockets.len();
            Some(idx)
        }
        Transport::Tcp | Transport::Tls => {
            let mut cursor = state.current_sock;
            let now = clock.now();
            let found = select_tcp_socket(&mut state.sockets, &mut cursor, now);
            state.current_sock = cursor;
            found
        }
    }
}

/// Commits the slot, writes the frame, and updates statistics. A fatal
/// write error releases the slot instead of leaving it outstanding — see
/// `ShardStats::send_failed` for why that's counted separately from a
/// normal completion/timeout/interruption.
fn send_and_account(
    shard: &ThreadShard,
    params: &RunParams,
    clock: &Clock,
    sock_idx: usize,
    id: u16,
    bytes: &[u8],
) {
    let send_time = clock.now();
    let mut state = shard.state.lock();

    let generation = state.sockets[sock_idx].generation();
    state.slots.commit(id, send_time, sock_idx as u16, generation);

    match state.sockets[sock_idx].send(bytes) {
        Ok(()) | Err(SocketIoError::WouldBlock) => {
            state.stats.record_sent(bytes.len());
            state.sockets[sock_idx].num_sent += 1;
            state.sockets[sock_idx].num_in_flight += 1;
            state.last_activity = send_time;

            if let Some(max_q) = params.max_tcp_queries {
                if state.sockets[sock_idx].num_sent >= max_q {
                    state.sockets[sock_idx].mark_tcp_sent_max();
                }
            }
        }
        Err(e) => {
            warn!(shard = shard.id, socket = sock_idx, error = %e, "send failed fatally");
            state.slots.release(id);
            state.stats.record_send_failed();
        }
    }
}
