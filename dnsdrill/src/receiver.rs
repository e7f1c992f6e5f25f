//! The receiver loop: matches responses to slots, expires timeouts, and
//! drives TCP connection rotation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Token};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::os::wait_any_readable;
use crate::shard::{RunParams, ShardState, ThreadShard};
use crate::socket_slot::{RecvState, SocketIoError};

const RECV_BATCH_SIZE: usize = 16;
const TIMEOUT_CHECK_TIME: Duration = Duration::from_millis(100);

/// Runs until the sender has finished and every outstanding query has
/// been matched or timed out, or until interrupted. `poll` must already
/// have every socket in `shard`'s pool registered at `Token(index)`, plus
/// a waker at [`crate::os::WAKE_TOKEN`].
pub fn run(shard: Arc<ThreadShard>, params: Arc<RunParams>, clock: Clock, interrupt: Arc<AtomicBool>, mut poll: Poll) {
    let mut events = Events::with_capacity(64);
    let mut scratch = Vec::new();

    loop {
        let now = clock.now();

        process_timeouts(&shard, &params, now);

        if interrupt.load(Ordering::Relaxed) {
            cancel_outstanding(&shard);
            break;
        }

        if sender_done_and_drained(&shard) {
            break;
        }

        let received = receive_batch(&shard, &mut poll, &mut scratch, clock.now());
        if received > 0 {
            shard.cond.notify_all();
        }

        if received < RECV_BATCH_SIZE {
            if let Err(e) = wait_any_readable(&mut poll, &mut events, TIMEOUT_CHECK_TIME) {
                warn!(shard = shard.id, error = %e, "poll failed");
                break;
            }
        }
    }

    deregister_all(&shard, &poll);
}

fn process_timeouts(shard: &ThreadShard, params: &RunParams, now: u64) {
    let mut state = shard.state.lock();
    let expired = state.slots.expire_older_than(now, params.timeout_us);
    if expired.is_empty() {
        return;
    }

    for e in &expired {
        let sock = &mut state.sockets[e.sock as usize];
        sock.num_in_flight = sock.num_in_flight.saturating_sub(1);
    }
    state.stats.record_timedout(expired.len() as u64);
    state.last_activity = now;
    drop(state);
    shard.cond.notify_all();
}

fn cancel_outstanding(shard: &ThreadShard) {
    let mut state = shard.state.lock();
    let cancelled = state.slots.cancel_all();
    for e in &cancelled {
        let sock = &mut state.sockets[e.sock as usize];
        sock.num_in_flight = sock.num_in_flight.saturating_sub(1);
    }
    state.stats.record_interrupted(cancelled.len() as u64);
    drop(state);
    // Wakes a sender blocked in `wait_for_concurrency_slot`: with every
    // slot now free it would otherwise sleep until `stop_time`, which
    // defaults to unbounded when `--time-limit` isn't set.
    shard.cond.notify_all();
}

fn sender_done_and_drained(shard: &ThreadShard) -> bool {
    let state = shard.state.lock();
    state.done_sending && state.slots.num_outstanding() == 0
}

/// Attempts up to `RECV_BATCH_SIZE` reads, round-robining across sockets
/// starting at `last_socket` and rotating any TCP connection whose
/// per-connection query budget is spent.
fn receive_batch(shard: &ThreadShard, poll: &mut Poll, scratch: &mut Vec<u8>, now: u64) -> usize {
    let mut state = shard.state.lock();
    let n = state.sockets.len();
    if n == 0 {
        return 0;
    }

    let mut cursor = state.last_socket;
    let mut received = 0;

    'batch: while received < RECV_BATCH_SIZE {
        let mut any_progress = false;

        for step in 0..n {
            let idx = (cursor + step) % n;

            if state.sockets[idx].should_rotate() {
                close_and_reopen(shard.id, &mut state, poll, idx, now);
                any_progress = true;
                continue 'batch;
            }

            if matches!(
                state.sockets[idx].recv_state,
                RecvState::Closed | RecvState::Handshake
            ) {
                continue;
            }

            match state.sockets[idx].recv_frame(scratch) {
                Ok(Some(frame)) => {
                    process_response(&mut state, idx, &frame, now);
                    state.sockets[idx].num_recv += 1;
                    cursor = (idx + 1) % n;
                    received += 1;
                    any_progress = true;
                    continue 'batch;
                }
                Ok(None) => continue,
                Err(SocketIoError::WouldBlock) => continue,
                Err(e) => {
                    warn!(shard = shard.id, socket = idx, error = %e, "recv failed fatally, reopening");
                    close_and_reopen(shard.id, &mut state, poll, idx, now);
                    any_progress = true;
                    continue 'batch;
                }
            }
        }

        if !any_progress {
            break;
        }
    }

    state.last_socket = cursor;
    if received > 0 {
        state.last_activity = now;
    }
    received
}

fn process_response(state: &mut ShardState, sock_idx: usize, frame: &[u8], now: u64) {
    if frame.len() < 4 {
        state.stats.record_dropped_short();
        return;
    }

    let qid = u16::from_be_bytes([frame[0], frame[1]]);
    let word2 = u16::from_be_bytes([frame[2], frame[3]]);
    let rcode = (word2 & 0x0F) as u8;

    let generation = state.sockets[sock_idx].generation();
    match state.slots.complete(qid, sock_idx as u16, generation) {
        Ok(send_time) => {
            let latency = now.saturating_sub(send_time);
            state.stats.record_completed(latency, rcode, frame.len());
            let sock = &mut state.sockets[sock_idx];
            sock.num_in_flight = sock.num_in_flight.saturating_sub(1);
        }
        Err(_) => {
            debug!(socket = sock_idx, id = qid, "response matched no outstanding slot");
            state.stats.record_dropped_stale();
        }
    }
}

/// Used both for `TcpSentMax` rotation and for a fatal per-socket recv
/// error: the socket is closed and reopened rather than abandoned, so a
/// single bad connection doesn't shrink the shard's socket pool.
fn close_and_reopen(shard_id: usize, state: &mut ShardState, poll: &mut Poll, idx: usize, now: u64) {
    let _ = state.sockets[idx].deregister(poll.registry());
    state.sockets[idx].close(now);

    match state.sockets[idx].open(now, true) {
        Ok(()) => {
            state.stats.record_tcp_conn_opened();
            if let Err(e) = state.sockets[idx].register(poll.registry(), Token(idx)) {
                warn!(shard = shard_id, socket = idx, error = %e, "failed to re-register reopened socket");
            }
        }
        Err(e) => {
            warn!(shard = shard_id, socket = idx, error = %e, "failed to reopen socket");
        }
    }
}

fn deregister_all(shard: &ThreadShard, poll: &Poll) {
    let mut state = shard.state.lock();
    for sock in state.sockets.iter_mut() {
        let _ = sock.deregister(poll.registry());
    }
}
