//! `ThreadShard`: the sockets, slot table, and statistics owned jointly by
//! one sender/receiver thread pair.

use parking_lot::{Condvar, Mutex};

use crate::codec::TsigKey;
use crate::config::Transport;
use crate::slot::SlotTable;
use crate::socket_slot::SocketSlot;
use crate::stats::ShardStats;

/// Immutable for the duration of a run, so it's handed to both threads as
/// a plain `Arc<RunParams>` rather than living behind the shard mutex.
pub struct RunParams {
    pub shard_id: usize,
    pub transport: Transport,
    pub timeout_us: u64,
    pub max_qps: u64,
    pub max_outstanding: u64,
    pub max_tcp_queries: Option<u64>,
    pub edns: bool,
    pub dnssec: bool,
    pub tsig: Option<TsigKey>,
    pub is_update: bool,
    pub start_time: u64,
    pub stop_time: u64,
}

/// Everything a shard's sender and receiver mutate, behind one lock: the
/// slot table's list links, each socket's state machine and counters,
/// and the TLS session handle.
pub struct ShardState {
    pub sockets: Vec<SocketSlot>,
    pub slots: SlotTable,
    pub stats: ShardStats,
    pub done_sending: bool,
    pub done_send_time: u64,
    /// Sender-side round-robin cursor.
    pub current_sock: usize,
    /// Receiver-side round-robin cursor, independent of the sender's so
    /// the two don't starve each other's sweep.
    pub last_socket: usize,
    /// Timestamp of the most recent send or receive activity; harvested
    /// by the orchestrator as the authoritative `end_time`.
    pub last_activity: u64,
}

pub struct ThreadShard {
    pub id: usize,
    pub state: Mutex<ShardState>,
    pub cond: Condvar,
}

impl ThreadShard {
    pub fn new(id: usize, sockets: Vec<SocketSlot>) -> Self {
        Self {
            id,
            state: Mutex::new(ShardState {
                sockets,
                slots: SlotTable::new(),
                stats: ShardStats::new(),
                done_sending: false,
                done_send_time: 0,
                current_sock: 0,
                last_socket: 0,
                last_activity: 0,
            }),
            cond: Condvar::new(),
        }
    }
}
