//! Per-shard counters and the process-wide timing summary.
//!
//! Everything here is plain data updated under a shard's [`parking_lot::Mutex`]
//! (see [`crate::shard::ThreadShard`]); there is no internal synchronization
//! because none is needed — a shard's sender and receiver never touch
//! `ShardStats` without holding that lock.

use crate::codec::RCODE_STRINGS;

#[derive(Debug, Clone, Default)]
pub struct ShardStats {
    pub num_sent: u64,
    pub num_completed: u64,
    pub num_timedout: u64,
    pub num_interrupted: u64,
    pub num_tcp_conns: u64,

    pub dropped_malformed_input: u64,
    pub stale_responses_dropped: u64,
    pub short_responses_dropped: u64,
    /// A query whose slot was reserved and timestamped but whose `send()`
    /// failed fatally before any bytes reached the wire. Tracked
    /// separately from `num_sent` so the accounting closure below still
    /// holds exactly (see `DESIGN.md`).
    pub send_failed: u64,

    pub rcode_counts: [u64; 16],

    pub total_request_bytes: u64,
    pub total_response_bytes: u64,

    pub latency_sum_us: u128,
    pub latency_sum_sq_us: u128,
    pub latency_min_us: u64,
    pub latency_max_us: u64,
}

impl ShardStats {
    pub fn new() -> Self {
        Self {
            latency_min_us: u64::MAX,
            ..Default::default()
        }
    }

    pub fn record_sent(&mut self, request_len: usize) {
        self.num_sent += 1;
        self.total_request_bytes += request_len as u64;
    }

    pub fn record_completed(&mut self, latency_us: u64, rcode: u8, response_len: usize) {
        self.num_completed += 1;
        self.total_response_bytes += response_len as u64;
        self.rcode_counts[(rcode & 0x0F) as usize] += 1;

        self.latency_sum_us += latency_us as u128;
        self.latency_sum_sq_us += (latency_us as u128) * (latency_us as u128);
        self.latency_min_us = self.latency_min_us.min(latency_us);
        self.latency_max_us = self.latency_max_us.max(latency_us);
    }

    pub fn record_timedout(&mut self, n: u64) {
        self.num_timedout += n;
    }

    pub fn record_interrupted(&mut self, n: u64) {
        self.num_interrupted += n;
    }

    pub fn record_tcp_conn_opened(&mut self) {
        self.num_tcp_conns += 1;
    }

    pub fn record_dropped_malformed(&mut self) {
        self.dropped_malformed_input += 1;
    }

    pub fn record_dropped_stale(&mut self) {
        self.stale_responses_dropped += 1;
    }

    pub fn record_dropped_short(&mut self) {
        self.short_responses_dropped += 1;
    }

    pub fn record_send_failed(&mut self) {
        self.send_failed += 1;
    }

    /// `num_sent` only counts queries that actually left the wire (or were
    /// staged to, see `SocketSlot::send`'s `WouldBlock` path), so every one
    /// of them is, by shutdown, completed, timed out, or interrupted —
    /// exactly once. `dropped_malformed_input` and `send_failed` count
    /// queries that never entered that pool at all (rejected by the codec,
    /// or failed before a single byte was written); `stale_responses_dropped`
    /// and `short_responses_dropped` are response-side noise not tied 1:1
    /// to any one query. See `DESIGN.md` for the rationale.
    pub fn accounting_closure_holds(&self) -> bool {
        self.num_sent == self.num_completed + self.num_timedout + self.num_interrupted
    }

    pub fn mean_latency_us(&self) -> f64 {
        if self.num_completed == 0 {
            return 0.0;
        }
        self.latency_sum_us as f64 / self.num_completed as f64
    }

    /// Population standard deviation of latency, in microseconds.
    pub fn stddev_latency_us(&self) -> f64 {
        if self.num_completed == 0 {
            return 0.0;
        }
        let n = self.num_completed as f64;
        let mean = self.mean_latency_us();
        let mean_sq = self.latency_sum_sq_us as f64 / n;
        (mean_sq - mean * mean).max(0.0).sqrt()
    }

    pub fn merge(&mut self, other: &ShardStats) {
        self.num_sent += other.num_sent;
        self.num_completed += other.num_completed;
        self.num_timedout += other.num_timedout;
        self.num_interrupted += other.num_interrupted;
        self.num_tcp_conns += other.num_tcp_conns;
        self.dropped_malformed_input += other.dropped_malformed_input;
        self.stale_responses_dropped += other.stale_responses_dropped;
        self.short_responses_dropped += other.short_responses_dropped;
        self.send_failed += other.send_failed;
        for i in 0..16 {
            self.rcode_counts[i] += other.rcode_counts[i];
        }
        self.total_request_bytes += other.total_request_bytes;
        self.total_response_bytes += other.total_response_bytes;
        self.latency_sum_us += other.latency_sum_us;
        self.latency_sum_sq_us += other.latency_sum_sq_us;
        self.latency_min_us = self.latency_min_us.min(other.latency_min_us);
        self.latency_max_us = self.latency_max_us.max(other.latency_max_us);
    }

    /// Renders the RCODE histogram as `NAME: count` lines, skipping zero
    /// buckets, for the final report.
    pub fn rcode_report(&self) -> Vec<String> {
        self.rcode_counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(rcode, count)| format!("{}: {count}", RCODE_STRINGS[rcode]))
            .collect()
    }
}

/// Process-wide timing summary, assembled by the orchestrator once every
/// shard has exited.
#[derive(Debug, Clone, Copy, Default)]
pub struct Times {
    pub start_time: u64,
    pub stop_time: u64,
    pub end_time: u64,
    pub cumulative_tcp_hs: u64,
    pub cumulative_tls_hs: u64,
}

impl Times {
    pub fn wall_clock_us(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accounting_closure_holds_after_mixed_outcomes() {
        let mut stats = ShardStats::new();
        stats.record_sent(10);
        stats.record_completed(100, 0, 10);
        stats.record_sent(10);
        stats.record_timedout(1);
        stats.record_sent(10);
        stats.record_interrupted(1);
        // Rejected before ever reaching `send()`: not part of the `num_sent` pool.
        stats.record_dropped_malformed();

        assert!(stats.accounting_closure_holds());
    }

    #[test]
    fn latency_bounds_hold_across_samples() {
        let mut stats = ShardStats::new();
        for latency in [10u64, 50, 30, 90, 20] {
            stats.record_sent(1);
            stats.record_completed(latency, 0, 1);
        }

        let mean = stats.mean_latency_us();
        assert!(stats.latency_min_us as f64 <= mean);
        assert!(mean <= stats.latency_max_us as f64);
    }

    #[test]
    fn merge_sums_every_field() {
        let mut a = ShardStats::new();
        a.record_sent(1);
        a.record_completed(5, 2, 1);

        let mut b = ShardStats::new();
        b.record_sent(1);
        b.record_completed(7, 3, 1);

        a.merge(&b);

        assert_eq!(a.num_sent, 2);
        assert_eq!(a.num_completed, 2);
        assert_eq!(a.rcode_counts[2], 1);
        assert_eq!(a.rcode_counts[3], 1);
        assert_eq!(a.latency_min_us, 5);
        assert_eq!(a.latency_max_us, 7);
    }
}
