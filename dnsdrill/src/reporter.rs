//! `IntervalReporter`: an optional thread that prints a periodic
//! throughput snapshot while a run is in progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::Clock;
use crate::shard::ThreadShard;

/// Sleeps for `interval`, prints a QPS delta, repeats — until `finished`
/// (set by the orchestrator once every shard has joined) or `interrupt`
/// (set by `SIGINT`) is observed.
pub fn run(
    shards: Arc<Vec<Arc<ThreadShard>>>,
    interval: Duration,
    clock: Clock,
    finished: Arc<AtomicBool>,
    interrupt: Arc<AtomicBool>,
) {
    let mut last_sent = 0u64;
    let mut last_time = clock.now();

    loop {
        thread_sleep_checking(interval, &finished, &interrupt);
        if finished.load(Ordering::Relaxed) || interrupt.load(Ordering::Relaxed) {
            break;
        }

        let total_sent: u64 = shards.iter().map(|s| s.state.lock().stats.num_sent).sum();
        let now = clock.now();
        let elapsed_s = now.saturating_sub(last_time) as f64 / 1_000_000.0;
        let delta = total_sent.saturating_sub(last_sent);
        let qps = if elapsed_s > 0.0 { delta as f64 / elapsed_s } else { 0.0 };

        info!(qps = format!("{qps:.1}"), total_sent, "interval report");

        last_sent = total_sent;
        last_time = now;
    }
}

/// Sleeps in short slices so a finish/interrupt signal is noticed within
/// a fraction of `interval` rather than only after it fully elapses.
fn thread_sleep_checking(interval: Duration, finished: &AtomicBool, interrupt: &AtomicBool) {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = interval;

    while remaining > Duration::ZERO {
        if finished.load(Ordering::Relaxed) || interrupt.load(Ordering::Relaxed) {
            return;
        }
        let slice = remaining.min(SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
}
