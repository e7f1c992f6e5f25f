//! OS-level readiness and signal primitives.
//!
//! The engine's sender/receiver loops are synchronous and non-blocking;
//! this module supplies the handful of primitives the source contract
//! names (`wait_readable`, `wait_any_readable`, signal handling) using
//! `mio` for readiness and `ctrlc` for `SIGINT`, the same way
//! `relay/server/src/sockets.rs` drives its own non-blocking socket loop
//! from a plain OS thread.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use mio::{Events, Poll, Waker};

/// Reserved token for the waker registered alongside a shard's sockets;
/// real sockets are registered at other tokens so this one never collides.
pub const WAKE_TOKEN: mio::Token = mio::Token(usize::MAX);

/// Blocks until a registered socket is readable/writable, the waker
/// fires, or `timeout` elapses. Returns `false` on a bare timeout so
/// callers can distinguish "nothing happened" from "something to check".
pub fn wait_any_readable(poll: &mut Poll, events: &mut Events, timeout: Duration) -> io::Result<bool> {
    match poll.poll(events, Some(timeout)) {
        Ok(()) => Ok(!events.is_empty()),
        Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(false),
        Err(e) => Err(e),
    }
}

/// The process-wide `SIGINT` flag, plus the machinery to wake every
/// blocked shard receiver the instant it's set.
#[derive(Clone)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        self.flag.clone()
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Installs the process `SIGINT` handler. Must be called at most once
    /// per process (`ctrlc` itself enforces this). Every `waker` passed in
    /// fires when the signal arrives, so each shard's idle `poll` and the
    /// orchestrator's own join unblock immediately instead of waiting out
    /// `TIMEOUT_CHECK_TIME`.
    pub fn install(&self, wakers: Vec<Arc<Waker>>) -> Result<()> {
        let flag = self.flag.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
            for waker in &wakers {
                let _ = waker.wake();
            }
        })
        .context("Failed to install SIGINT handler")?;
        Ok(())
    }
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_any_readable_times_out_cleanly() {
        let mut poll = Poll::new().unwrap();
        let mut events = Events::with_capacity(16);

        let woke = wait_any_readable(&mut poll, &mut events, Duration::from_millis(10)).unwrap();
        assert!(!woke);
    }

    #[test]
    fn interrupt_flag_is_observable_across_clones() {
        let intr = Interrupt::new();
        let flag = intr.flag();
        flag.store(true, Ordering::SeqCst);
        assert!(intr.is_set());
    }
}
