//! Spawns shards, distributes global budgets across them, and aggregates
//! final statistics.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use mio::{Poll, Token};
use rustls::ClientConfig;
use rustls_pki_types::ServerName;
use tracing::info;

use crate::clock::Clock;
use crate::config::{Config, Transport};
use crate::datafile::DataFile;
use crate::os::{Interrupt, WAKE_TOKEN};
use crate::shard::{RunParams, ThreadShard};
use crate::socket_slot::SocketSlot;
use crate::stats::{ShardStats, Times};
use crate::{receiver, reporter, sender};

/// Per-shard socket count cap.
const MAX_SOCKETS_PER_SHARD: u32 = 256;

/// Why the run stopped issuing new queries, surfaced in the final report
/// the way the source contract's `DataFile::nruns` is documented for
/// ("end-of-test reason reporting").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Interrupted,
    TimeLimit,
    MaxRuns,
    EndOfInput,
}

impl std::fmt::Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EndReason::Interrupted => "interrupted (SIGINT)",
            EndReason::TimeLimit => "time limit reached",
            EndReason::MaxRuns => "reached --max-runs passes over the input",
            EndReason::EndOfInput => "end of input",
        })
    }
}

pub struct RunReport {
    pub stats: ShardStats,
    pub times: Times,
    pub nruns: u32,
    pub end_reason: EndReason,
}

pub struct Orchestrator {
    config: Config,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub fn run(&self) -> Result<RunReport> {
        let clock = Clock::start();
        let start_time = clock.now();
        let stop_time = match self.config.time_limit {
            Some(limit) => start_time + limit.as_micros() as u64,
            None => u64::MAX,
        };

        let tls_config = self.build_tls_config()?;
        let server_name = self.build_server_name()?;

        let budgets = self.config.shard_budgets();
        let interrupt = Interrupt::new();

        let mut shards = Vec::with_capacity(budgets.len());
        let mut run_params = Vec::with_capacity(budgets.len());
        let mut datafiles = Vec::with_capacity(budgets.len());
        let mut next_port_offset: u16 = 0;

        for (shard_id, budget) in budgets.iter().enumerate() {
            let num_sockets = budget.clients.min(MAX_SOCKETS_PER_SHARD).max(1);
            let mut sockets = Vec::with_capacity(num_sockets as usize);

            for _ in 0..num_sockets {
                let mut slot = SocketSlot::new(
                    shard_id,
                    sockets.len() as u16,
                    next_port_offset,
                    self.config.transport,
                    self.config.server,
                    SocketAddr::new(self.config.local_addr, 0),
                    tls_config.clone(),
                    server_name.clone(),
                    self.config.max_tcp_queries,
                );
                slot.open(start_time, false)
                    .context("Failed to open a client socket")?;
                sockets.push(slot);
                next_port_offset = next_port_offset.wrapping_add(1);
            }

            let shard = Arc::new(ThreadShard::new(shard_id, sockets));
            {
                let mut state = shard.state.lock();
                if self.config.transport != Transport::Udp {
                    for _ in 0..num_sockets {
                        state.stats.record_tcp_conn_opened();
                    }
                }
            }

            let mut datafile = DataFile::open(&self.config.datafile)
                .context("Failed to open data file")?;
            datafile.set_max_runs(self.config.max_runs);
            datafile.set_interrupt_flag(interrupt.flag());

            run_params.push(Arc::new(RunParams {
                shard_id,
                transport: self.config.transport,
                timeout_us: self.config.timeout.as_micros() as u64,
                max_qps: budget.max_qps,
                max_outstanding: budget.max_outstanding,
                max_tcp_queries: self.config.max_tcp_queries,
                edns: self.config.edns,
                dnssec: self.config.dnssec,
                tsig: self.config.tsig.clone(),
                is_update: self.config.is_update,
                start_time,
                stop_time,
            }));
            shards.push(shard);
            datafiles.push(datafile);
        }

        let shards = Arc::new(shards);

        // Build one mio::Poll per shard, registering its sockets plus a
        // waker, before handing ownership of each Poll into its receiver
        // thread; the wakers are collected so SIGINT reaches every shard.
        let mut polls = Vec::with_capacity(shards.len());
        let mut wakers = Vec::with_capacity(shards.len() + 1);

        for shard in shards.iter() {
            let poll = Poll::new().context("Failed to create mio::Poll for shard")?;
            {
                let mut state = shard.state.lock();
                for (idx, sock) in state.sockets.iter_mut().enumerate() {
                    sock.register(poll.registry(), Token(idx))
                        .context("Failed to register socket with mio")?;
                }
            }
            let waker = Arc::new(
                mio::Waker::new(poll.registry(), WAKE_TOKEN).context("Failed to create mio::Waker")?,
            );
            wakers.push(waker);
            polls.push(poll);
        }

        let finished = Arc::new(AtomicBool::new(false));
        interrupt
            .install(wakers)
            .context("Failed to install SIGINT handler")?;

        let mut sender_handles = Vec::with_capacity(shards.len());
        let mut receiver_handles = Vec::with_capacity(shards.len());

        for ((shard, params), datafile) in shards.iter().cloned().zip(run_params.iter().cloned()).zip(datafiles) {
            let intr_flag = interrupt.flag();
            sender_handles.push(std::thread::spawn(move || {
                sender::run(shard, datafile, params, clock, intr_flag)
            }));
        }

        for ((shard, params), poll) in shards.iter().cloned().zip(run_params.iter().cloned()).zip(polls) {
            let intr_flag = interrupt.flag();
            receiver_handles.push(std::thread::spawn(move || {
                receiver::run(shard, params, clock, intr_flag, poll);
            }));
        }

        let reporter_handle = self.config.report_interval.map(|interval| {
            let shards = shards.clone();
            let finished = finished.clone();
            let intr_flag = interrupt.flag();
            std::thread::spawn(move || {
                reporter::run(shards, interval, clock, finished, intr_flag);
            })
        });

        info!(
            threads = self.config.threads,
            clients = self.config.clients,
            transport = ?self.config.transport,
            "run started"
        );

        // Senders must finish (and thus stop touching their `DataFile`)
        // before receivers can observe `done_sending && num_outstanding
        // == 0`, so join them first; collecting `nruns` here is what lets
        // the report below say whether --time-limit, --max-runs, or
        // plain end-of-input ended the test.
        let nruns = sender_handles
            .into_iter()
            .map(|h| h.join().unwrap_or(0))
            .max()
            .unwrap_or(0);
        for handle in receiver_handles {
            let _ = handle.join();
        }
        finished.store(true, Ordering::Relaxed);
        if let Some(handle) = reporter_handle {
            let _ = handle.join();
        }

        // Both threads have joined, so every socket is idle: close them all
        // here rather than relying on `Drop`, since `SocketSlot::close` is
        // what folds `tcp_hs_done`/`tls_hs_done` into the cumulative
        // handshake totals the report below reads. Without this, a run
        // with no `TcpSentMax` rotation (the common case without
        // `--max-tcp-queries`) would never close a single socket before
        // shutdown and `cumulative_tcp_hs`/`cumulative_tls_hs` would stay 0.
        let shutdown_now = clock.now();
        for shard in shards.iter() {
            let mut state = shard.state.lock();
            for sock in state.sockets.iter_mut() {
                sock.close(shutdown_now);
            }
        }

        let end_time = shards
            .iter()
            .map(|s| s.state.lock().last_activity)
            .max()
            .unwrap_or(start_time)
            .max(start_time);

        let mut total = ShardStats::new();
        let mut cumulative_tcp_hs = 0u64;
        let mut cumulative_tls_hs = 0u64;
        for shard in shards.iter() {
            let state = shard.state.lock();
            total.merge(&state.stats);
            for sock in state.sockets.iter() {
                cumulative_tcp_hs += sock.cumulative_tcp_hs;
                cumulative_tls_hs += sock.cumulative_tls_hs;
            }
        }

        let times = Times {
            start_time,
            stop_time,
            end_time,
            cumulative_tcp_hs,
            cumulative_tls_hs,
        };

        let end_reason = if interrupt.is_set() {
            EndReason::Interrupted
        } else if self.config.max_runs != 0 && nruns >= self.config.max_runs {
            EndReason::MaxRuns
        } else if end_time >= stop_time {
            EndReason::TimeLimit
        } else {
            EndReason::EndOfInput
        };
        info!(%end_reason, "run ended");

        Ok(RunReport {
            stats: total,
            times,
            nruns,
            end_reason,
        })
    }

    fn build_tls_config(&self) -> Result<Option<Arc<ClientConfig>>> {
        if self.config.transport != Transport::Tls {
            return Ok(None);
        }

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Ok(Some(Arc::new(config)))
    }

    fn build_server_name(&self) -> Result<Option<ServerName<'static>>> {
        if self.config.transport != Transport::Tls {
            return Ok(None);
        }

        let name = ServerName::try_from(self.config.server_host.clone())
            .context("Invalid server name for TLS")?;
        Ok(Some(name))
    }
}
