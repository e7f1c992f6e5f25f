//! Command-line parsing and validated run configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context as _, Result, bail, ensure};
use clap::Parser;

use crate::codec::TsigKey;

/// Transport used to reach the server under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
}

/// Raw command-line arguments, parsed by `clap` before validation.
#[derive(Debug, Parser)]
#[command(name = "dnsdrill", about = "Multi-threaded DNS load-generation engine", long_about = None)]
pub struct Cli {
    /// DNS server to query, `host[:port]` (default port 53, or 853 with --use-tls).
    #[arg(long)]
    pub server: String,

    /// Local address to bind client sockets to.
    #[arg(long, default_value = "0.0.0.0")]
    pub local_addr: IpAddr,

    /// Input file of DNS questions (or dynamic-update descriptions); `-` for stdin.
    #[arg(short = 'f', long = "datafile", default_value = "-")]
    pub datafile: PathBuf,

    /// Treat each input line as a dynamic-update description rather than a query.
    #[arg(long)]
    pub update: bool,

    /// Number of sender/receiver shard threads.
    #[arg(short = 'T', long, default_value_t = 1)]
    pub threads: u32,

    /// Number of simulated clients (concurrent socket identities), divided across threads.
    #[arg(short = 'c', long, default_value_t = 1)]
    pub clients: u32,

    /// Maximum queries per second across all threads, 0 = unlimited.
    #[arg(short = 'Q', long = "max-qps", default_value_t = 0)]
    pub max_qps: u64,

    /// Maximum outstanding queries across all threads, capped at 65536 per shard.
    #[arg(long = "max-outstanding", default_value_t = 100)]
    pub max_outstanding: u64,

    /// Per-query timeout, in seconds.
    #[arg(short = 't', long, default_value_t = 5.0)]
    pub timeout_secs: f64,

    /// Wall-clock run limit, in seconds; 0 = run until end-of-input.
    #[arg(short = 'l', long = "time-limit", default_value_t = 0.0)]
    pub time_limit_secs: f64,

    /// How many times to loop over the input file; 0 = forever (until --time-limit).
    #[arg(long = "max-runs", default_value_t = 0)]
    pub max_runs: u32,

    /// Use TCP instead of UDP.
    #[arg(long = "use-tcp")]
    pub use_tcp: bool,

    /// Use TLS (implies TCP).
    #[arg(long = "use-tls")]
    pub use_tls: bool,

    /// Close and reopen each TCP connection after this many queries; 0 = never.
    #[arg(long = "max-tcp-queries", default_value_t = 0)]
    pub max_tcp_queries: u64,

    /// Add an EDNS0 OPT record to every query.
    #[arg(short = 'e', long)]
    pub edns: bool,

    /// Set the DNSSEC OK bit.
    #[arg(short = 'D', long)]
    pub dnssec: bool,

    /// TSIG key, `[alg:]name:secret`.
    #[arg(short = 'y', long = "tsig")]
    pub tsig: Option<String>,

    /// Print a periodic QPS snapshot every `interval` seconds; 0 disables it.
    #[arg(short = 's', long = "report-interval", default_value_t = 0.0)]
    pub report_interval_secs: f64,

    /// Increase logging verbosity (pass multiple times).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Validated, fully-resolved configuration for one run.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: SocketAddr,
    pub server_host: String,
    pub local_addr: IpAddr,
    pub datafile: PathBuf,
    pub is_update: bool,
    pub threads: u32,
    pub clients: u32,
    pub max_qps: u64,
    pub max_outstanding: u64,
    pub timeout: Duration,
    pub time_limit: Option<Duration>,
    pub max_runs: u32,
    pub transport: Transport,
    pub max_tcp_queries: Option<u64>,
    pub edns: bool,
    pub dnssec: bool,
    pub tsig: Option<TsigKey>,
    pub report_interval: Option<Duration>,
    pub verbose: u8,
}

/// Per-shard budgets computed by [`Config::shard_budgets`].
#[derive(Debug, Clone, Copy)]
pub struct ShardBudget {
    pub clients: u32,
    pub max_qps: u64,
    pub max_outstanding: u64,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        ensure!(cli.threads > 0, "--threads must be at least 1");
        ensure!(cli.clients > 0, "--clients must be at least 1");
        ensure!(cli.timeout_secs > 0.0, "--timeout must be positive");
        ensure!(
            cli.max_outstanding > 0,
            "--max-outstanding must be at least 1"
        );

        let transport = match (cli.use_tcp, cli.use_tls) {
            (_, true) => Transport::Tls,
            (true, false) => Transport::Tcp,
            (false, false) => Transport::Udp,
        };

        let default_port = if transport == Transport::Tls { 853 } else { 53 };
        let (host, server) = resolve_server(&cli.server, default_port)
            .context("Failed to resolve --server")?;

        let tsig = cli
            .tsig
            .as_deref()
            .map(TsigKey::parse)
            .transpose()
            .context("Failed to parse --tsig key")?;

        if cli.max_tcp_queries > 0 {
            ensure!(
                transport != Transport::Udp,
                "--max-tcp-queries requires --use-tcp or --use-tls"
            );
        }

        let threads = cli.threads.min(cli.clients.max(1));
        let threads = if cli.max_qps > 0 {
            threads.min(cli.max_qps.max(1) as u32)
        } else {
            threads
        };
        if threads == 0 {
            bail!("no shard threads could be scheduled for the given --clients/--max-qps");
        }

        Ok(Self {
            server,
            server_host: host,
            local_addr: cli.local_addr,
            datafile: cli.datafile,
            is_update: cli.update,
            threads,
            clients: cli.clients,
            max_qps: cli.max_qps,
            max_outstanding: cli.max_outstanding.min(65_536 * threads as u64),
            timeout: Duration::from_secs_f64(cli.timeout_secs),
            time_limit: (cli.time_limit_secs > 0.0)
                .then(|| Duration::from_secs_f64(cli.time_limit_secs)),
            max_runs: cli.max_runs,
            transport,
            max_tcp_queries: (cli.max_tcp_queries > 0).then_some(cli.max_tcp_queries),
            edns: cli.edns,
            dnssec: cli.dnssec,
            tsig,
            report_interval: (cli.report_interval_secs > 0.0)
                .then(|| Duration::from_secs_f64(cli.report_interval_secs)),
            verbose: cli.verbose,
        })
    }

    /// Divides global `clients`/`max_qps`/`max_outstanding` budgets as
    /// evenly as possible across `self.threads` shards. Shards at index
    /// `< remainder` absorb one extra unit of each budget.
    pub fn shard_budgets(&self) -> Vec<ShardBudget> {
        let n = self.threads as u64;

        (0..self.threads)
            .map(|i| ShardBudget {
                clients: even_share(self.clients as u64, n, i as u64) as u32,
                max_qps: even_share(self.max_qps, n, i as u64),
                max_outstanding: even_share(self.max_outstanding, n, i as u64).min(65_536),
            })
            .collect()
    }
}

fn even_share(total: u64, n: u64, index: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    let base = total / n;
    let remainder = total % n;
    base + u64::from(index < remainder)
}

fn resolve_server(spec: &str, default_port: u16) -> Result<(String, SocketAddr)> {
    use std::net::ToSocketAddrs;

    let (host, candidate) = match spec.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            (host.to_string(), spec.to_string())
        }
        _ => (spec.to_string(), format!("{spec}:{default_port}")),
    };

    let addr = candidate
        .to_socket_addrs()
        .with_context(|| format!("Could not resolve `{candidate}`"))?
        .next()
        .with_context(|| format!("`{candidate}` resolved to no addresses"))?;

    Ok((host, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_budgets_are_near_even() {
        let cli = Cli {
            server: "127.0.0.1:53".into(),
            local_addr: "0.0.0.0".parse().unwrap(),
            datafile: "-".into(),
            update: false,
            threads: 3,
            clients: 10,
            max_qps: 100,
            max_outstanding: 10,
            timeout_secs: 1.0,
            time_limit_secs: 0.0,
            max_runs: 0,
            use_tcp: false,
            use_tls: false,
            max_tcp_queries: 0,
            edns: false,
            dnssec: false,
            tsig: None,
            report_interval_secs: 0.0,
            verbose: 0,
        };
        let config = Config::from_cli(cli).unwrap();
        let budgets = config.shard_budgets();

        assert_eq!(budgets.len(), 3);
        assert_eq!(
            budgets.iter().map(|b| b.clients as u64).sum::<u64>(),
            10
        );
        assert_eq!(budgets.iter().map(|b| b.max_qps).sum::<u64>(), 100);
        assert!(budgets.iter().all(|b| b.max_outstanding <= 65_536));
    }

    #[test]
    fn threads_are_clamped_to_clients_and_max_qps() {
        let cli = Cli {
            server: "127.0.0.1:53".into(),
            local_addr: "0.0.0.0".parse().unwrap(),
            datafile: "-".into(),
            update: false,
            threads: 8,
            clients: 2,
            max_qps: 3,
            max_outstanding: 10,
            timeout_secs: 1.0,
            time_limit_secs: 0.0,
            max_runs: 0,
            use_tcp: false,
            use_tls: false,
            max_tcp_queries: 0,
            edns: false,
            dnssec: false,
            tsig: None,
            report_interval_secs: 0.0,
            verbose: 0,
        };
        let config = Config::from_cli(cli).unwrap();

        assert_eq!(config.threads, 2);
    }
}
