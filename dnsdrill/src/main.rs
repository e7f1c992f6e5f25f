use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dnsdrill::config::{Cli, Config};
use dnsdrill::error::{DnsDrillError, EXIT_INTERRUPTED};
use dnsdrill::orchestrator::{Orchestrator, RunReport};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Calling `install_default` only once per process should always succeed");

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{e:#}");
            return ExitCode::from(DnsDrillError::Config(e).exit_code() as u8);
        }
    };

    match Orchestrator::new(config).run() {
        Ok(report) => {
            print_report(&report);
            if report.stats.num_interrupted > 0 {
                ExitCode::from(EXIT_INTERRUPTED as u8)
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(DnsDrillError::Fatal(e).exit_code() as u8)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_report(report: &RunReport) {
    let stats = &report.stats;
    let times = &report.times;

    tracing::info!(
        sent = stats.num_sent,
        completed = stats.num_completed,
        timed_out = stats.num_timedout,
        interrupted = stats.num_interrupted,
        tcp_conns = stats.num_tcp_conns,
        dropped_malformed = stats.dropped_malformed_input,
        dropped_stale = stats.stale_responses_dropped,
        dropped_short = stats.short_responses_dropped,
        send_failed = stats.send_failed,
        wall_clock_us = times.wall_clock_us(),
        mean_latency_us = stats.mean_latency_us(),
        stddev_latency_us = stats.stddev_latency_us(),
        input_passes = report.nruns,
        end_reason = %report.end_reason,
        "run summary"
    );

    for line in stats.rcode_report() {
        tracing::info!("{line}");
    }

    if !stats.accounting_closure_holds() {
        tracing::warn!(
            "accounting closure does not hold: sent={} completed={} timed_out={} interrupted={}",
            stats.num_sent,
            stats.num_completed,
            stats.num_timedout,
            stats.num_interrupted
        );
    }
}
