//! Simulation harness for the mpquic path scheduler.
//!
//! Drives the scheduler over synthetic paths and prints one JSON report per
//! run, so policies can be compared without a network.

mod sim;

use clap::{Parser, Subcommand, ValueEnum};
use mpquic_core::Perspective;
use mpquic_sched::PathPolicy;
use sim::{simulate, PathSpec, RunReport, Scenario};
use std::io::Write;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Simulation harness for the mpquic path scheduler.
#[derive(Parser, Debug)]
#[command(name = "mpquic-bench", about = "Path scheduler simulation harness")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Side {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Policy {
    SinglePath,
    MultiPath,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Simulate a transfer and report per-stream and per-path results
    Simulate {
        /// Path as rtt_ms:mbps:cwnd[:loss]; repeat for more paths, the
        /// first one is the initial path
        #[arg(long = "path", required = true)]
        paths: Vec<PathSpec>,

        /// Which end of the connection sends
        #[arg(long, value_enum, default_value = "server")]
        side: Side,

        /// Stream placement policy
        #[arg(long, value_enum, default_value = "single-path")]
        policy: Policy,

        /// Path advisor endpoint (host:port) for the multi-path policy
        #[arg(long)]
        advisor: Option<String>,

        /// RTT jitter standard deviation in milliseconds
        #[arg(long, default_value = "0")]
        jitter_ms: f64,

        /// Number of streams
        #[arg(long, default_value = "4")]
        streams: usize,

        /// Bytes per stream
        #[arg(long, default_value = "262144")]
        stream_bytes: usize,

        /// Stream weights, assigned round-robin
        #[arg(long, value_delimiter = ',', default_value = "128")]
        weights: Vec<u8>,

        /// Simulation tick in milliseconds
        #[arg(long, default_value = "1")]
        tick_ms: u64,

        /// Give up after this many simulated seconds
        #[arg(long, default_value = "60")]
        max_secs: u64,

        /// Number of runs, each with the next seed
        #[arg(long, default_value = "1")]
        runs: usize,

        /// Seed of the first run
        #[arg(long, default_value = "1")]
        seed: u64,

        /// Report file path (use - for stdout)
        #[arg(long, default_value = "-")]
        log: String,
    },
}

enum LogWriter {
    Stdout,
    File(std::fs::File),
}

impl LogWriter {
    fn open(path: &str) -> std::io::Result<Self> {
        if path == "-" {
            Ok(Self::Stdout)
        } else {
            Ok(Self::File(std::fs::File::create(path)?))
        }
    }

    fn log(&mut self, report: &RunReport) {
        let line = serde_json::to_string(report).unwrap_or_default();
        match self {
            Self::Stdout => {
                println!("{}", line);
            }
            Self::File(f) => {
                let _ = writeln!(f, "{}", line);
                let _ = f.flush();
            }
        }
    }
}

fn summarize(reports: &[RunReport]) {
    let times: Vec<f64> = reports.iter().filter_map(|r| r.completion_s).collect();
    if times.is_empty() {
        eprintln!("no run completed");
        return;
    }
    let mean = times.iter().sum::<f64>() / times.len() as f64;
    let best = times.iter().copied().fold(f64::INFINITY, f64::min);
    let worst = times.iter().copied().fold(0.0, f64::max);
    eprintln!(
        "runs={} completed={} mean={:.3}s best={:.3}s worst={:.3}s",
        reports.len(),
        times.len(),
        mean,
        best,
        worst
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Simulate {
            paths,
            side,
            policy,
            advisor,
            jitter_ms,
            streams,
            stream_bytes,
            weights,
            tick_ms,
            max_secs,
            runs,
            seed,
            log,
        } => {
            let scenario = Scenario {
                perspective: match side {
                    Side::Client => Perspective::Client,
                    Side::Server => Perspective::Server,
                },
                policy: match policy {
                    Policy::SinglePath => PathPolicy::SinglePath,
                    Policy::MultiPath => PathPolicy::MultiPath,
                },
                paths,
                jitter: Duration::from_secs_f64(jitter_ms.max(0.0) / 1000.0),
                streams,
                stream_bytes,
                weights,
                tick: Duration::from_millis(tick_ms.max(1)),
                max_time: Duration::from_secs(max_secs),
                advisor,
            };
            let mut writer = LogWriter::open(&log)?;
            let mut reports = Vec::with_capacity(runs);
            for run in 0..runs {
                let report = simulate(&scenario, run, seed.wrapping_add(run as u64)).await?;
                writer.log(&report);
                reports.push(report);
            }
            summarize(&reports);
        }
    }

    Ok(())
}
