mod service;

use clap::Parser;
use mpquic_core::{parse_host_port, resolve_host_port, AddressKind, HostPort, DEFAULT_ADVISOR_PORT};
use service::{serve, Policy, Rule, ServiceError};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "mpquic-advisor",
    about = "mpquic-advisor - picks paths for streams of multipath QUIC schedulers"
)]
struct Args {
    #[arg(
        long = "listen",
        short = 'l',
        default_value = "127.0.0.1:5555",
        value_parser = parse_listen_address
    )]
    listen: HostPort,
    #[arg(long = "rule", short = 'r', value_enum, default_value_t = Rule::LowestRtt)]
    rule: Rule,
    /// Reference object size in bytes for the completion-time rule.
    #[arg(long = "object-size", default_value_t = 1 << 20)]
    object_size: u64,
}

fn main() {
    init_logging();
    let args = Args::parse();
    let policy = Policy {
        rule: args.rule,
        object_size: args.object_size,
    };

    let runtime = match Builder::new_current_thread().enable_io().enable_time().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("Failed to build Tokio runtime: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = runtime.block_on(run(&args.listen, policy)) {
        tracing::error!("Advisor error: {}", err);
        std::process::exit(1);
    }
}

async fn run(listen: &HostPort, policy: Policy) -> Result<(), ServiceError> {
    let addr = resolve_host_port(listen)?;
    let listener = TcpListener::bind(addr).await?;
    serve(listener, policy).await
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn parse_listen_address(input: &str) -> Result<HostPort, String> {
    parse_host_port(input, DEFAULT_ADVISOR_PORT, AddressKind::Listen).map_err(|err| err.to_string())
}
