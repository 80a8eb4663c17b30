use bitnode_bees::{AddressFamily, QueryContext, Server, ServerConfig};
use clap::Parser;
use std::error::Error;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for any failure before the server is up
const EXIT_STARTUP_FAILURE: u8 = 255;
const EXIT_INTERRUPTED: u8 = 1;
const EXIT_HANGUP: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "bitnode-bees", version, about = "DNS front-end listening on UDP and TCP")]
struct Args {
    /// Port shared by the UDP and TCP listeners
    #[arg(short, long)]
    port: Option<u16>,

    /// Listen on IPv6 instead of IPv4
    #[arg(long)]
    ipv6: bool,

    /// Explicit address to bind to
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How long shutdown waits for TCP clients, in milliseconds
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting bitnode-bees v{}...", env!("CARGO_PKG_VERSION"));

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            report_startup_error(e.as_ref());
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    let server = Server::new(config, log_and_discard);
    if let Err(e) = server.start().await {
        report_startup_error(&e);
        return ExitCode::from(EXIT_STARTUP_FAILURE);
    }

    info!("bitnode-bees successfully started.");

    let code = wait_for_termination().await;

    info!("Stopping bitnode-bees...");
    server.stop().await;
    info!("bitnode-bees stopped with code {}.", code);

    ExitCode::from(code)
}

/// File first, then environment, then command line
fn build_config(args: &Args) -> Result<ServerConfig, Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config = config.apply_env()?;

    if let Some(port) = args.port {
        config.port = port;
    }
    if args.ipv6 {
        config.address_family = AddressFamily::Ipv6;
    }
    if let Some(ip) = args.bind {
        config = config.with_bind_ip(ip);
    }
    if let Some(ms) = args.drain_timeout_ms {
        config.drain_timeout = Duration::from_millis(ms);
    }

    config.validate()?;
    Ok(config)
}

/// No resolution layer yet: log what arrived and drop it
fn log_and_discard(query: QueryContext) {
    info!(
        "{} message of {} bytes from {}",
        query.transport,
        query.payload.len(),
        query.remote
    );
    debug!("Payload: {:02x?}", query.payload.as_ref());
}

fn report_startup_error(err: &dyn Error) {
    let mut message = format!("An unexpected error occurred: {}", err);
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(&format!("\n  caused by: {}", cause));
        source = cause.source();
    }
    error!("{}", message);
}

#[cfg(unix)]
async fn wait_for_termination() -> u8 {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!("Failed to install SIGHUP handler: {}", e);
            return wait_for_interrupt().await;
        }
    };

    tokio::select! {
        code = wait_for_interrupt() => code,
        _ = hangup.recv() => {
            warn!("Hung up.");
            EXIT_HANGUP
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> u8 {
    wait_for_interrupt().await
}

async fn wait_for_interrupt() -> u8 {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    warn!("Terminated.");
    EXIT_INTERRUPTED
}
