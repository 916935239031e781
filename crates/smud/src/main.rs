use std::{process::ExitCode, time::Duration};

use clap::Parser;
use smu_driver::Resource;
use smud::{Instrument, ServeOptions, serve};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "smud", about = "Source-measure unit server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 8888)]
    port: u16,
    /// Instrument resource: SIM, SIM::<ohms>, or TCPIP::<host>::<port>::SOCKET.
    #[arg(long, alias = "gpib", default_value = "GPIB1::24::INSTR")]
    resource: Resource,
    /// Fast measurement profile (default).
    #[arg(long, conflicts_with = "no_fast")]
    fast: bool,
    /// Standard measurement profile.
    #[arg(long)]
    no_fast: bool,
    #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u32).range(1..))]
    max_sessions: u32,
    #[arg(long, default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("smud error: {err}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let fast_mode = args.fast || !args.no_fast;

    info!(
        resource = %args.resource,
        fast_mode,
        server = env!("CARGO_PKG_VERSION"),
        "starting smud"
    );
    let instrument = Instrument::connect(&args.resource, fast_mode).await?;

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!(addr = %listener.local_addr()?, "listening for clients");

    let options = ServeOptions {
        max_sessions: args.max_sessions as usize,
        stats_interval: Duration::from_secs(args.stats_interval_secs),
    };
    serve(listener, instrument, options, wait_for_shutdown()).await?;
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => Some(terminate),
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                None
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = async {
                match terminate.as_mut() {
                    Some(terminate) => {
                        terminate.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {}
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to wait for Ctrl-C");
        }
    }
}
