//! ZProc state server binary.
//!
//! Starts a state server, prints the bound endpoints on stdout for a parent
//! process to read, exports them into the environment for spawned workers,
//! and runs until interrupted.

use anyhow::Result;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zproc_core::config::ProtocolConfig;
use zproc_core::{Server, ServerOptions};

#[derive(Parser, Debug)]
#[command(name = "zproc-server")]
#[command(about = "ZProc shared state server")]
struct Args {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the request/reply channel (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Port for the change-event channel (0 = auto-assign)
    #[arg(long, default_value = "0")]
    events_port: u16,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting ZProc state server");

    let mut handle = Server::start(
        ServerOptions::new()
            .host(args.host)
            .server_port(args.port)
            .events_port(args.events_port)
            .export_env(true),
    )
    .await?;

    let endpoints = handle.endpoints();

    // Printed for a parent process to read (intentional stdout handshake).
    println!(
        "{}={}",
        ProtocolConfig::SERVER_ADDR_ENV,
        endpoints.server_addr
    );
    println!(
        "{}={}",
        ProtocolConfig::EVENTS_ADDR_ENV,
        endpoints.events_addr
    );

    info!(
        "state server running on {} (events on {})",
        endpoints.server_addr, endpoints.events_addr
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown();

    Ok(())
}
