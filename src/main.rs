//! framed-echo: a length-prefixed TCP echo server and client
//!
//! - `framed-echo serve` runs the single-threaded event loop until Ctrl-C
//! - `framed-echo send <payload>` sends one frame and prints the reply
//!
//! Server configuration via CLI arguments or TOML file.

use clap::Parser;
use framed_echo::client;
use framed_echo::config::{CliArgs, Command, Config, SendArgs, ServeArgs};
use framed_echo::runtime;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    match cli.command {
        Command::Serve(ref args) => serve(args, &cli.log_level),
        Command::Send(ref args) => send(args, &cli.log_level),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Run the echo server
fn serve(args: &ServeArgs, log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load(args, log_level)?;

    // Initialize logging
    init_logging(&config.log_level);

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        max_frame_size = config.max_frame_size,
        max_queued_bytes = config.max_queued_bytes,
        idle_timeout = ?config.idle_timeout,
        "Starting framed-echo server"
    );

    runtime::run(&config)?;
    Ok(())
}

/// Send one payload and print the reply
fn send(args: &SendArgs, log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(log_level);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let reply = rt.block_on(client::send(
        &args.connect,
        args.payload.as_bytes(),
        args.max_frame_size,
        Duration::from_millis(args.timeout_ms),
    ))?;

    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}
