//! gzecho: a compressed-stream echo/test harness
//!
//! One binary, three modes:
//! - Server: accept one TCP connection at a time and decompress-while-read
//!   framed messages, stopping on the `-stopserver-` sentinel
//! - Client: compress-while-write discrete messages with a sync flush after
//!   each, honoring `--delay` tokens between them
//! - Self-test: spawn the client as a child process, run the server, and
//!   combine both exit statuses

mod client;
mod codec;
mod config;
mod error;
mod orchestrator;
mod server;

use clap::error::ErrorKind;
use clap::Parser;
use config::{CliArgs, Config, Mode, STOP_SENTINEL};
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = match CliArgs::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        // Bad arguments are a setup failure: diagnostic plus exit 1.
        Err(e) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(message) => {
            eprintln!("gzecho: {message}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let code = match config.mode() {
        Mode::Server => run_server(&config),
        Mode::Client { host } => run_client(&config, host),
        Mode::SelfTest { .. } => orchestrator::run(&config),
    };
    ExitCode::from(code)
}

/// Server only: exit 0 on normal loop completion, 1 on setup failure.
fn run_server(config: &Config) -> u8 {
    match server::EchoServer::bind(
        &config.port,
        config.timing.clone(),
        Some(STOP_SENTINEL.to_vec()),
    ) {
        Ok(mut server) => {
            server.run();
            0
        }
        Err(e) => {
            error!(error = %e, "Server setup failed");
            1
        }
    }
}

/// Client only: exit 0 iff every send and its paired flush succeeded.
fn run_client(config: &Config, host: &str) -> u8 {
    let stream = match client::connect(&config.port, host) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "Client setup failed");
            return 1;
        }
    };

    match client::send_tokens(stream, &config.tokens, &config.timing) {
        Ok(()) => 0,
        Err(e) => {
            error!(op = %e.op, error = %e, "Client send failed");
            1
        }
    }
}
