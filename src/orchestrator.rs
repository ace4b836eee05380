//! Self-test mode: run both roles in one invocation.
//!
//! The sender runs as an independent child process of the same executable;
//! the parent runs the server loop. The listener is bound before the child
//! is spawned so the child's connect cannot race the server socket. After
//! the loop stops, the parent sleeps a grace period and then polls the
//! child's exit status without blocking; the combined exit code is the
//! bitwise OR of the two statuses.

use crate::config::{Config, STOP_SENTINEL};
use crate::error::{OrchestrationError, SetupError};
use crate::server::EchoServer;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use tracing::{error, info};

/// Run the self-test and return the process exit code.
pub fn run(config: &Config) -> u8 {
    let host = match &config.host {
        Some(host) => host.as_str(),
        // Mode selection guarantees a host in self-test mode.
        None => {
            error!("self-test mode requires a server host");
            return 1;
        }
    };

    let mut server = match EchoServer::bind(
        &config.port,
        config.timing.clone(),
        Some(STOP_SENTINEL.to_vec()),
    ) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Server setup failed");
            return 1;
        }
    };

    let child = match spawn_client(config, host) {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, "Client spawn failed");
            return 1;
        }
    };
    info!(pid = child.id(), "Client child spawned");

    server.run();
    // The loop only returns after a clean stop; the server's contribution
    // to the combined status is 0.
    let server_status = 0u8;

    thread::sleep(config.timing.grace);
    match join_client(child) {
        Ok(client_status) => server_status | client_status,
        Err(e) => {
            error!(error = %e, "Client join failed");
            1
        }
    }
}

/// Spawn this executable again in client mode.
fn spawn_client(config: &Config, host: &str) -> Result<Child, SetupError> {
    let exe = std::env::current_exe().map_err(SetupError::Spawn)?;
    Command::new(exe)
        .arg("--log-level")
        .arg(&config.log_level)
        .arg(&config.port)
        .arg(host)
        .args(&config.tokens)
        .spawn()
        .map_err(SetupError::Spawn)
}

/// Non-blocking poll for the child's exit status. A child that has not
/// exited by now, or a wait failure, is a fatal orchestration error.
fn join_client(mut child: Child) -> Result<u8, OrchestrationError> {
    match child.try_wait() {
        Ok(Some(status)) => {
            info!(status = %status, "Client child exited");
            Ok(status_code(status))
        }
        Ok(None) => Err(OrchestrationError::ChildStillRunning),
        Err(e) => Err(OrchestrationError::Wait(e)),
    }
}

/// Map an exit status to a code; a signal-killed child counts as failure.
fn status_code(status: ExitStatus) -> u8 {
    match status.code() {
        Some(code) => u8::try_from(code).unwrap_or(1),
        None => 1,
    }
}
