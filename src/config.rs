//! Configuration module for the echo harness.
//!
//! Everything comes from the command line; there are no config files and no
//! program-specific environment variables. The positional shape mirrors the
//! three run modes:
//!
//! ```text
//! gzecho <port|service>                          # server
//! gzecho <port|service> <host> [msg|--delay]...  # client
//! gzecho <port|service> --client-fork <host> [msg|--delay]...  # self-test
//! ```

use crate::error::SetupError;
use clap::Parser;
use std::time::Duration;

/// Server-side decode-read buffer size.
pub const READ_BUF_SIZE: usize = 128;

/// Decoder internal buffer capacity. Deliberately tiny so that partial reads
/// and would-block paths inside the decompressor are actually exercised.
pub const GZ_BUF_SIZE: usize = 16;

/// Client per-message capacity, including the NUL terminator. Longer
/// messages are skipped rather than sent.
pub const MSG_CAPACITY: usize = 128;

/// Listen backlog for the server socket.
pub const LISTEN_BACKLOG: i32 = 10;

/// Message that makes the server loop exit cleanly. Matched exactly, with
/// or without its trailing NUL terminator.
pub const STOP_SENTINEL: &[u8] = b"-stopserver-";

/// Client token that produces a pause instead of a message.
pub const DELAY_TOKEN: &str = "--delay";

/// Command-line arguments for the harness
#[derive(Parser, Debug)]
#[command(name = "gzecho")]
#[command(about = "A compressed-stream echo/test harness", long_about = None)]
pub struct CliArgs {
    /// Port number or service name to listen on / connect to
    pub port: String,

    /// Server hostname; presence selects client mode
    pub host: Option<String>,

    /// Messages to send, or --delay tokens between them
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub tokens: Vec<String>,

    /// Run the server and spawn the client as a child process
    #[arg(long)]
    pub client_fork: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Loop pacing knobs, passed explicitly so tests can inject short values.
#[derive(Debug, Clone)]
pub struct Timing {
    /// Readiness-wait bound for each server loop iteration.
    pub poll_timeout: Duration,
    /// Pause produced by the client's `--delay` token.
    pub delay: Duration,
    /// How long the orchestrator waits for the child after the server loop
    /// ends, before the non-blocking status poll.
    pub grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            poll_timeout: Duration::from_secs(1),
            delay: Duration::from_secs(1),
            grace: Duration::from_secs(3),
        }
    }
}

/// Which role this invocation plays.
#[derive(Debug, PartialEq, Eq)]
pub enum Mode<'a> {
    Server,
    Client { host: &'a str },
    SelfTest { host: &'a str },
}

/// Final resolved configuration
#[derive(Debug)]
pub struct Config {
    pub port: String,
    pub host: Option<String>,
    pub tokens: Vec<String>,
    pub client_fork: bool,
    pub log_level: String,
    pub timing: Timing,
}

impl Config {
    /// Validate parsed arguments into a runnable configuration.
    pub fn from_cli(cli: CliArgs) -> Result<Self, String> {
        if cli.client_fork && cli.host.is_none() {
            return Err("--client-fork requires a server host".to_string());
        }

        Ok(Config {
            port: cli.port,
            host: cli.host,
            tokens: cli.tokens,
            client_fork: cli.client_fork,
            log_level: cli.log_level,
            timing: Timing::default(),
        })
    }

    pub fn mode(&self) -> Mode<'_> {
        match (&self.host, self.client_fork) {
            (None, _) => Mode::Server,
            (Some(host), false) => Mode::Client { host },
            (Some(host), true) => Mode::SelfTest { host },
        }
    }
}

/// Resolve a port number or service name to a port.
///
/// Numeric strings are taken as-is; anything else is looked up in the
/// services database (std address resolution only accepts numeric ports).
pub fn resolve_service(name: &str) -> Result<u16, SetupError> {
    if let Ok(port) = name.parse::<u16>() {
        return Ok(port);
    }

    let c_name = std::ffi::CString::new(name).map_err(|_| SetupError::Service {
        name: name.to_string(),
    })?;
    let entry = unsafe { libc::getservbyname(c_name.as_ptr(), c"tcp".as_ptr()) };
    if entry.is_null() {
        return Err(SetupError::Service {
            name: name.to_string(),
        });
    }

    // s_port is in network byte order.
    let raw = unsafe { (*entry).s_port };
    Ok(u16::from_be(raw as u16))
}
