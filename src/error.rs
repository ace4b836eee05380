//! Error taxonomy for the harness.
//!
//! Errors are grouped by how the process reacts to them:
//! - `SetupError`: fatal, the process exits nonzero.
//! - `StreamError`: recovered; the server tears down the active connection,
//!   the client records a sticky failure and keeps draining its tokens.
//! - `OrchestrationError`: fatal to the self-test orchestrator.
//!
//! Transient socket errors (a failed accept, one failed connect candidate)
//! are logged and retried inline rather than modeled as types.

use std::fmt;
use std::io;
use thiserror::Error;

/// Fatal startup failures: resolution, bind/listen, connect exhaustion,
/// child spawn.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Service name is neither a port number nor in the services database.
    #[error("unknown service {name:?}")]
    Service { name: String },

    #[error("could not resolve {host}:{service}: {source}")]
    Resolve {
        host: String,
        service: String,
        source: io::Error,
    },

    /// Every resolved address candidate failed to bind or listen.
    #[error("could not bind/listen for service {service:?}")]
    BindExhausted { service: String },

    /// Every resolved address candidate refused the connection.
    #[error("could not connect to {host}:{service}")]
    ConnectExhausted { host: String, service: String },

    #[error("could not spawn client child process: {0}")]
    Spawn(#[source] io::Error),

    #[error("readiness multiplexer setup failed: {0}")]
    Mux(#[source] io::Error),
}

/// The codec operation a `StreamError` is tagged with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOp {
    Write,
    SyncFlush,
    Finish,
    /// Message rejected before any write because it exceeds the per-message
    /// capacity.
    Oversize,
}

impl fmt::Display for StreamOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamOp::Write => "write",
            StreamOp::SyncFlush => "sync-flush",
            StreamOp::Finish => "finish",
            StreamOp::Oversize => "oversize",
        };
        f.write_str(name)
    }
}

/// A codec or transport failure, tagged with the operation that failed so
/// callers and tests can match on the kind rather than on message text.
#[derive(Debug, Error)]
#[error("{op} failed: {source}")]
pub struct StreamError {
    pub op: StreamOp,
    #[source]
    pub source: io::Error,
}

impl StreamError {
    pub fn new(op: StreamOp, source: io::Error) -> Self {
        StreamError { op, source }
    }
}

/// Fatal failures while joining the spawned client child.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("client child still running after the grace period")]
    ChildStillRunning,

    #[error("wait for client child failed: {0}")]
    Wait(#[source] io::Error),
}
