//! Sender: compress-while-writing client.
//!
//! Connects to the server, wraps the stream in an encoding codec, and sends
//! each message token followed by a sync flush so the receiver observes it
//! as a discrete read despite the codec's internal buffering. A terminal
//! flush ends the stream after the last token.

use crate::codec::EncodingWriter;
use crate::config::{resolve_service, Timing, DELAY_TOKEN, MSG_CAPACITY};
use crate::error::{SetupError, StreamError, StreamOp};
use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use tracing::{debug, error, info, warn};

/// Connect to the first address candidate that accepts, in resolution order.
pub fn connect(service: &str, host: &str) -> Result<TcpStream, SetupError> {
    let port = resolve_service(service)?;

    let candidates = (host, port)
        .to_socket_addrs()
        .map_err(|e| SetupError::Resolve {
            host: host.to_string(),
            service: service.to_string(),
            source: e,
        })?;

    for addr in candidates {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                info!(addr = %addr, "Connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(addr = %addr, error = %e, "Connect candidate failed")
            }
        }
    }

    Err(SetupError::ConnectExhausted {
        host: host.to_string(),
        service: service.to_string(),
    })
}

/// Send the token sequence over an encoding codec wrapped around `sink`.
///
/// `--delay` tokens pause for `timing.delay` and write nothing. Each message
/// is its bytes plus a NUL terminator; a message that would exceed the
/// per-message capacity is skipped with a warning. Any skipped or failed
/// message flips the sticky result to failure, but processing always
/// continues through the remaining tokens so a single bad token cannot hide
/// later problems. The terminal flush and close run on every path.
pub fn send_tokens<W: Write>(
    sink: W,
    tokens: &[String],
    timing: &Timing,
) -> Result<(), StreamError> {
    let mut writer = EncodingWriter::new(sink);
    let mut first_failure: Option<StreamError> = None;

    for token in tokens {
        if token == DELAY_TOKEN {
            debug!(delay = ?timing.delay, "Delay token");
            thread::sleep(timing.delay);
            continue;
        }

        // Message bytes plus the NUL terminator the receiver expects.
        let len = token.len() + 1;
        if len > MSG_CAPACITY {
            warn!(len, capacity = MSG_CAPACITY, "Message exceeds capacity, skipped");
            note_failure(
                &mut first_failure,
                StreamError::new(
                    StreamOp::Oversize,
                    io::Error::new(io::ErrorKind::InvalidInput, "message exceeds capacity"),
                ),
            );
            continue;
        }
        let mut msg = Vec::with_capacity(len);
        msg.extend_from_slice(token.as_bytes());
        msg.push(0);

        if let Err(e) = writer.write_message(&msg) {
            error!(len, os_error = e.raw_os_error().unwrap_or(0), error = %e, "write failed");
            note_failure(&mut first_failure, StreamError::new(StreamOp::Write, e));
            continue;
        }
        if let Err(e) = writer.sync_flush() {
            error!(len, os_error = e.raw_os_error().unwrap_or(0), error = %e, "sync flush failed");
            note_failure(&mut first_failure, StreamError::new(StreamOp::SyncFlush, e));
            continue;
        }
        debug!(len, "Sent message");
    }

    // Terminal flush; the stream is dropped (closed) here on every path.
    if let Err(e) = writer.finish() {
        error!(os_error = e.raw_os_error().unwrap_or(0), error = %e, "terminal flush failed");
        note_failure(&mut first_failure, StreamError::new(StreamOp::Finish, e));
    }

    match first_failure {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Sticky failure: remember the first error, keep processing.
fn note_failure(slot: &mut Option<StreamError>, err: StreamError) {
    if slot.is_none() {
        *slot = Some(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DecodingReader;
    use std::io::Read;
    use std::time::{Duration, Instant};

    fn test_timing() -> Timing {
        Timing {
            poll_timeout: Duration::from_millis(50),
            delay: Duration::from_millis(100),
            grace: Duration::from_millis(100),
        }
    }

    fn decode(bytes: &[u8]) -> Vec<u8> {
        let mut decoder = DecodingReader::new(bytes, 16);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_messages_are_nul_terminated_and_ordered() {
        let mut sink = Vec::new();
        let tokens = vec!["msg1".to_string(), "msg2".to_string()];
        send_tokens(&mut sink, &tokens, &test_timing()).unwrap();
        assert_eq!(decode(&sink), b"msg1\0msg2\0");
    }

    #[test]
    fn test_oversize_message_skipped_but_rest_sent() {
        let mut sink = Vec::new();
        let tokens = vec!["x".repeat(MSG_CAPACITY), "ok".to_string()];
        let err = send_tokens(&mut sink, &tokens, &test_timing()).unwrap_err();
        assert_eq!(err.op, StreamOp::Oversize);
        assert_eq!(err.source.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(decode(&sink), b"ok\0");
    }

    #[test]
    fn test_message_at_capacity_is_sent() {
        // Capacity includes the NUL terminator.
        let mut sink = Vec::new();
        let tokens = vec!["y".repeat(MSG_CAPACITY - 1)];
        send_tokens(&mut sink, &tokens, &test_timing()).unwrap();
        assert_eq!(decode(&sink).len(), MSG_CAPACITY);
    }

    #[test]
    fn test_delay_token_pauses_and_sends_nothing() {
        let mut sink = Vec::new();
        let tokens = vec![DELAY_TOKEN.to_string()];
        let start = Instant::now();
        send_tokens(&mut sink, &tokens, &test_timing()).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(decode(&sink), b"");
    }

    #[test]
    fn test_write_failure_is_sticky_but_non_fatal() {
        /// Sink that fails every write after the first `good` bytes.
        struct FailingSink {
            written: usize,
            good: usize,
        }
        impl Write for FailingSink {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                if self.written >= self.good {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"));
                }
                self.written += buf.len();
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = FailingSink {
            written: 0,
            good: 10,
        };
        let tokens = vec!["first".to_string(), "second".to_string()];
        let err = send_tokens(sink, &tokens, &test_timing()).unwrap_err();
        assert_eq!(err.source.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_connect_exhausted() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        match connect(&port.to_string(), "127.0.0.1") {
            Err(SetupError::ConnectExhausted { host, .. }) => assert_eq!(host, "127.0.0.1"),
            other => panic!("expected ConnectExhausted, got {other:?}"),
        }
    }

    #[test]
    fn test_resolve_failure() {
        match connect("4444", "no-such-host.invalid") {
            Err(SetupError::Resolve { host, .. }) => assert_eq!(host, "no-such-host.invalid"),
            other => panic!("expected Resolve error, got {other:?}"),
        }
    }
}
