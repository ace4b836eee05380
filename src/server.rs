//! Single-connection echo server: listener, acceptor, and reader loop.
//!
//! The loop is a strict two-state alternation. In LISTENING the readiness
//! multiplexer watches the listening socket; in CONNECTED it watches the one
//! active connection. Exactly one of the two descriptors is registered at
//! any time, never both and never neither.
//!
//! Readiness-based model: poll tells us when the watched socket is ready,
//! then we perform non-blocking accept/read syscalls. Poll is edge-triggered,
//! so the reader drains the decoder until it reports `WouldBlock`; a drained
//! socket is never confused with end-of-stream, which arrives as a zero-byte
//! decode-read.

use crate::codec::DecodingReader;
use crate::config::{resolve_service, Timing, GZ_BUF_SIZE, LISTEN_BACKLOG, READ_BUF_SIZE};
use crate::error::SetupError;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::fmt::Write as _;
use std::io::{self, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::thread;
use tracing::{debug, error, info, trace, warn};

const LISTENER: Token = Token(0);
const CONNECTION: Token = Token(1);

/// Why a chunk accumulation stopped.
enum Fill {
    /// The read buffer is full; more decoded bytes may be pending.
    Full,
    /// The socket stalled (would-block); the chunk is complete for now.
    Stalled,
    /// End-of-stream or a stream error.
    Ended,
}

/// What draining the active connection concluded.
enum ReadOutcome {
    /// More data may arrive later; keep the connection registered.
    Keep,
    /// End-of-stream or a stream error; tear down and return to LISTENING.
    Closed,
    /// The stop sentinel arrived; tear down and exit the loop.
    Stop,
}

/// The at-most-one active connection and its decoding codec.
struct ActiveConnection {
    decoder: DecodingReader<TcpStream>,
    peer: SocketAddr,
}

/// Server instance: bound listener plus the reader state machine.
pub struct EchoServer {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    local_addr: SocketAddr,
    conn: Option<ActiveConnection>,
    timing: Timing,
    /// Optional stop predicate input: a payload exactly matching this
    /// sentinel (with or without trailing NUL) ends the loop.
    stop_sentinel: Option<Vec<u8>>,
    /// Consecutive readiness waits that timed out, for liveness logging.
    idle_ticks: u32,
}

impl EchoServer {
    /// Resolve the service, then bind and listen on the first address
    /// candidate that accepts both, and register it with the multiplexer.
    pub fn bind(
        service: &str,
        timing: Timing,
        stop_sentinel: Option<Vec<u8>>,
    ) -> Result<Self, SetupError> {
        let port = resolve_service(service)?;

        let candidates = ("0.0.0.0", port)
            .to_socket_addrs()
            .map_err(|e| SetupError::Resolve {
                host: "0.0.0.0".to_string(),
                service: service.to_string(),
                source: e,
            })?;

        let mut bound = None;
        for addr in candidates {
            match bind_listener(addr) {
                Ok(listener) => {
                    bound = Some(listener);
                    break;
                }
                Err(e) => debug!(addr = %addr, error = %e, "Bind candidate failed"),
            }
        }
        let std_listener = bound.ok_or_else(|| SetupError::BindExhausted {
            service: service.to_string(),
        })?;
        let local_addr = std_listener.local_addr().map_err(SetupError::Mux)?;

        let poll = Poll::new().map_err(SetupError::Mux)?;
        let mut listener = TcpListener::from_std(std_listener);
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(SetupError::Mux)?;

        info!(addr = %local_addr, "Server listening");

        Ok(EchoServer {
            poll,
            events: Events::with_capacity(8),
            listener,
            local_addr,
            conn: None,
            timing,
            stop_sentinel,
            idle_ticks: 0,
        })
    }

    /// Actual bound address, useful when the service resolved to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept/read loop until the stop sentinel arrives.
    ///
    /// Multiplexer errors are never fatal: the loop consumes the timeout to
    /// preserve its pacing and tries again. Without a stop sentinel the loop
    /// runs until the process exits.
    pub fn run(&mut self) {
        let mut stop = false;
        while !stop {
            match self.poll.poll(&mut self.events, Some(self.timing.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, os_error = e.raw_os_error().unwrap_or(0), "poll failed");
                    thread::sleep(self.timing.poll_timeout);
                    continue;
                }
            }

            if self.events.is_empty() {
                // Timed out with no readiness; count it as a liveness tick.
                self.idle_ticks += 1;
                trace!(idle_ticks = self.idle_ticks, "readiness wait timed out");
                continue;
            }
            self.idle_ticks = 0;

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                match token {
                    LISTENER if self.conn.is_none() => self.accept_one(),
                    CONNECTION if self.conn.is_some() => match self.drain_connection() {
                        ReadOutcome::Keep => {}
                        ReadOutcome::Closed => self.teardown(),
                        ReadOutcome::Stop => {
                            self.teardown();
                            stop = true;
                        }
                    },
                    // Stale event for a descriptor we no longer watch.
                    _ => {}
                }
            }
        }
        info!("Server loop stopped");
    }

    /// Accept one connection and swap the multiplexer's interest from the
    /// listener to it. Any sub-step failure discards partial state and
    /// stays in LISTENING.
    fn accept_one(&mut self) {
        let (mut stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            // Spurious wakeup; nothing actually pending.
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!(error = %e, os_error = e.raw_os_error().unwrap_or(0), "accept failed");
                return;
            }
        };
        info!(peer = %peer, "Accepted connection");

        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            error!(error = %e, "deregister listener failed");
            return;
        }
        if let Err(e) = self
            .poll
            .registry()
            .register(&mut stream, CONNECTION, Interest::READABLE)
        {
            error!(error = %e, "register connection failed");
            self.watch_listener();
            return;
        }

        self.conn = Some(ActiveConnection {
            decoder: DecodingReader::new(stream, GZ_BUF_SIZE),
            peer,
        });
    }

    /// Decode-read until the socket is drained.
    ///
    /// A chunk accumulates decoded bytes until the buffer fills, the stream
    /// ends, or the socket stalls; the decoder can hand back partial output
    /// well below the buffer size because its own input buffer is tiny, and
    /// a flushed message must not be observed in fragments. Each chunk is
    /// logged with non-printable bytes hex-escaped, then checked against
    /// the stop sentinel.
    fn drain_connection(&mut self) -> ReadOutcome {
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return ReadOutcome::Keep,
        };

        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let mut filled = 0;
            let fill = loop {
                if filled == buf.len() {
                    break Fill::Full;
                }
                match conn.decoder.read(&mut buf[filled..]) {
                    Ok(0) => {
                        debug!(peer = %conn.peer, "end of stream");
                        break Fill::Ended;
                    }
                    Ok(n) => filled += n,
                    // The decoder has no decodable bytes yet; this is not
                    // a close, just a drained socket.
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Fill::Stalled,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(
                            peer = %conn.peer,
                            kind = ?e.kind(),
                            os_error = e.raw_os_error().unwrap_or(0),
                            error = %e,
                            "decode read failed"
                        );
                        break Fill::Ended;
                    }
                }
            };

            if filled > 0 {
                info!(
                    peer = %conn.peer,
                    len = filled,
                    payload = %render_bytes(&buf[..filled]),
                    "Received message"
                );
                if let Some(sentinel) = &self.stop_sentinel {
                    if is_stop_message(&buf[..filled], sentinel) {
                        info!("Stop sentinel received");
                        return ReadOutcome::Stop;
                    }
                }
            }

            match fill {
                Fill::Full => continue,
                Fill::Stalled => return ReadOutcome::Keep,
                Fill::Ended => return ReadOutcome::Closed,
            }
        }
    }

    /// Release the active connection and its codec, then watch the listener
    /// again. Runs on every exit path from CONNECTED.
    fn teardown(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if let Err(e) = self.poll.registry().deregister(conn.decoder.get_mut()) {
                warn!(error = %e, "deregister connection failed");
            }
            debug!(peer = %conn.peer, "Connection closed");
        }
        self.watch_listener();
    }

    fn watch_listener(&mut self) {
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut self.listener, LISTENER, Interest::READABLE)
        {
            error!(error = %e, "re-register listener failed");
        }
    }
}

/// Bind and listen, non-blocking, with address reuse for quick restarts.
fn bind_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Exact match against the sentinel, with or without the trailing NUL the
/// client appends to every message.
fn is_stop_message(payload: &[u8], sentinel: &[u8]) -> bool {
    payload == sentinel
        || (payload.len() == sentinel.len() + 1
            && &payload[..sentinel.len()] == sentinel
            && payload[sentinel.len()] == 0)
}

/// Render payload bytes for logging: printable ASCII verbatim, everything
/// else hex-escaped so log assertions see exact bytes.
fn render_bytes(payload: &[u8]) -> String {
    let mut out = String::with_capacity(payload.len());
    for &b in payload {
        if (0x20..0x7f).contains(&b) {
            out.push(b as char);
        } else {
            let _ = write!(out, "<0x{b:02x}>");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client;
    use crate::codec::EncodingWriter;
    use crate::config::STOP_SENTINEL;
    use std::net::TcpStream as StdTcpStream;
    use std::time::Duration;

    fn short_timing() -> Timing {
        Timing {
            poll_timeout: Duration::from_millis(50),
            delay: Duration::from_millis(100),
            grace: Duration::from_millis(100),
        }
    }

    fn start_server() -> (SocketAddr, thread::JoinHandle<()>) {
        let mut server =
            EchoServer::bind("0", short_timing(), Some(STOP_SENTINEL.to_vec())).unwrap();
        let port = server.local_addr().port();
        let handle = thread::spawn(move || server.run());
        (SocketAddr::from(([127, 0, 0, 1], port)), handle)
    }

    fn connect(addr: SocketAddr) -> EncodingWriter<StdTcpStream> {
        EncodingWriter::new(StdTcpStream::connect(addr).unwrap())
    }

    #[test]
    fn test_stop_sentinel_terminates_loop() {
        let (addr, handle) = start_server();

        let mut writer = connect(addr);
        writer.write_message(b"hello\0").unwrap();
        writer.sync_flush().unwrap();
        // Pace the messages so each is observed as its own read; the framing
        // convention is flush boundaries, not a length prefix.
        thread::sleep(Duration::from_millis(100));
        writer.write_message(b"-stopserver-\0").unwrap();
        writer.sync_flush().unwrap();
        let _ = writer.finish();

        handle.join().unwrap();
    }

    #[test]
    fn test_eof_returns_to_listening_then_second_client_served() {
        let (addr, handle) = start_server();

        // First client sends a message and closes cleanly.
        let mut first = connect(addr);
        first.write_message(b"first\0").unwrap();
        first.sync_flush().unwrap();
        drop(first.finish().unwrap());

        // The server must be back in LISTENING to take the second client.
        thread::sleep(Duration::from_millis(200));
        let mut second = connect(addr);
        second.write_message(b"-stopserver-\0").unwrap();
        second.sync_flush().unwrap();
        let _ = second.finish();

        handle.join().unwrap();
    }

    #[test]
    fn test_stalled_client_is_not_torn_down() {
        let (addr, handle) = start_server();

        let mut writer = connect(addr);
        writer.write_message(b"before-stall\0").unwrap();
        writer.sync_flush().unwrap();

        // Several poll timeouts elapse with the connection silent. A timeout
        // must never be treated as a close, so the sentinel sent afterwards
        // still reaches the reader over the same connection.
        thread::sleep(Duration::from_millis(300));
        assert!(!handle.is_finished());

        writer.write_message(b"-stopserver-\0").unwrap();
        writer.sync_flush().unwrap();
        let _ = writer.finish();

        handle.join().unwrap();
    }

    #[test]
    fn test_second_connection_waits_for_first_teardown() {
        let (addr, handle) = start_server();

        let mut first = connect(addr);
        first.write_message(b"from-first\0").unwrap();
        first.sync_flush().unwrap();

        // Second client connects while the first is active and immediately
        // sends the sentinel; it sits in the backlog until the first closes.
        let mut second = connect(addr);
        second.write_message(b"-stopserver-\0").unwrap();
        second.sync_flush().unwrap();
        let second_stream = second.finish().unwrap();

        // The loop must still be running: the sentinel from the second
        // client cannot have been read yet.
        thread::sleep(Duration::from_millis(200));
        assert!(!handle.is_finished());

        drop(first.finish().unwrap());
        handle.join().unwrap();
        drop(second_stream);
    }

    #[test]
    fn test_client_send_tokens_drives_server_to_stop() {
        let (addr, handle) = start_server();

        let stream = StdTcpStream::connect(addr).unwrap();
        let tokens = vec![
            "msg1".to_string(),
            "--delay".to_string(),
            "-stopserver-".to_string(),
        ];
        client::send_tokens(stream, &tokens, &short_timing()).unwrap();

        handle.join().unwrap();
    }

    #[test]
    fn test_is_stop_message_exact_length() {
        let sentinel = b"-stopserver-";
        assert!(is_stop_message(b"-stopserver-", sentinel));
        assert!(is_stop_message(b"-stopserver-\0", sentinel));
        assert!(!is_stop_message(b"-stopserver", sentinel));
        assert!(!is_stop_message(b"-stopserver-x", sentinel));
        assert!(!is_stop_message(b"-stopserver-\0x", sentinel));
        assert!(!is_stop_message(b"", sentinel));
    }

    #[test]
    fn test_render_bytes_escapes_non_printable() {
        assert_eq!(render_bytes(b"abc"), "abc");
        assert_eq!(render_bytes(b"a\0b"), "a<0x00>b");
        assert_eq!(render_bytes(b"\x01\xff"), "<0x01><0xff>");
        assert_eq!(render_bytes(b"ok\n"), "ok<0x0a>");
    }
}
