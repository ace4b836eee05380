//! Gzip stream codec adapters.
//!
//! Thin wrappers binding a raw byte stream to on-the-fly compression. The
//! decoder keeps its own small input buffer, distinct from the OS socket
//! buffer, so "no bytes ready on the socket" and "no bytes decodable yet"
//! are separate conditions; the server loop relies on `WouldBlock`
//! surfacing through `read` to tell them apart from end-of-stream.

use flate2::bufread::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{self, BufReader, Read, Write};

/// Decompress-while-reading side of the codec.
///
/// `buf_capacity` bounds the internal input buffer; the harness uses a tiny
/// capacity on purpose to exercise partial-read paths in the decompressor.
pub struct DecodingReader<R: Read> {
    inner: GzDecoder<BufReader<R>>,
}

impl<R: Read> DecodingReader<R> {
    pub fn new(stream: R, buf_capacity: usize) -> Self {
        DecodingReader {
            inner: GzDecoder::new(BufReader::with_capacity(buf_capacity, stream)),
        }
    }

    /// Access the underlying stream, e.g. to deregister it from a poller.
    pub fn get_mut(&mut self) -> &mut R {
        self.inner.get_mut().get_mut()
    }
}

impl<R: Read> Read for DecodingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Compress-while-writing side of the codec.
///
/// `sync_flush` emits a mid-stream boundary marker; `finish` writes the
/// end-of-stream marker and hands the underlying stream back. Dropping the
/// writer without `finish` still releases the stream, so every exit path
/// closes the descriptor.
pub struct EncodingWriter<W: Write> {
    inner: GzEncoder<W>,
}

impl<W: Write> EncodingWriter<W> {
    pub fn new(stream: W) -> Self {
        EncodingWriter {
            inner: GzEncoder::new(stream, Compression::default()),
        }
    }

    /// Write one whole message into the compressed stream.
    pub fn write_message(&mut self, msg: &[u8]) -> io::Result<()> {
        self.inner.write_all(msg)
    }

    /// Sync flush: force buffered compressed output out without terminating
    /// the stream, so the peer can observe a message boundary promptly.
    pub fn sync_flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Terminal flush: finalize the compressed stream and return the
    /// underlying stream.
    pub fn finish(self) -> io::Result<W> {
        self.inner.finish()
    }
}
