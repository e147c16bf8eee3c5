//! Byte transports the protocol engine runs on.
//!
//! A connection talks to its peer through a [`Transport`]: a non-blocking
//! byte stream with an optional handshake sub-state in front of it. The
//! engine never learns whether the bytes cross a bare socket or a secure
//! record layer; it only sees `read`/`write` with `WouldBlock` semantics and
//! a handshake that must report complete before any HTTP byte is parsed.

#[cfg(feature = "tls")]
pub mod tls;

use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

/// Object-safe byte transport.
///
/// `read`/`write` must never block: they return `WouldBlock` when the socket
/// has nothing to offer. [`Transport::handshake`] is polled before any
/// application byte flows and keeps returning `Ok(false)` until the
/// transport-level handshake is done (plain TCP has none).
pub trait Transport: Read + Write + Send {
    /// Drives the transport handshake one non-blocking step. `Ok(true)` once
    /// application data can flow.
    fn handshake(&mut self) -> io::Result<bool>;

    /// Best-effort orderly shutdown. Errors are ignored; the socket is being
    /// abandoned either way.
    fn shutdown(&mut self);

    fn as_raw_fd(&self) -> RawFd;
}

/// Plain TCP transport.
pub struct PlainStream {
    inner: TcpStream,
}

impl PlainStream {
    /// Takes ownership of an accepted socket and switches it to the
    /// non-blocking, no-delay configuration the engine expects.
    pub fn new(stream: TcpStream) -> io::Result<PlainStream> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(Self { inner: stream })
    }
}

impl Read for PlainStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for PlainStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Transport for PlainStream {
    fn handshake(&mut self) -> io::Result<bool> {
        Ok(true)
    }

    fn shutdown(&mut self) {
        let _ = self.inner.shutdown(Shutdown::Both);
    }

    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
