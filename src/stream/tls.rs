//! Secure transport over a `rustls` server session.
//!
//! The record layer is opaque to the protocol engine: handshake progress
//! surfaces through [`Transport::handshake`] as a pre-request sub-state and
//! everything after it is plaintext `read`/`write` with the same
//! `WouldBlock` discipline as the plain transport. Certificate and key
//! handling stay with the host, which hands over a ready
//! `Arc<rustls::ServerConfig>`.

use crate::stream::{PlainStream, Transport};
use rustls::{ServerConfig, ServerConnection};
use std::io;
use std::io::ErrorKind::{UnexpectedEof, WouldBlock};
use std::io::{Read, Write};
use std::os::fd::RawFd;
use std::sync::Arc;

pub struct TlsStream {
    inner: PlainStream,
    tls: ServerConnection,
}

impl TlsStream {
    pub fn new(inner: PlainStream, config: Arc<ServerConfig>) -> io::Result<TlsStream> {
        let tls = ServerConnection::new(config).map_err(io::Error::other)?;
        Ok(Self { inner, tls })
    }

    /// Moves records in both directions without blocking: pending ciphertext
    /// out first, then whatever the socket has to offer in.
    fn complete_io(&mut self) -> io::Result<()> {
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.inner) {
                Ok(0) => break,
                Ok(_) => {}
                Err(err) if err.kind() == WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        if self.tls.wants_read() {
            match self.tls.read_tls(&mut self.inner) {
                Ok(0) => return Err(io::Error::from(UnexpectedEof)),
                Ok(_) => {
                    self.tls
                        .process_new_packets()
                        .map_err(io::Error::other)?;
                }
                Err(err) if err.kind() == WouldBlock => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}

impl Read for TlsStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.complete_io()?;
        self.tls.reader().read(buf)
    }
}

impl Write for TlsStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.tls.writer().write(buf)?;
        self.complete_io()?;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.complete_io()?;
        self.tls.writer().flush()
    }
}

impl Transport for TlsStream {
    fn handshake(&mut self) -> io::Result<bool> {
        self.complete_io()?;
        Ok(!self.tls.is_handshaking())
    }

    fn shutdown(&mut self) {
        self.tls.send_close_notify();
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.inner) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
        self.inner.shutdown();
    }

    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}
