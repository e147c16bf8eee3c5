//! Reusable, shareable response objects.
//!
//! A [`Response`] carries headers and a body source but no status code; the
//! status is supplied when the response is queued on a session. Wrapped in an
//! [`std::sync::Arc`], one response can be queued on any number of
//! connections at once — the strong count is the reference count and stays
//! atomic under every threading mode. Bodies are treated as immutable once
//! queued; this is a documented contract, not enforced by copying.

use crate::error::Error;
use crate::headers::{HeaderMap, ValueKind};
use std::borrow::Cow;
use std::fmt::{Debug, Formatter};

/// Outcome of one [`ContentReader::read`] call.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ReaderStatus {
    /// `n` bytes were written to the front of the buffer. `n` must be greater
    /// than zero; a zero count on a live stream is a contract violation that
    /// terminates the connection it was read for.
    Data(usize),
    /// The body is complete. For chunked transmission this emits the
    /// terminating zero-length chunk.
    End,
    /// The body cannot be produced; the connection is closed mid-stream so
    /// the peer never mistakes the truncation for success.
    Error,
}

/// Pull-style body source. `pos` is the total number of bytes this particular
/// queuing has already produced, so stateless readers can serve many
/// connections from one instance. Dropping the reader is the place to release
/// whatever resources back it.
pub trait ContentReader: Send + Sync {
    fn read(&self, pos: u64, buf: &mut [u8]) -> ReaderStatus;
}

impl<F> ContentReader for F
where
    F: Fn(u64, &mut [u8]) -> ReaderStatus + Send + Sync,
{
    fn read(&self, pos: u64, buf: &mut [u8]) -> ReaderStatus {
        self(pos, buf)
    }
}

enum Body {
    Empty,
    Bytes(Cow<'static, [u8]>),
    Reader(Box<dyn ContentReader>),
}

/// Response body plus headers, with a declared size or `None` for unknown
/// (unknown-size bodies go out chunked to HTTP/1.1 peers and close-delimited
/// to HTTP/1.0 peers).
pub struct Response {
    size: Option<u64>,
    body: Body,
    headers: HeaderMap,
}

impl Response {
    /// Response with no body at all (204, 304, error pages without text).
    pub fn empty() -> Response {
        Self {
            size: Some(0),
            body: Body::Empty,
            headers: HeaderMap::new(),
        }
    }

    /// Takes ownership of `data`; the buffer is released when the last
    /// reference to the response drops.
    pub fn from_buffer(data: Vec<u8>) -> Response {
        Self {
            size: Some(data.len() as u64),
            body: Body::Bytes(Cow::Owned(data)),
            headers: HeaderMap::new(),
        }
    }

    /// Copies `data` at creation time, so the caller's buffer can be reused
    /// or freed immediately.
    pub fn from_copy(data: &[u8]) -> Response {
        Self::from_buffer(data.to_vec())
    }

    /// Borrows a `'static` buffer without copying or freeing.
    pub fn from_static(data: &'static [u8]) -> Response {
        Self {
            size: Some(data.len() as u64),
            body: Body::Bytes(Cow::Borrowed(data)),
            headers: HeaderMap::new(),
        }
    }

    /// Body produced by `reader`, `size` bytes long or unknown when `None`.
    pub fn from_reader<R>(size: Option<u64>, reader: R) -> Response
    where
        R: ContentReader + 'static,
    {
        Self {
            size,
            body: Body::Reader(Box::new(reader)),
            headers: HeaderMap::new(),
        }
    }

    /// Adds a header to be emitted with this response. Rejects names/values
    /// containing CR, LF or NUL.
    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), Error> {
        self.headers.append(ValueKind::ResponseHeader, name, value)
    }

    /// Removes every header stored under `name`, case-insensitively.
    pub fn del_header(&mut self, name: &str) -> bool {
        self.headers.remove(name)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Declared body size; `None` means unknown.
    pub const fn size(&self) -> Option<u64> {
        self.size
    }

    /// Pulls body bytes starting at `pos` for one particular queuing.
    pub(crate) fn read_body(&self, pos: u64, buf: &mut [u8]) -> ReaderStatus {
        match &self.body {
            Body::Empty => ReaderStatus::End,
            Body::Bytes(bytes) => {
                if pos >= bytes.len() as u64 {
                    return ReaderStatus::End;
                }
                let at = pos as usize;
                let n = buf.len().min(bytes.len() - at);
                buf[..n].copy_from_slice(&bytes[at..at + n]);
                ReaderStatus::Data(n)
            }
            Body::Reader(reader) => reader.read(pos, buf),
        }
    }
}

impl Debug for Response {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            Body::Empty => "empty",
            Body::Bytes(_) => "bytes",
            Body::Reader(_) => "reader",
        };
        f.debug_struct("Response")
            .field("size", &self.size)
            .field("body", &body)
            .field("headers", &self.headers.len())
            .finish()
    }
}
