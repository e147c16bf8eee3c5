use std::io;
use std::io::ErrorKind::{Interrupted, WouldBlock};

/// Outcome of a single non-blocking read or write attempt.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum IoStatus {
    /// The operation transferred `n > 0` bytes.
    Ready(usize),
    /// The socket had no capacity; try again on the next readiness event.
    NoProgress,
    /// The peer performed an orderly shutdown.
    Eof,
}

/// Normalizes `io::Result<usize>` from a non-blocking socket into [`IoStatus`].
///
/// `WouldBlock` is not an error on this code path and interrupted calls are
/// expected to be retried by the caller's outer loop, so both collapse into
/// [`IoStatus::NoProgress`]. A zero-byte read means the peer is gone.
pub(crate) trait Classify {
    fn classify_read(self) -> io::Result<IoStatus>;

    fn classify_write(self) -> io::Result<IoStatus>;
}

impl Classify for io::Result<usize> {
    fn classify_read(self) -> io::Result<IoStatus> {
        match self {
            Ok(0) => Ok(IoStatus::Eof),
            Ok(n) => Ok(IoStatus::Ready(n)),
            Err(err) if err.kind() == WouldBlock => Ok(IoStatus::NoProgress),
            Err(err) if err.kind() == Interrupted => Ok(IoStatus::NoProgress),
            Err(err) => Err(err),
        }
    }

    fn classify_write(self) -> io::Result<IoStatus> {
        match self {
            // a zero-byte write says nothing about the peer
            Ok(0) => Ok(IoStatus::NoProgress),
            Ok(n) => Ok(IoStatus::Ready(n)),
            Err(err) if err.kind() == WouldBlock => Ok(IoStatus::NoProgress),
            Err(err) if err.kind() == Interrupted => Ok(IoStatus::NoProgress),
            Err(err) => Err(err),
        }
    }
}
