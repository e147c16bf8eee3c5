use http::StatusCode;
use std::io;
use thiserror::Error;

/// Crate-level error. Errors are returned, never thrown across the embedding
/// boundary; the daemon maps protocol faults to wire responses where the
/// response phase has not begun yet.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Parse(#[from] ParseError),
    #[error("connection memory pool exhausted")]
    PoolExhausted,
    #[error("header name or value contains CR, LF or NUL")]
    InvalidHeader,
    #[error("a response is already queued on this connection")]
    ResponseAlreadyQueued,
    #[error("a handler is already registered for prefix `{0}`")]
    DuplicateHandler(String),
    #[error("no handler registered for prefix `{0}`")]
    HandlerNotFound(String),
    #[error("operation is only valid in external event-loop mode")]
    WrongMode,
    #[error("at least one address family must be enabled")]
    NoAddressFamily,
    #[error("content reader returned no data on a live stream")]
    ReaderContract,
    #[error("content reader signalled stream failure")]
    ReaderError,
    #[error("handler aborted the request")]
    HandlerAborted,
    #[error("handler completed without queuing a response")]
    NoResponse,
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}

/// Request parsing fault. Each kind maps to the status code used for the
/// best-effort error response.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("request target too long")]
    UriTooLong,
    #[error("unsupported HTTP version")]
    BadVersion,
    #[error("malformed header line")]
    BadHeader,
    #[error("header block too large")]
    HeadersTooLarge,
    #[error("invalid Content-Length value")]
    BadContentLength,
    #[error("conflicting Content-Length values")]
    ConflictingContentLength,
    #[error("transfer encoding not supported")]
    UnsupportedTransferEncoding,
    #[error("malformed chunked framing")]
    BadChunk,
    #[error("request body too large")]
    BodyTooLarge,
    #[error("request exceeds the connection memory pool")]
    OutOfMemory,
}

impl ParseError {
    pub const fn status(self) -> StatusCode {
        match self {
            ParseError::BadRequestLine
            | ParseError::BadVersion
            | ParseError::BadHeader
            | ParseError::HeadersTooLarge
            | ParseError::BadContentLength
            | ParseError::ConflictingContentLength
            | ParseError::BadChunk => StatusCode::BAD_REQUEST,
            ParseError::UriTooLong => StatusCode::URI_TOO_LONG,
            ParseError::UnsupportedTransferEncoding => StatusCode::NOT_IMPLEMENTED,
            ParseError::BodyTooLarge | ParseError::OutOfMemory => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }
}
