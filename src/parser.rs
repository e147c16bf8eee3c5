//! Incremental HTTP/1.1 request parser.
//!
//! The parser consumes bytes from the connection's read window and yields one
//! [`ParseEvent`] at a time, returning [`ParseEvent::NeedMore`] whenever the
//! window runs dry mid-element. It never blocks and never looks at the
//! transport; feeding the window is the connection's job. Parsed text is
//! copied into owned strings whose size is debited from the connection pool,
//! so request size stays bounded by the pool capacity.

use crate::arena::MemoryPool;
use crate::buffer::ByteWindow;
use crate::error::ParseError;
use crate::headers::{HeaderMap, ValueKind};
use http::{Method, Version};
use httparse::Status;
use memchr::memchr;

/// Longest accepted request target.
pub(crate) const MAX_URL_BYTES: usize = 8 * 1024;
/// Longest accepted header block (header lines and trailers, CRLFs included).
pub(crate) const MAX_HEADER_BLOCK_BYTES: usize = 32 * 1024;
/// Request-line slack on top of the target cap for method and version tokens.
const MAX_REQUEST_LINE_BYTES: usize = MAX_URL_BYTES + 72;
/// Longest accepted chunk-size line including extensions.
const MAX_CHUNK_HEAD_BYTES: usize = 1024;

/// One step of parser progress.
///
/// After `BodyChunk(n)` the caller owns the next `n` bytes of the read window
/// and must consume exactly that many before asking for the next event.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ParseEvent {
    NeedMore,
    HeadersReady,
    BodyChunk(usize),
    BodyDone,
}

/// Request line, split and decoded.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub version: Version,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ParseState {
    RequestLine,
    Headers,
    ChunkHead,
    ChunkData,
    ChunkDataEnd,
    Trailers,
    FixedBody,
    Done,
}

#[derive(Debug)]
pub(crate) struct RequestParser {
    state: ParseState,
    head: Option<RequestHead>,
    head_bytes: usize,
    body_remaining: u64,
}

impl RequestParser {
    pub(crate) fn new() -> RequestParser {
        Self {
            state: ParseState::RequestLine,
            head: None,
            head_bytes: 0,
            body_remaining: 0,
        }
    }

    /// Prepares the parser for the next request on a keep-alive connection.
    pub(crate) fn reset(&mut self) {
        self.state = ParseState::RequestLine;
        self.head = None;
        self.head_bytes = 0;
        self.body_remaining = 0;
    }

    /// Hands the parsed request line to the caller after `HeadersReady`.
    pub(crate) fn take_head(&mut self) -> RequestHead {
        self.head.take().expect("request head already taken")
    }

    /// True while no byte of the next request has been interpreted yet.
    pub(crate) const fn is_idle(&self) -> bool {
        matches!(self.state, ParseState::RequestLine) && self.head.is_none()
    }

    /// True until the current request's body has been fully framed.
    pub(crate) const fn is_body_pending(&self) -> bool {
        !matches!(self.state, ParseState::Done)
    }

    /// Error to report when the read window filled up without the current
    /// element completing.
    pub(crate) const fn overflow_error(&self) -> ParseError {
        match self.state {
            ParseState::RequestLine => ParseError::UriTooLong,
            ParseState::ChunkHead | ParseState::ChunkData | ParseState::ChunkDataEnd => {
                ParseError::BadChunk
            }
            _ => ParseError::HeadersTooLarge,
        }
    }

    /// Advances the machine by at most one event.
    pub(crate) fn next_event(
        &mut self,
        pool: &mut MemoryPool,
        rx: &mut ByteWindow,
        attrs: &mut HeaderMap,
    ) -> Result<ParseEvent, ParseError> {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some(line) = take_line(pool, rx) else {
                        if rx.available() > MAX_REQUEST_LINE_BYTES {
                            return Err(ParseError::UriTooLong);
                        }
                        return Ok(ParseEvent::NeedMore);
                    };
                    let line = line?;
                    if line.is_empty() {
                        // tolerate stray CRLFs between pipelined requests
                        continue;
                    }
                    self.head = Some(parse_request_line(pool, &line)?);
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some(line) = take_line(pool, rx) else {
                        self.check_head_cap(rx.available())?;
                        return Ok(ParseEvent::NeedMore);
                    };
                    let line = line?;
                    if line.is_empty() {
                        self.finish_head(pool, attrs)?;
                        return Ok(ParseEvent::HeadersReady);
                    }
                    self.account_head_line(line.len())?;
                    append_header_line(pool, attrs, &line)?;
                }
                ParseState::ChunkHead => {
                    match httparse::parse_chunk_size(rx.view(pool)) {
                        Ok(Status::Complete((consumed, size))) => {
                            rx.consume(consumed);
                            if size == 0 {
                                self.state = ParseState::Trailers;
                            } else {
                                self.body_remaining = size;
                                self.state = ParseState::ChunkData;
                            }
                        }
                        Ok(Status::Partial) => {
                            if rx.available() > MAX_CHUNK_HEAD_BYTES {
                                return Err(ParseError::BadChunk);
                            }
                            return Ok(ParseEvent::NeedMore);
                        }
                        Err(_) => return Err(ParseError::BadChunk),
                    }
                }
                ParseState::ChunkData => {
                    let n = (rx.available() as u64).min(self.body_remaining) as usize;
                    if n == 0 {
                        return Ok(ParseEvent::NeedMore);
                    }
                    self.body_remaining -= n as u64;
                    if self.body_remaining == 0 {
                        self.state = ParseState::ChunkDataEnd;
                    }
                    return Ok(ParseEvent::BodyChunk(n));
                }
                ParseState::ChunkDataEnd => {
                    let view = rx.view(pool);
                    if view.len() < 2 {
                        return Ok(ParseEvent::NeedMore);
                    }
                    if &view[..2] != b"\r\n" {
                        return Err(ParseError::BadChunk);
                    }
                    rx.consume(2);
                    self.state = ParseState::ChunkHead;
                }
                ParseState::Trailers => {
                    let Some(line) = take_line(pool, rx) else {
                        self.check_head_cap(rx.available())?;
                        return Ok(ParseEvent::NeedMore);
                    };
                    let line = line?;
                    if line.is_empty() {
                        self.state = ParseState::Done;
                        return Ok(ParseEvent::BodyDone);
                    }
                    self.account_head_line(line.len())?;
                    append_header_line(pool, attrs, &line)?;
                }
                ParseState::FixedBody => {
                    if self.body_remaining == 0 {
                        self.state = ParseState::Done;
                        return Ok(ParseEvent::BodyDone);
                    }
                    let n = (rx.available() as u64).min(self.body_remaining) as usize;
                    if n == 0 {
                        return Ok(ParseEvent::NeedMore);
                    }
                    self.body_remaining -= n as u64;
                    return Ok(ParseEvent::BodyChunk(n));
                }
                ParseState::Done => return Ok(ParseEvent::BodyDone),
            }
        }
    }

    fn account_head_line(&mut self, line_len: usize) -> Result<(), ParseError> {
        self.head_bytes += line_len + 2;
        if self.head_bytes > MAX_HEADER_BLOCK_BYTES {
            return Err(ParseError::HeadersTooLarge);
        }
        Ok(())
    }

    /// Rejects a header block early when the unterminated line in the window
    /// already guarantees the cap will be exceeded.
    fn check_head_cap(&self, pending: usize) -> Result<(), ParseError> {
        if self.head_bytes + pending > MAX_HEADER_BLOCK_BYTES {
            return Err(ParseError::HeadersTooLarge);
        }
        Ok(())
    }

    /// Runs once the blank line arrives: decides body framing and decodes the
    /// query string and cookies into the value set.
    fn finish_head(&mut self, pool: &mut MemoryPool, attrs: &mut HeaderMap) -> Result<(), ParseError> {
        match decide_framing(attrs)? {
            Framing::Chunked => self.state = ParseState::ChunkHead,
            Framing::Fixed(n) => {
                self.body_remaining = n;
                self.state = ParseState::FixedBody;
            }
            Framing::None => self.state = ParseState::Done,
        }

        let head = self.head.as_ref().expect("head parsed before blank line");
        if let Some(query) = head.query.clone() {
            decode_query(pool, attrs, &query)?;
        }
        decode_cookies(pool, attrs)?;
        Ok(())
    }
}

enum Framing {
    None,
    Fixed(u64),
    Chunked,
}

/// Takes the next CRLF-terminated line out of the window. Returns `None`
/// while incomplete. Retained text is debited from the pool by the caller;
/// the line itself is transient.
fn take_line(pool: &MemoryPool, rx: &mut ByteWindow) -> Option<Result<String, ParseError>> {
    let view = rx.view(pool);
    let nl = memchr(b'\n', view)?;
    let mut end = nl;
    if end > 0 && view[end - 1] == b'\r' {
        end -= 1;
    }
    let line = std::str::from_utf8(&view[..end]).map(str::to_owned);
    rx.consume(nl + 1);
    Some(line.map_err(|_| ParseError::BadHeader))
}

fn parse_request_line(pool: &mut MemoryPool, line: &str) -> Result<RequestHead, ParseError> {
    let mut tokens = line.split(' ').filter(|t| !t.is_empty());
    let (Some(method), Some(target), Some(version), None) =
        (tokens.next(), tokens.next(), tokens.next(), tokens.next())
    else {
        return Err(ParseError::BadRequestLine);
    };

    let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::BadRequestLine)?;
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        _ => return Err(ParseError::BadVersion),
    };
    if target.len() > MAX_URL_BYTES {
        return Err(ParseError::UriTooLong);
    }

    let (raw_path, query) = match target.split_once('?') {
        Some((path, query)) => (path, Some(query.to_owned())),
        None => (target, None),
    };
    let path = percent_decode_path(raw_path).ok_or(ParseError::BadRequestLine)?;

    let charge = path.len() + query.as_ref().map_or(0, String::len);
    if pool.alloc_high(charge).is_none() {
        return Err(ParseError::OutOfMemory);
    }

    Ok(RequestHead {
        method,
        path,
        query,
        version,
    })
}

fn append_header_line(
    pool: &mut MemoryPool,
    attrs: &mut HeaderMap,
    line: &str,
) -> Result<(), ParseError> {
    if line.starts_with(' ') || line.starts_with('\t') {
        // obsolete folding: the line continues the previous header value
        let folded = line.trim_start_matches([' ', '\t']);
        if pool.alloc_high(folded.len() + 1).is_none() {
            return Err(ParseError::OutOfMemory);
        }
        return attrs.fold_last(folded).map_err(|_| ParseError::BadHeader);
    }

    let (name, value) = line.split_once(':').ok_or(ParseError::BadHeader)?;
    if name.is_empty() || name.ends_with(' ') || name.ends_with('\t') {
        return Err(ParseError::BadHeader);
    }
    let value = value.trim_matches([' ', '\t']);
    if pool.alloc_high(name.len() + value.len()).is_none() {
        return Err(ParseError::OutOfMemory);
    }
    attrs
        .append(ValueKind::Header, name, value)
        .map_err(|_| ParseError::BadHeader)
}

/// Body framing priority: chunked transfer coding, then Content-Length, then
/// no body at all.
fn decide_framing(attrs: &HeaderMap) -> Result<Framing, ParseError> {
    let mut last_coding: Option<String> = None;
    for value in attrs.all(ValueKind::Header, "transfer-encoding") {
        for token in value.split(',') {
            let token = token.trim_matches([' ', '\t']);
            if !token.is_empty() {
                last_coding = Some(token.to_ascii_lowercase());
            }
        }
    }
    if let Some(coding) = last_coding {
        return if coding == "chunked" {
            Ok(Framing::Chunked)
        } else {
            Err(ParseError::UnsupportedTransferEncoding)
        };
    }

    let mut length: Option<u64> = None;
    for value in attrs.all(ValueKind::Header, "content-length") {
        let value = value.trim_matches([' ', '\t']);
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::BadContentLength);
        }
        let parsed: u64 = value.parse().map_err(|_| ParseError::BadContentLength)?;
        match length {
            Some(seen) if seen != parsed => return Err(ParseError::ConflictingContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(match length {
        Some(0) | None => Framing::None,
        Some(n) => Framing::Fixed(n),
    })
}

/// Percent-decodes a request path. The `+` form rule does not apply here.
fn percent_decode_path(raw: &str) -> Option<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_digit(*bytes.get(i + 1)?)?;
                let lo = hex_digit(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    if out.contains(&0) {
        return None;
    }
    String::from_utf8(out).ok()
}

const fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn decode_query(
    pool: &mut MemoryPool,
    attrs: &mut HeaderMap,
    query: &str,
) -> Result<(), ParseError> {
    for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if pool.alloc_high(name.len() + value.len()).is_none() {
            return Err(ParseError::OutOfMemory);
        }
        attrs
            .append(ValueKind::GetArgument, &name, &value)
            .map_err(|_| ParseError::BadRequestLine)?;
    }
    Ok(())
}

fn decode_cookies(pool: &mut MemoryPool, attrs: &mut HeaderMap) -> Result<(), ParseError> {
    let mut pairs = Vec::new();
    for value in attrs.all(ValueKind::Header, "cookie") {
        for pair in value.split(';') {
            let Some((name, value)) = pair.split_once('=') else {
                continue;
            };
            let name = name.trim_matches([' ', '\t']);
            let value = value.trim_matches([' ', '\t']).trim_matches('"');
            if !name.is_empty() {
                pairs.push((name.to_owned(), value.to_owned()));
            }
        }
    }
    for (name, value) in pairs {
        if pool.alloc_high(name.len() + value.len()).is_none() {
            return Err(ParseError::OutOfMemory);
        }
        attrs
            .append(ValueKind::Cookie, &name, &value)
            .map_err(|_| ParseError::BadHeader)?;
    }
    Ok(())
}
