//! Per-connection protocol engine.
//!
//! One [`Connection`] owns a transport, a memory pool and the request parser,
//! and drives them through a non-blocking state machine. [`Connection::advance`]
//! makes as much progress as the socket allows and returns the moment it
//! would block, so any number of connections can share one sweep loop.
//! Handlers observe a request through a [`Session`] and answer by queuing a
//! [`Response`]; upload bodies are delivered to the same handler in repeated
//! invocations with a per-connection context surviving across them.

use crate::arena::{MemoryPool, PoolMark};
use crate::buffer::{ByteWindow, FillOutcome};
use crate::daemon::HandlerTable;
use crate::error::{Error, ParseError};
use crate::headers::{HeaderMap, KindMask, ValueKind};
use crate::parser::{ParseEvent, RequestParser};
use crate::response::{ReaderStatus, Response};
use crate::stream::Transport;
use crate::util::IoStatus;
use http::{Method, StatusCode, Version};
use log::{debug, trace};
use std::any::Any;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, PoisonError};

/// Default per-connection pool capacity.
pub const DEFAULT_POOL_SIZE: usize = 32 * 1024;

/// Read window: large enough for a maximum-length request line.
const RX_WINDOW_BYTES: usize = 8 * 1024 + 256;
const TX_WINDOW_BYTES: usize = 8 * 1024;
/// Upper bound on one body pull from a response source.
const BODY_READ_CHUNK: usize = 4 * 1024;
/// Worst-case chunked framing overhead per emitted chunk.
const CHUNK_OVERHEAD: usize = 16;

/// Where in the request lifecycle a handler invocation happens.
pub enum RequestPhase<'a> {
    /// Request line and headers are parsed; no upload bytes yet.
    Headers,
    /// One chunk of the upload body, in arrival order.
    Body(&'a [u8]),
    /// The body is fully delivered. A response must be queued no later than
    /// the return from this call.
    Complete,
}

/// Handler verdict: keep the request going or tear the connection down.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HandlerResult {
    Continue,
    Abort,
}

/// User-supplied request handler.
///
/// Invoked at least twice per request: once at [`RequestPhase::Headers`] and
/// once at [`RequestPhase::Complete`], with one [`RequestPhase::Body`] call
/// per upload chunk in between. After [`Session::queue_response`] succeeds no
/// further invocations happen for that request.
pub trait AccessHandler: Send + Sync {
    fn access(&self, session: &mut Session<'_>, phase: RequestPhase<'_>) -> HandlerResult;
}

impl<F> AccessHandler for F
where
    F: Fn(&mut Session<'_>, RequestPhase<'_>) -> HandlerResult + Send + Sync,
{
    fn access(&self, session: &mut Session<'_>, phase: RequestPhase<'_>) -> HandlerResult {
        self(session, phase)
    }
}

/// Why a request (or the connection carrying it) ended.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Termination {
    /// The response was transmitted in full.
    Completed,
    /// Protocol fault, handler abort or body-stream failure.
    WithError,
    /// The idle timeout expired.
    TimedOut,
    /// The peer went away mid-request.
    ClientAbort,
    /// The daemon was stopped while the request was in flight.
    DaemonShutdown,
}

pub(crate) type Notifier = Arc<dyn Fn(&SocketAddr, Termination) + Send + Sync>;

/// Response armed on a connection, with the per-queuing read position.
pub(crate) struct PendingResponse {
    status: StatusCode,
    response: Arc<Response>,
    pos: u64,
}

/// A request as seen by its handler. `Session` borrows the connection for
/// the duration of one handler invocation.
pub struct Session<'c> {
    head: &'c crate::parser::RequestHead,
    attrs: &'c HeaderMap,
    peer: SocketAddr,
    response: &'c mut Option<PendingResponse>,
    context: &'c mut Option<Box<dyn Any + Send>>,
}

impl Session<'_> {
    pub fn method(&self) -> &Method {
        &self.head.method
    }

    /// Percent-decoded request path, query string excluded.
    pub fn url(&self) -> &str {
        &self.head.path
    }

    /// Raw query string, if the request target carried one.
    pub fn query(&self) -> Option<&str> {
        self.head.query.as_deref()
    }

    pub fn version(&self) -> Version {
        self.head.version
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// First value stored under `key` for `kind`. Lookup is
    /// case-insensitive in `key`.
    pub fn value(&self, kind: ValueKind, key: &str) -> Option<&str> {
        self.attrs.first(kind, key)
    }

    /// Visits every stored value selected by `mask` in insertion order,
    /// returning how many were visited.
    pub fn values<F>(&self, mask: KindMask, f: F) -> usize
    where
        F: FnMut(ValueKind, &str, &str),
    {
        self.attrs.for_each(mask, f)
    }

    /// Shorthand for request-header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.attrs.first(ValueKind::Header, name)
    }

    /// Arms `response` with `status`. Fails if a response is already queued;
    /// once armed, the handler is not called again for this request.
    pub fn queue_response(&mut self, status: StatusCode, response: &Arc<Response>) -> Result<(), Error> {
        if self.response.is_some() {
            return Err(Error::ResponseAlreadyQueued);
        }
        *self.response = Some(PendingResponse {
            status,
            response: Arc::clone(response),
            pos: 0,
        });
        Ok(())
    }

    /// Stores handler state that survives every invocation for this request.
    pub fn set_context<T: Any + Send>(&mut self, value: T) {
        *self.context = Some(Box::new(value));
    }

    pub fn context<T: 'static>(&self) -> Option<&T> {
        self.context.as_ref()?.downcast_ref()
    }

    pub fn context_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.context.as_mut()?.downcast_mut()
    }
}

/// Outcome of one [`Connection::advance`] sweep.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Progress {
    /// Internal: more work is possible right now.
    Continue,
    /// Waiting for socket readiness.
    Blocked(Interest),
    /// The connection is gone; drop it.
    Closed,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Interest {
    Read,
    Write,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ConnState {
    Handshake,
    RecvHead,
    RecvBody,
    SendContinue,
    SendHead,
    SendBody,
    SendTrailer,
    Finish,
    Closed,
}

pub(crate) struct Connection {
    transport: Box<dyn Transport>,
    peer: SocketAddr,
    pool: MemoryPool,
    base_mark: PoolMark,
    rx: ByteWindow,
    rx_limit: usize,
    tx: ByteWindow,
    parser: RequestParser,
    attrs: HeaderMap,
    head: Option<crate::parser::RequestHead>,
    response: Option<PendingResponse>,
    context: Option<Box<dyn Any + Send>>,
    handlers: Arc<Mutex<HandlerTable>>,
    current_handler: Option<Arc<dyn AccessHandler>>,
    notifier: Option<Notifier>,
    state: ConnState,
    keepalive: bool,
    suppress_handler: bool,
    needs_continue: bool,
    collect_form: bool,
    form_buf: Vec<u8>,
    body_complete: bool,
    chunked_out: bool,
    body_suppressed: bool,
    trailer_staged: bool,
    response_started: bool,
    pending_termination: Option<Termination>,
    last_activity_ns: u64,
    now_ns: u64,
    debug: bool,
}

impl Connection {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        peer: SocketAddr,
        handlers: Arc<Mutex<HandlerTable>>,
        notifier: Option<Notifier>,
        pool_size: usize,
        secure: bool,
        debug: bool,
        now_ns: u64,
    ) -> Result<Connection, Error> {
        let mut pool = MemoryPool::with_capacity(pool_size);
        let rx_limit = RX_WINDOW_BYTES.min(pool_size / 2);
        let rx = ByteWindow::new(&mut pool, rx_limit).ok_or(Error::PoolExhausted)?;
        let tx_size = TX_WINDOW_BYTES.min(pool.remaining() / 2);
        let tx = ByteWindow::new(&mut pool, tx_size).ok_or(Error::PoolExhausted)?;
        let base_mark = pool.mark();

        Ok(Self {
            transport,
            peer,
            pool,
            base_mark,
            rx,
            rx_limit,
            tx,
            parser: RequestParser::new(),
            attrs: HeaderMap::new(),
            head: None,
            response: None,
            context: None,
            handlers,
            current_handler: None,
            notifier,
            state: if secure { ConnState::Handshake } else { ConnState::RecvHead },
            keepalive: false,
            suppress_handler: false,
            needs_continue: false,
            collect_form: false,
            form_buf: Vec::new(),
            body_complete: false,
            chunked_out: false,
            body_suppressed: false,
            trailer_staged: false,
            response_started: false,
            pending_termination: None,
            last_activity_ns: now_ns,
            now_ns,
            debug,
        })
    }

    /// Drives the state machine until the socket would block or the
    /// connection closes.
    pub(crate) fn advance(&mut self, now_ns: u64) -> Progress {
        self.now_ns = now_ns;
        loop {
            let step = match self.state {
                ConnState::Handshake => self.step_handshake(),
                ConnState::RecvHead | ConnState::RecvBody => self.step_receive(),
                ConnState::SendContinue => self.step_send_continue(),
                ConnState::SendHead => self.step_send_head(),
                ConnState::SendBody => self.step_send_body(),
                ConnState::SendTrailer => self.step_send_trailer(),
                ConnState::Finish => self.step_finish(),
                ConnState::Closed => return Progress::Closed,
            };
            match step {
                Ok(Progress::Continue) => {}
                Ok(progress) => return progress,
                Err(err) => match self.handle_error(err) {
                    Progress::Continue => {}
                    progress => return progress,
                },
            }
        }
    }

    pub(crate) fn last_activity_ns(&self) -> u64 {
        self.last_activity_ns
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    /// Readiness interest for the host's fd sets.
    pub(crate) fn wants(&self) -> (bool, bool) {
        match self.state {
            ConnState::Handshake => (true, true),
            ConnState::RecvHead | ConnState::RecvBody => (true, false),
            ConnState::Closed => (false, false),
            _ => (false, true),
        }
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.transport.as_raw_fd()
    }

    /// Terminates the connection from outside the state machine (idle
    /// timeout, daemon shutdown).
    pub(crate) fn close_for(&mut self, term: Termination) {
        if !self.is_closed() {
            self.notify(term);
            self.close_transport();
        }
    }

    fn touch(&mut self) {
        self.last_activity_ns = self.now_ns;
    }

    fn notify(&self, term: Termination) {
        if let Some(notifier) = &self.notifier {
            notifier(&self.peer, term);
        }
    }

    fn close_transport(&mut self) {
        self.transport.shutdown();
        self.state = ConnState::Closed;
    }

    fn step_handshake(&mut self) -> Result<Progress, Error> {
        match self.transport.handshake() {
            Ok(true) => {
                self.touch();
                self.state = ConnState::RecvHead;
                Ok(Progress::Continue)
            }
            Ok(false) => Ok(Progress::Blocked(Interest::Read)),
            Err(err) => Err(err.into()),
        }
    }

    fn step_receive(&mut self) -> Result<Progress, Error> {
        loop {
            match self.parser.next_event(&mut self.pool, &mut self.rx, &mut self.attrs)? {
                ParseEvent::NeedMore => break,
                ParseEvent::HeadersReady => {
                    self.on_headers_ready()?;
                    return Ok(Progress::Continue);
                }
                ParseEvent::BodyChunk(n) => {
                    self.deliver_body_chunk(n)?;
                    if self.response.is_some() {
                        // unread upload bytes make the connection unreusable
                        self.keepalive = false;
                        self.begin_response()?;
                        return Ok(Progress::Continue);
                    }
                }
                ParseEvent::BodyDone => {
                    self.on_body_done()?;
                    return Ok(Progress::Continue);
                }
            }
        }

        match self.rx.fill_from(&mut self.pool, &mut *self.transport, self.rx_limit)? {
            FillOutcome::Read(_) => {
                self.touch();
                Ok(Progress::Continue)
            }
            FillOutcome::NoProgress => Ok(Progress::Blocked(Interest::Read)),
            FillOutcome::Full => Err(self.parser.overflow_error().into()),
            FillOutcome::Eof => {
                if self.parser.is_idle() && self.rx.is_empty() {
                    // orderly close between requests
                    self.close_transport();
                    Ok(Progress::Closed)
                } else {
                    self.pending_termination = Some(Termination::ClientAbort);
                    Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
                }
            }
        }
    }

    fn on_headers_ready(&mut self) -> Result<(), Error> {
        let head = self.parser.take_head();
        if self.debug {
            trace!("{} {} {:?} from {}", head.method, head.path, head.version, self.peer);
        }

        self.keepalive = derive_keepalive(head.version, &self.attrs);
        self.needs_continue = head.version == Version::HTTP_11
            && self
                .attrs
                .all(ValueKind::Header, "expect")
                .any(|v| v.eq_ignore_ascii_case("100-continue"));
        self.collect_form = (head.method == Method::POST || head.method == Method::PUT)
            && self
                .attrs
                .first(ValueKind::Header, "content-type")
                .and_then(|ct| ct.split(';').next())
                .is_some_and(|ct| {
                    ct.trim_matches([' ', '\t'])
                        .eq_ignore_ascii_case("application/x-www-form-urlencoded")
                });

        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(&head.path);
        self.current_handler = Some(handler);
        self.head = Some(head);

        self.invoke_handler(RequestPhase::Headers)?;
        if self.response.is_some() {
            if self.parser.is_body_pending() {
                self.keepalive = false;
            }
            return self.begin_response();
        }

        if self.parser.is_body_pending() && self.needs_continue {
            // interim response goes out before the first body byte is read
            let staged = self.tx.extend(&mut self.pool, b"HTTP/1.1 100 Continue\r\n\r\n");
            debug_assert_eq!(25, staged);
            self.state = ConnState::SendContinue;
        } else {
            self.state = ConnState::RecvBody;
        }
        Ok(())
    }

    fn deliver_body_chunk(&mut self, n: usize) -> Result<(), Error> {
        if self.collect_form && self.pool.alloc_high(n).is_none() {
            return Err(ParseError::OutOfMemory.into());
        }
        let chunk = &self.rx.view(&self.pool)[..n];
        if self.collect_form {
            self.form_buf.extend_from_slice(chunk);
        }
        if !self.suppress_handler {
            let handler = self.current_handler.clone().expect("handler resolved");
            let mut session = Session {
                head: self.head.as_ref().expect("request head parsed"),
                attrs: &self.attrs,
                peer: self.peer,
                response: &mut self.response,
                context: &mut self.context,
            };
            match handler.access(&mut session, RequestPhase::Body(chunk)) {
                HandlerResult::Continue => {}
                HandlerResult::Abort => return Err(Error::HandlerAborted),
            }
            if self.response.is_some() {
                self.suppress_handler = true;
            }
        }
        self.rx.consume(n);
        Ok(())
    }

    fn on_body_done(&mut self) -> Result<(), Error> {
        self.body_complete = true;
        if self.collect_form {
            self.decode_form()?;
        }
        self.invoke_handler(RequestPhase::Complete)?;
        if self.response.is_none() {
            return Err(Error::NoResponse);
        }
        self.begin_response()
    }

    fn invoke_handler(&mut self, phase: RequestPhase<'_>) -> Result<(), Error> {
        if self.suppress_handler {
            return Ok(());
        }
        let handler = self.current_handler.clone().expect("handler resolved");
        let mut session = Session {
            head: self.head.as_ref().expect("request head parsed"),
            attrs: &self.attrs,
            peer: self.peer,
            response: &mut self.response,
            context: &mut self.context,
        };
        match handler.access(&mut session, phase) {
            HandlerResult::Continue => {
                if self.response.is_some() {
                    self.suppress_handler = true;
                }
                Ok(())
            }
            HandlerResult::Abort => Err(Error::HandlerAborted),
        }
    }

    fn decode_form(&mut self) -> Result<(), Error> {
        if self.form_buf.is_empty() {
            return Ok(());
        }
        let buf = std::mem::take(&mut self.form_buf);
        for (name, value) in url::form_urlencoded::parse(&buf) {
            if self.pool.alloc_high(name.len() + value.len()).is_none() {
                return Err(ParseError::OutOfMemory.into());
            }
            self.attrs
                .append(ValueKind::PostData, &name, &value)
                .map_err(|_| Error::from(ParseError::BadHeader))?;
        }
        Ok(())
    }

    /// Serializes the status line and headers into the write window and moves
    /// the machine to the send phase.
    fn begin_response(&mut self) -> Result<(), Error> {
        self.response_started = true;
        self.suppress_handler = true;

        let pending = self.response.as_ref().expect("response queued");
        // the response side may override keep-alive
        for value in pending.response.headers().all(ValueKind::ResponseHeader, "connection") {
            for token in value.split(',') {
                match token.trim_matches([' ', '\t']) {
                    t if t.eq_ignore_ascii_case("close") => self.keepalive = false,
                    t if t.eq_ignore_ascii_case("keep-alive") => self.keepalive = true,
                    _ => {}
                }
            }
        }
        if !self.body_complete && self.parser.is_body_pending() {
            self.keepalive = false;
        }

        let version = self.head.as_ref().map_or(Version::HTTP_11, |h| h.version);
        let is_head = self.head.as_ref().is_some_and(|h| h.method == Method::HEAD);
        let status = pending.status;
        let bodyless_status = status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED;
        self.body_suppressed = is_head || bodyless_status;

        if pending.response.size().is_none() {
            if version == Version::HTTP_11 {
                self.chunked_out = true;
            } else {
                // no chunked framing before HTTP/1.1; the close delimits
                self.keepalive = false;
            }
        }

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(if version == Version::HTTP_10 {
            b"HTTP/1.0 ".as_slice()
        } else {
            b"HTTP/1.1 ".as_slice()
        });
        let mut digits = itoa::Buffer::new();
        out.extend_from_slice(digits.format(status.as_u16()).as_bytes());
        out.push(b' ');
        out.extend_from_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
        out.extend_from_slice(b"\r\n");

        for (_, name, value) in pending.response.headers().iter() {
            if is_framing_header(name) {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if !bodyless_status {
            if let Some(size) = pending.response.size() {
                out.extend_from_slice(b"Content-Length: ");
                out.extend_from_slice(digits.format(size).as_bytes());
                out.extend_from_slice(b"\r\n");
            } else if self.chunked_out && !self.body_suppressed {
                out.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
            }
        }
        if !self.keepalive {
            out.extend_from_slice(b"Connection: close\r\n");
        } else if version == Version::HTTP_10 {
            out.extend_from_slice(b"Connection: keep-alive\r\n");
        }
        out.extend_from_slice(b"\r\n");

        if self.tx.extend(&mut self.pool, &out) != out.len() {
            return Err(Error::PoolExhausted);
        }
        self.state = ConnState::SendHead;
        Ok(())
    }

    /// Flushes the write window once. `Ok(None)` means it is fully drained.
    fn drain_tx(&mut self) -> Result<Option<Progress>, Error> {
        if self.tx.is_empty() {
            return Ok(None);
        }
        match self.tx.drain_to(&mut self.pool, &mut *self.transport)? {
            IoStatus::Ready(_) => {
                self.touch();
                Ok(if self.tx.is_empty() {
                    None
                } else {
                    Some(Progress::Continue)
                })
            }
            _ => Ok(Some(Progress::Blocked(Interest::Write))),
        }
    }

    fn step_send_continue(&mut self) -> Result<Progress, Error> {
        if let Some(progress) = self.drain_tx()? {
            return Ok(progress);
        }
        self.state = ConnState::RecvBody;
        Ok(Progress::Continue)
    }

    fn step_send_head(&mut self) -> Result<Progress, Error> {
        if let Some(progress) = self.drain_tx()? {
            return Ok(progress);
        }
        self.state = if self.body_suppressed {
            ConnState::Finish
        } else {
            ConnState::SendBody
        };
        Ok(Progress::Continue)
    }

    fn step_send_body(&mut self) -> Result<Progress, Error> {
        self.produce_body()?;
        if self.tx.is_empty() {
            return Ok(Progress::Continue);
        }
        match self.tx.drain_to(&mut self.pool, &mut *self.transport)? {
            IoStatus::Ready(_) => {
                self.touch();
                Ok(Progress::Continue)
            }
            _ => Ok(Progress::Blocked(Interest::Write)),
        }
    }

    /// Tops the write window up from the body source, switching state when
    /// the body ends.
    fn produce_body(&mut self) -> Result<(), Error> {
        let pending = self.response.as_mut().expect("response queued");
        loop {
            if self.state != ConnState::SendBody {
                return Ok(());
            }
            let overhead = if self.chunked_out { CHUNK_OVERHEAD } else { 0 };
            let free = self.tx.free_space();
            if free <= overhead {
                return Ok(());
            }
            let mut limit = (free - overhead).min(BODY_READ_CHUNK);
            if let Some(size) = pending.response.size() {
                let remaining = size - pending.pos;
                if remaining == 0 {
                    self.state = ConnState::Finish;
                    return Ok(());
                }
                limit = limit.min(remaining as usize);
            }

            let mut buf = [0u8; BODY_READ_CHUNK];
            match pending.response.read_body(pending.pos, &mut buf[..limit]) {
                ReaderStatus::Data(n) if n == 0 || n > limit => {
                    return Err(Error::ReaderContract);
                }
                ReaderStatus::Data(n) => {
                    pending.pos += n as u64;
                    if self.chunked_out {
                        let mut chunk_head = String::with_capacity(12);
                        write!(chunk_head, "{n:x}\r\n").expect("chunk head formatting");
                        self.tx.extend(&mut self.pool, chunk_head.as_bytes());
                        self.tx.extend(&mut self.pool, &buf[..n]);
                        self.tx.extend(&mut self.pool, b"\r\n");
                    } else {
                        self.tx.extend(&mut self.pool, &buf[..n]);
                    }
                    if pending.response.size() == Some(pending.pos) {
                        self.state = ConnState::Finish;
                        return Ok(());
                    }
                }
                ReaderStatus::End => {
                    if pending.response.size().is_some_and(|size| pending.pos < size) {
                        // declared length not honored; truncating silently
                        // would hand the peer a short body as success
                        return Err(Error::ReaderError);
                    }
                    self.state = if self.chunked_out {
                        ConnState::SendTrailer
                    } else {
                        ConnState::Finish
                    };
                    return Ok(());
                }
                ReaderStatus::Error => return Err(Error::ReaderError),
            }
        }
    }

    fn step_send_trailer(&mut self) -> Result<Progress, Error> {
        if !self.trailer_staged {
            if self.tx.free_space() < 5 {
                if let Some(progress) = self.drain_tx()? {
                    return Ok(progress);
                }
            }
            let staged = self.tx.extend(&mut self.pool, b"0\r\n\r\n");
            debug_assert_eq!(5, staged);
            self.trailer_staged = true;
        }
        if let Some(progress) = self.drain_tx()? {
            return Ok(progress);
        }
        self.state = ConnState::Finish;
        Ok(Progress::Continue)
    }

    fn step_finish(&mut self) -> Result<Progress, Error> {
        if let Some(progress) = self.drain_tx()? {
            return Ok(progress);
        }
        let term = self.pending_termination.take().unwrap_or(Termination::Completed);
        self.notify(term);
        if self.keepalive && term == Termination::Completed {
            self.reset_for_next_request();
            self.state = ConnState::RecvHead;
            Ok(Progress::Continue)
        } else {
            self.close_transport();
            Ok(Progress::Closed)
        }
    }

    /// Keep-alive turnaround: pipelined bytes stay in the read window, every
    /// per-request allocation goes back to the pool.
    fn reset_for_next_request(&mut self) {
        self.rx.compact(&mut self.pool);
        self.pool.reset_to(self.base_mark);
        self.tx.clear();
        self.parser.reset();
        self.attrs.clear();
        self.head = None;
        self.response = None;
        self.context = None;
        self.current_handler = None;
        self.suppress_handler = false;
        self.needs_continue = false;
        self.collect_form = false;
        self.form_buf = Vec::new();
        self.body_complete = false;
        self.chunked_out = false;
        self.body_suppressed = false;
        self.trailer_staged = false;
        self.response_started = false;
        self.pending_termination = None;
    }

    /// Converts an error into either a best-effort error response (when the
    /// status line has not been written yet) or a silent close.
    fn handle_error(&mut self, err: Error) -> Progress {
        if self.debug {
            debug!("connection {} error: {err}", self.peer);
        }
        let status = match &err {
            Error::Parse(parse) => Some(parse.status()),
            Error::PoolExhausted | Error::NoResponse => Some(StatusCode::INTERNAL_SERVER_ERROR),
            _ => None,
        };
        if let (Some(status), false) = (status, self.response_started) {
            if self.pending_termination.is_none() {
                self.pending_termination = Some(Termination::WithError);
            }
            self.suppress_handler = true;
            self.keepalive = false;
            self.response = Some(PendingResponse {
                status,
                response: Arc::new(Response::empty()),
                pos: 0,
            });
            if self.begin_response().is_ok() {
                return Progress::Continue;
            }
        }
        if self.response_started {
            // whatever was already serialized still belongs to the peer;
            // the truncation itself tells it the stream failed
            let _ = self.tx.drain_to(&mut self.pool, &mut *self.transport);
        }
        let term = self.pending_termination.take().unwrap_or(Termination::WithError);
        self.notify(term);
        self.close_transport();
        Progress::Closed
    }
}

fn derive_keepalive(version: Version, attrs: &HeaderMap) -> bool {
    let mut keepalive = version == Version::HTTP_11;
    for value in attrs.all(ValueKind::Header, "connection") {
        for token in value.split(',') {
            match token.trim_matches([' ', '\t']) {
                t if t.eq_ignore_ascii_case("close") => keepalive = false,
                t if t.eq_ignore_ascii_case("keep-alive") => keepalive = true,
                _ => {}
            }
        }
    }
    keepalive
}

/// Framing headers are derived from the body source and keep-alive state;
/// user copies are dropped so the wire never carries conflicting values.
fn is_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::HandlerTable;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ScriptedStream {
        input: Vec<u8>,
        pos: usize,
        eof_when_dry: bool,
        output: Arc<Mutex<Vec<u8>>>,
        shut: Arc<AtomicBool>,
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos < self.input.len() {
                let n = buf.len().min(self.input.len() - self.pos);
                buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
                self.pos += n;
                Ok(n)
            } else if self.eof_when_dry {
                Ok(0)
            } else {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Transport for ScriptedStream {
        fn handshake(&mut self) -> io::Result<bool> {
            Ok(true)
        }

        fn shutdown(&mut self) {
            self.shut.store(true, Ordering::SeqCst);
        }

        fn as_raw_fd(&self) -> RawFd {
            -1
        }
    }

    struct Rig {
        conn: Connection,
        output: Arc<Mutex<Vec<u8>>>,
        shut: Arc<AtomicBool>,
        terminations: Arc<Mutex<Vec<Termination>>>,
    }

    impl Rig {
        fn output(&self) -> String {
            String::from_utf8_lossy(&self.output.lock().unwrap()).into_owned()
        }

        fn terminations(&self) -> Vec<Termination> {
            self.terminations.lock().unwrap().clone()
        }

        fn drive(&mut self) -> Progress {
            self.conn.advance(1)
        }

        fn shut_down(&self) -> bool {
            self.shut.load(Ordering::SeqCst)
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    fn rig_with<H>(input: &[u8], eof_when_dry: bool, pool_size: usize, handler: H) -> Rig
    where
        H: AccessHandler + 'static,
    {
        let output = Arc::new(Mutex::new(Vec::new()));
        let shut = Arc::new(AtomicBool::new(false));
        let terminations = Arc::new(Mutex::new(Vec::new()));
        let stream = ScriptedStream {
            input: input.to_vec(),
            pos: 0,
            eof_when_dry,
            output: Arc::clone(&output),
            shut: Arc::clone(&shut),
        };
        let table = Arc::new(Mutex::new(HandlerTable::new(Arc::new(handler))));
        let sink = Arc::clone(&terminations);
        let notifier: Notifier = Arc::new(move |_peer: &SocketAddr, term: Termination| {
            sink.lock().unwrap().push(term);
        });
        let conn = Connection::new(
            Box::new(stream),
            peer(),
            table,
            Some(notifier),
            pool_size,
            false,
            false,
            0,
        )
        .unwrap();
        Rig {
            conn,
            output,
            shut,
            terminations,
        }
    }

    fn rig<H>(input: &[u8], handler: H) -> Rig
    where
        H: AccessHandler + 'static,
    {
        rig_with(input, false, DEFAULT_POOL_SIZE, handler)
    }

    fn hello_handler() -> impl AccessHandler + 'static {
        |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            if matches!(phase, RequestPhase::Complete) {
                let response = Arc::new(Response::from_copy(b"Hello, world!"));
                session.queue_response(StatusCode::OK, &response).unwrap();
            }
            HandlerResult::Continue
        }
    }

    #[test]
    fn should_serve_simple_get_and_stay_open() {
        let mut rig = rig(b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n", hello_handler());

        assert_eq!(Progress::Blocked(Interest::Read), rig.drive());

        let output = rig.output();
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"), "{output}");
        assert!(output.contains("Content-Length: 13\r\n"));
        assert!(output.ends_with("\r\n\r\nHello, world!"));
        assert!(!rig.shut_down(), "keep-alive connection must stay open");
        assert_eq!(vec![Termination::Completed], rig.terminations());
    }

    #[test]
    fn should_serve_pipelined_requests_in_order() {
        let mut rig = rig(
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n",
            hello_handler(),
        );

        assert_eq!(Progress::Blocked(Interest::Read), rig.drive());

        let output = rig.output();
        assert_eq!(2, output.matches("HTTP/1.1 200 OK\r\n").count(), "{output}");
        assert_eq!(2, output.matches("Hello, world!").count());
        assert!(!rig.shut_down());
        assert_eq!(
            vec![Termination::Completed, Termination::Completed],
            rig.terminations()
        );
    }

    #[test]
    fn should_deliver_chunked_upload_chunks_in_order() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let log = Arc::clone(&seen);
        let handler = move |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            match phase {
                RequestPhase::Headers => log.lock().unwrap().push("headers".into()),
                RequestPhase::Body(chunk) => log
                    .lock()
                    .unwrap()
                    .push(String::from_utf8(chunk.to_vec()).unwrap()),
                RequestPhase::Complete => {
                    log.lock().unwrap().push("done".into());
                    let response = Arc::new(Response::empty());
                    session.queue_response(StatusCode::OK, &response).unwrap();
                }
            }
            HandlerResult::Continue
        };
        let mut rig = rig(
            b"POST /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n",
            handler,
        );

        rig.drive();

        assert_eq!(
            vec!["headers", "Hello", " World", "done"],
            seen.lock().unwrap().iter().map(String::as_str).collect::<Vec<_>>()
        );
        assert!(rig.output().starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn should_send_unknown_size_body_chunked() {
        let handler = |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            if matches!(phase, RequestPhase::Complete) {
                let response = Arc::new(Response::from_reader(None, |pos: u64, buf: &mut [u8]| {
                    if pos == 0 {
                        buf[..4].copy_from_slice(b"abcd");
                        ReaderStatus::Data(4)
                    } else {
                        ReaderStatus::End
                    }
                }));
                session.queue_response(StatusCode::OK, &response).unwrap();
            }
            HandlerResult::Continue
        };
        let mut rig = rig(b"GET /stream HTTP/1.1\r\n\r\n", handler);

        rig.drive();

        let output = rig.output();
        assert!(output.contains("Transfer-Encoding: chunked\r\n"), "{output}");
        assert!(output.ends_with("\r\n\r\n4\r\nabcd\r\n0\r\n\r\n"));
        assert!(!rig.shut_down());
    }

    #[test]
    fn should_close_mid_stream_when_reader_fails() {
        let handler = |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            if matches!(phase, RequestPhase::Complete) {
                let response = Arc::new(Response::from_reader(None, |pos: u64, buf: &mut [u8]| {
                    if pos == 0 {
                        buf[..4].copy_from_slice(b"abcd");
                        ReaderStatus::Data(4)
                    } else {
                        ReaderStatus::Error
                    }
                }));
                session.queue_response(StatusCode::OK, &response).unwrap();
            }
            HandlerResult::Continue
        };
        let mut rig = rig(b"GET /stream HTTP/1.1\r\n\r\n", handler);

        assert_eq!(Progress::Closed, rig.drive());

        let output = rig.output();
        assert!(output.ends_with("4\r\nabcd\r\n"), "{output}");
        assert!(!output.contains("0\r\n\r\n"), "no terminating chunk after failure");
        assert!(rig.shut_down());
        assert_eq!(vec![Termination::WithError], rig.terminations());
    }

    #[test]
    fn should_reject_oversized_header_block_without_calling_handler() {
        let handler = |_session: &mut Session<'_>, _phase: RequestPhase<'_>| -> HandlerResult {
            panic!("handler must not see a rejected request");
        };
        let mut flood = b"GET / HTTP/1.1\r\n".to_vec();
        while flood.len() < 40 * 1024 {
            flood.extend_from_slice(b"X-Pad: aaaaaaaa\r\n");
        }
        let mut rig = rig_with(&flood, false, 128 * 1024, handler);

        assert_eq!(Progress::Closed, rig.drive());

        let output = rig.output();
        assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{output}");
        assert!(output.contains("Connection: close\r\n"));
        assert!(rig.shut_down());
        assert_eq!(vec![Termination::WithError], rig.terminations());
    }

    #[test]
    fn should_answer_413_when_pool_is_exhausted_first() {
        let handler = |_session: &mut Session<'_>, _phase: RequestPhase<'_>| -> HandlerResult {
            panic!("handler must not see a rejected request");
        };
        let mut flood = b"GET / HTTP/1.1\r\n".to_vec();
        while flood.len() < 40 * 1024 {
            flood.extend_from_slice(b"X-Pad: aaaaaaaa\r\n");
        }
        let mut rig = rig_with(&flood, false, DEFAULT_POOL_SIZE, handler);

        assert_eq!(Progress::Closed, rig.drive());
        assert!(rig.output().starts_with("HTTP/1.1 413 "), "{}", rig.output());
    }

    #[test]
    fn should_emit_100_continue_before_reading_body() {
        let mut rig = rig(
            b"POST /up HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\nhello",
            hello_handler(),
        );

        rig.drive();

        let output = rig.output();
        assert!(
            output.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"),
            "{output}"
        );
        assert_eq!(1, output.matches("100 Continue").count());
    }

    #[test]
    fn should_ignore_expect_continue_for_http10() {
        let mut rig = rig(
            b"POST /up HTTP/1.0\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\nhello",
            hello_handler(),
        );

        rig.drive();

        let output = rig.output();
        assert!(!output.contains("100 Continue"), "{output}");
        assert!(output.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(output.contains("Connection: close\r\n"));
        assert!(rig.shut_down(), "HTTP/1.0 defaults to close");
    }

    #[test]
    fn should_keep_http10_connection_on_explicit_keepalive() {
        let mut rig = rig(
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
            hello_handler(),
        );

        rig.drive();

        assert!(rig.output().contains("Connection: keep-alive\r\n"));
        assert!(!rig.shut_down());
    }

    #[test]
    fn should_close_http11_connection_on_explicit_close() {
        let mut rig = rig(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", hello_handler());

        assert_eq!(Progress::Closed, rig.drive());
        assert!(rig.output().contains("Connection: close\r\n"));
        assert!(rig.shut_down());
    }

    #[test]
    fn should_reject_second_queued_response() {
        let handler = |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            if matches!(phase, RequestPhase::Complete) {
                let first = Arc::new(Response::empty());
                session.queue_response(StatusCode::OK, &first).unwrap();
                let second = Arc::new(Response::empty());
                assert!(matches!(
                    session.queue_response(StatusCode::OK, &second),
                    Err(Error::ResponseAlreadyQueued)
                ));
            }
            HandlerResult::Continue
        };
        let mut rig = rig(b"GET / HTTP/1.1\r\n\r\n", handler);
        rig.drive();
        assert_eq!(1, rig.output().matches("HTTP/1.1 200 OK").count());
    }

    #[test]
    fn should_close_silently_when_handler_aborts() {
        let handler = |_session: &mut Session<'_>, _phase: RequestPhase<'_>| HandlerResult::Abort;
        let mut rig = rig(b"GET / HTTP/1.1\r\n\r\n", handler);

        assert_eq!(Progress::Closed, rig.drive());
        assert!(rig.output().is_empty(), "abort must not produce a response");
        assert!(rig.shut_down());
        assert_eq!(vec![Termination::WithError], rig.terminations());
    }

    #[test]
    fn should_decode_urlencoded_form_into_post_data() {
        let checked = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&checked);
        let handler = move |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            if matches!(phase, RequestPhase::Complete) {
                assert_eq!(Some("Ferris"), session.value(ValueKind::PostData, "name"));
                assert_eq!(Some("rust"), session.value(ValueKind::PostData, "lang"));
                assert_eq!(2, session.values(KindMask::POST_DATA, |_, _, _| {}));
                flag.store(true, Ordering::SeqCst);
                let response = Arc::new(Response::empty());
                session.queue_response(StatusCode::OK, &response).unwrap();
            }
            HandlerResult::Continue
        };
        let body = b"name=Ferris&lang=rust";
        let mut request = format!(
            "POST /form HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(body);
        let mut rig = rig(&request, handler);

        rig.drive();
        assert!(checked.load(Ordering::SeqCst));
    }

    #[test]
    fn should_suppress_body_for_head_requests() {
        let mut rig = rig(b"HEAD /hello HTTP/1.1\r\n\r\n", hello_handler());

        rig.drive();

        let output = rig.output();
        assert!(output.contains("Content-Length: 13\r\n"), "{output}");
        assert!(output.ends_with("\r\n\r\n"), "HEAD response carries no body: {output}");
        assert!(!rig.shut_down());
    }

    #[test]
    fn should_keep_handler_context_across_invocations() {
        let handler = |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            match phase {
                RequestPhase::Headers => session.set_context(0usize),
                RequestPhase::Body(chunk) => {
                    *session.context_mut::<usize>().unwrap() += chunk.len();
                }
                RequestPhase::Complete => {
                    assert_eq!(Some(&5usize), session.context::<usize>());
                    let response = Arc::new(Response::empty());
                    session.queue_response(StatusCode::OK, &response).unwrap();
                }
            }
            HandlerResult::Continue
        };
        let mut rig = rig(b"POST /count HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello", handler);

        rig.drive();
        assert!(rig.output().starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn should_serve_known_size_reader_response() {
        let handler = |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            if matches!(phase, RequestPhase::Complete) {
                let response = Arc::new(Response::from_reader(Some(8), |pos: u64, buf: &mut [u8]| {
                    let n = buf.len().min((8 - pos) as usize).min(4);
                    buf[..n].fill(b'x');
                    ReaderStatus::Data(n)
                }));
                session.queue_response(StatusCode::OK, &response).unwrap();
            }
            HandlerResult::Continue
        };
        let mut rig = rig(b"GET /xs HTTP/1.1\r\n\r\n", handler);

        rig.drive();

        let output = rig.output();
        assert!(output.contains("Content-Length: 8\r\n"));
        assert!(output.ends_with("\r\n\r\nxxxxxxxx"), "{output}");
        assert!(!rig.shut_down());
    }

    #[test]
    fn should_close_when_reader_breaks_contract() {
        let handler = |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            if matches!(phase, RequestPhase::Complete) {
                let response = Arc::new(Response::from_reader(Some(8), |_pos: u64, _buf: &mut [u8]| {
                    ReaderStatus::Data(0)
                }));
                session.queue_response(StatusCode::OK, &response).unwrap();
            }
            HandlerResult::Continue
        };
        let mut rig = rig(b"GET / HTTP/1.1\r\n\r\n", handler);

        assert_eq!(Progress::Closed, rig.drive());
        assert_eq!(vec![Termination::WithError], rig.terminations());
    }

    #[test]
    fn should_abort_when_peer_vanishes_mid_request() {
        let mut rig = rig_with(b"GET /he", true, DEFAULT_POOL_SIZE, hello_handler());

        assert_eq!(Progress::Closed, rig.drive());
        assert!(rig.output().is_empty());
        assert_eq!(vec![Termination::ClientAbort], rig.terminations());
    }

    #[test]
    fn should_close_cleanly_on_eof_between_requests() {
        let mut rig = rig_with(
            b"GET / HTTP/1.1\r\nHost: x\r\n\r\n",
            true,
            DEFAULT_POOL_SIZE,
            hello_handler(),
        );

        assert_eq!(Progress::Closed, rig.drive());
        assert_eq!(1, rig.output().matches("HTTP/1.1 200 OK").count());
        assert_eq!(vec![Termination::Completed], rig.terminations());
    }

    #[test]
    fn should_notify_timeout_on_external_close() {
        let mut rig = rig(b"", hello_handler());
        assert_eq!(Progress::Blocked(Interest::Read), rig.drive());

        rig.conn.close_for(Termination::TimedOut);

        assert!(rig.conn.is_closed());
        assert!(rig.shut_down());
        assert_eq!(vec![Termination::TimedOut], rig.terminations());
    }
}
