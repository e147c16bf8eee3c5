//! Daemon: listener, connection registry and the three event-loop modes.
//!
//! A [`Daemon`] owns one listening socket and every connection accepted from
//! it. Three mutually exclusive operating modes cover the usual embedding
//! styles:
//!
//! 1. **External** (default): the host owns the loop. It asks for the fds to
//!    watch via [`Daemon::fdset`], selects/polls them itself, and calls
//!    [`Daemon::run`] for one non-blocking sweep per readiness wakeup.
//! 2. **Internal select**: the daemon owns one thread running a `mio::Poll`
//!    loop over the listener and every connection.
//! 3. **Thread per connection**: an accept thread spawns one worker per
//!    connection; each worker sweeps its single connection with its own
//!    readiness poll.

pub mod time;

pub(crate) mod select;
pub(crate) mod workers;

use crate::connection::{AccessHandler, Connection, Notifier, Progress, Termination};
use crate::connection::DEFAULT_POOL_SIZE;
use crate::error::Error;
use crate::stream::{PlainStream, Transport};
use crate::daemon::time::{MonotonicClock, TimeSource};
use log::{debug, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::io::ErrorKind::{Interrupted, WouldBlock};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

/// Event-loop ownership, see the module docs.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Mode {
    #[default]
    External,
    InternalSelect,
    ThreadPerConnection,
}

/// File descriptors the host must watch in external mode, with the highest
/// fd ready for a `select` call.
#[derive(Debug, Default)]
pub struct FdSet {
    pub read: Vec<RawFd>,
    pub write: Vec<RawFd>,
    pub except: Vec<RawFd>,
    pub max_fd: RawFd,
}

impl FdSet {
    pub fn new() -> FdSet {
        Self {
            max_fd: -1,
            ..Self::default()
        }
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
        self.except.clear();
        self.max_fd = -1;
    }

    fn track(&mut self, fd: RawFd) {
        self.max_fd = self.max_fd.max(fd);
    }
}

pub(crate) type AcceptPolicy = Arc<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

/// Ordered prefix registry with the daemon's default handler as the terminal
/// fallback. The longest registered prefix matching the request path wins.
pub(crate) struct HandlerTable {
    routes: Vec<(String, Arc<dyn AccessHandler>)>,
    fallback: Arc<dyn AccessHandler>,
}

impl HandlerTable {
    pub(crate) fn new(fallback: Arc<dyn AccessHandler>) -> HandlerTable {
        Self {
            routes: Vec::new(),
            fallback,
        }
    }

    pub(crate) fn register(
        &mut self,
        prefix: &str,
        handler: Arc<dyn AccessHandler>,
    ) -> Result<(), Error> {
        if self.routes.iter().any(|(p, _)| p == prefix) {
            return Err(Error::DuplicateHandler(prefix.to_owned()));
        }
        self.routes.push((prefix.to_owned(), handler));
        Ok(())
    }

    pub(crate) fn unregister(&mut self, prefix: &str) -> Result<(), Error> {
        let before = self.routes.len();
        self.routes.retain(|(p, _)| p != prefix);
        if before == self.routes.len() {
            return Err(Error::HandlerNotFound(prefix.to_owned()));
        }
        Ok(())
    }

    pub(crate) fn resolve(&self, path: &str) -> Arc<dyn AccessHandler> {
        self.routes
            .iter()
            .filter(|(prefix, _)| path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| Arc::clone(handler))
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }
}

/// State shared between the public handle and the loop/worker threads.
pub(crate) struct DaemonCore {
    listener: TcpListener,
    local_addr: SocketAddr,
    pub(crate) handlers: Arc<Mutex<HandlerTable>>,
    pub(crate) connections: Mutex<HashMap<u64, Connection>>,
    next_id: AtomicU64,
    accept_policy: Option<AcceptPolicy>,
    notifier: Option<Notifier>,
    pub(crate) timeout_ns: Option<u64>,
    pool_size: usize,
    debug: bool,
    pub(crate) time: Arc<dyn TimeSource>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) worker_handles: Mutex<Vec<JoinHandle<()>>>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl DaemonCore {
    pub(crate) fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    fn make_transport(&self, stream: TcpStream) -> io::Result<(Box<dyn Transport>, bool)> {
        let plain = PlainStream::new(stream)?;
        #[cfg(feature = "tls")]
        if let Some(config) = &self.tls {
            let tls = crate::stream::tls::TlsStream::new(plain, Arc::clone(config))?;
            return Ok((Box::new(tls), true));
        }
        Ok((Box::new(plain), false))
    }

    pub(crate) fn accept_once(&self, now_ns: u64) -> Option<Connection> {
        let (stream, peer) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == WouldBlock || err.kind() == Interrupted => return None,
            Err(err) => {
                warn!("accept failed: {err}");
                return None;
            }
        };
        if let Some(policy) = &self.accept_policy {
            if !policy(&peer) {
                debug!("connection from {peer} refused by accept policy");
                return None;
            }
        }
        let (transport, secure) = match self.make_transport(stream) {
            Ok(transport) => transport,
            Err(err) => {
                warn!("transport setup for {peer} failed: {err}");
                return None;
            }
        };
        match Connection::new(
            transport,
            peer,
            Arc::clone(&self.handlers),
            self.notifier.clone(),
            self.pool_size,
            secure,
            self.debug,
            now_ns,
        ) {
            Ok(connection) => {
                if self.debug {
                    debug!("accepted connection from {peer}");
                }
                Some(connection)
            }
            Err(err) => {
                warn!("connection setup for {peer} failed: {err}");
                None
            }
        }
    }

    pub(crate) fn register_accepted(&self, connection: Connection) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, connection);
        id
    }

    /// One non-blocking pass: accept, advance every connection until it
    /// would block, reap idle timeouts. `accept_all` drains the backlog
    /// instead of taking at most one connection.
    pub(crate) fn sweep(&self, accept_all: bool) {
        let now = self.time.now_nanos();
        loop {
            match self.accept_once(now) {
                Some(connection) => {
                    self.register_accepted(connection);
                    if !accept_all {
                        break;
                    }
                }
                None => break,
            }
        }

        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        connections.retain(|_, connection| connection.advance(now) != Progress::Closed);
        if let Some(timeout_ns) = self.timeout_ns {
            connections.retain(|_, connection| {
                if now.saturating_sub(connection.last_activity_ns()) > timeout_ns {
                    connection.close_for(Termination::TimedOut);
                    false
                } else {
                    true
                }
            });
        }
    }

    pub(crate) fn close_all(&self, term: Termination) {
        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, connection) in connections.iter_mut() {
            connection.close_for(term);
        }
        connections.clear();
    }
}

/// Builder for every daemon option. Finish with [`DaemonBuilder::start`].
pub struct DaemonBuilder {
    port: u16,
    mode: Mode,
    ipv4: bool,
    ipv6: bool,
    debug: bool,
    pool_size: usize,
    timeout: Duration,
    accept_policy: Option<AcceptPolicy>,
    notifier: Option<Notifier>,
    time_source: Option<Arc<dyn TimeSource>>,
    #[cfg(feature = "tls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl DaemonBuilder {
    fn new(port: u16) -> DaemonBuilder {
        Self {
            port,
            mode: Mode::External,
            ipv4: true,
            ipv6: false,
            debug: false,
            pool_size: DEFAULT_POOL_SIZE,
            timeout: Duration::ZERO,
            accept_policy: None,
            notifier: None,
            time_source: None,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    /// Run the event loop on a daemon-owned thread.
    pub fn with_internal_select(mut self) -> DaemonBuilder {
        self.mode = Mode::InternalSelect;
        self
    }

    /// Accept on a daemon-owned thread and give every connection its own
    /// worker thread.
    pub fn with_thread_per_connection(mut self) -> DaemonBuilder {
        self.mode = Mode::ThreadPerConnection;
        self
    }

    /// Selects the listening address families. At least one must be enabled;
    /// IPv4-only is the default.
    pub fn with_address_families(mut self, ipv4: bool, ipv6: bool) -> DaemonBuilder {
        self.ipv4 = ipv4;
        self.ipv6 = ipv6;
        self
    }

    /// Extra per-connection diagnostics through the `log` facade.
    pub fn with_debug(mut self) -> DaemonBuilder {
        self.debug = true;
        self
    }

    /// Per-connection memory pool capacity (default 32 KiB).
    pub fn with_pool_size(mut self, bytes: usize) -> DaemonBuilder {
        self.pool_size = bytes;
        self
    }

    /// Closes connections idle for longer than `timeout`. Zero (the default)
    /// disables the idle timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> DaemonBuilder {
        self.timeout = timeout;
        self
    }

    /// Consulted with the peer address before a connection is admitted.
    pub fn with_accept_policy<F>(mut self, policy: F) -> DaemonBuilder
    where
        F: Fn(&SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.accept_policy = Some(Arc::new(policy));
        self
    }

    /// Called once per request (or connection teardown) with the reason the
    /// request ended.
    pub fn with_request_ended_notifier<F>(mut self, notifier: F) -> DaemonBuilder
    where
        F: Fn(&SocketAddr, Termination) + Send + Sync + 'static,
    {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Replaces the monotonic clock, e.g. with a manually driven one in
    /// tests.
    pub fn with_time_source<T: TimeSource + 'static>(mut self, time_source: T) -> DaemonBuilder {
        self.time_source = Some(Arc::new(time_source));
        self
    }

    /// Serves TLS with the given, fully host-configured server config.
    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, config: Arc<rustls::ServerConfig>) -> DaemonBuilder {
        self.tls = Some(config);
        self
    }

    /// Binds the listener and brings the daemon up with `handler` as the
    /// default (terminal) request handler.
    pub fn start<H>(self, handler: H) -> Result<Daemon, Error>
    where
        H: AccessHandler + 'static,
    {
        if !self.ipv4 && !self.ipv6 {
            return Err(Error::NoAddressFamily);
        }
        let listener = bind_listener(self.port, self.ipv4, self.ipv6)?;
        let local_addr = listener.local_addr()?;

        let core = Arc::new(DaemonCore {
            listener,
            local_addr,
            handlers: Arc::new(Mutex::new(HandlerTable::new(Arc::new(handler)))),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            accept_policy: self.accept_policy,
            notifier: self.notifier,
            timeout_ns: if self.timeout.is_zero() {
                None
            } else {
                Some(self.timeout.as_nanos() as u64)
            },
            pool_size: self.pool_size,
            debug: self.debug,
            time: self
                .time_source
                .unwrap_or_else(|| Arc::new(MonotonicClock::default())),
            shutdown: AtomicBool::new(false),
            worker_handles: Mutex::new(Vec::new()),
            #[cfg(feature = "tls")]
            tls: self.tls,
        });

        let loop_thread = match self.mode {
            Mode::External => None,
            Mode::InternalSelect => Some(select::spawn(Arc::clone(&core))?),
            Mode::ThreadPerConnection => Some(workers::spawn_acceptor(Arc::clone(&core))?),
        };

        Ok(Daemon {
            core,
            mode: self.mode,
            loop_thread,
        })
    }
}

fn bind_listener(port: u16, ipv4: bool, ipv6: bool) -> Result<TcpListener, Error> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if ipv6 {
        // dual-stack when IPv4 is requested alongside
        socket.set_only_v6(!ipv4)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr: SocketAddr = if ipv6 {
        (Ipv6Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, port).into()
    };
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Handle to a running daemon. Dropping it stops the daemon.
pub struct Daemon {
    core: Arc<DaemonCore>,
    mode: Mode,
    loop_thread: Option<(JoinHandle<()>, Arc<mio::Waker>)>,
}

impl Daemon {
    pub fn builder(port: u16) -> DaemonBuilder {
        DaemonBuilder::new(port)
    }

    /// The bound address; useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Registers `handler` for every path starting with `prefix`. Longest
    /// registered prefix wins; the default handler catches the rest.
    pub fn register_handler<H>(&self, prefix: &str, handler: H) -> Result<(), Error>
    where
        H: AccessHandler + 'static,
    {
        self.core
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .register(prefix, Arc::new(handler))
    }

    pub fn unregister_handler(&self, prefix: &str) -> Result<(), Error> {
        self.core
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(prefix)
    }

    /// One non-blocking sweep: accept at most one connection, advance every
    /// connection as far as its socket allows, reap idle timeouts. External
    /// mode only.
    pub fn run(&self) -> Result<(), Error> {
        if self.mode != Mode::External {
            return Err(Error::WrongMode);
        }
        self.core.sweep(false);
        Ok(())
    }

    /// Fills `set` with the fds the host must watch before the next
    /// [`Daemon::run`]. External mode only.
    pub fn fdset(&self, set: &mut FdSet) -> Result<(), Error> {
        if self.mode != Mode::External {
            return Err(Error::WrongMode);
        }
        set.clear();
        let listener_fd = self.core.listener_fd();
        set.read.push(listener_fd);
        set.track(listener_fd);
        let connections = self
            .core
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for connection in connections.values() {
            let fd = connection.raw_fd();
            let (read, write) = connection.wants();
            if read {
                set.read.push(fd);
            }
            if write {
                set.write.push(fd);
            }
            set.except.push(fd);
            set.track(fd);
        }
        Ok(())
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.core
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Stops the daemon: closes the listener, signals the loop thread, joins
    /// every worker and terminates in-flight requests with
    /// [`Termination::DaemonShutdown`].
    pub fn stop(&mut self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        if let Some((handle, waker)) = self.loop_thread.take() {
            let _ = waker.wake();
            let _ = handle.join();
        }
        let workers = std::mem::take(
            &mut *self
                .core
                .worker_handles
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for handle in workers {
            let _ = handle.join();
        }
        self.core.close_all(Termination::DaemonShutdown);
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{HandlerResult, RequestPhase, Session};
    use crate::daemon::time::ManualClock;
    use crate::response::Response;
    use http::StatusCode;
    use std::io::{Read, Write};
    use std::thread;

    fn fixed(body: &'static [u8]) -> impl AccessHandler + 'static {
        move |session: &mut Session<'_>, phase: RequestPhase<'_>| {
            if matches!(phase, RequestPhase::Complete) {
                let response = Arc::new(Response::from_static(body));
                session.queue_response(StatusCode::OK, &response).unwrap();
            }
            HandlerResult::Continue
        }
    }

    /// Pumps an external-mode daemon long enough for small exchanges.
    fn drive(daemon: &Daemon) {
        for _ in 0..100 {
            daemon.run().unwrap();
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn exchange(addr: SocketAddr, request: &[u8]) -> String {
        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(request).unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[test]
    fn should_resolve_longest_prefix_with_default_fallback() {
        let fallback: Arc<dyn AccessHandler> = Arc::new(fixed(b"fallback"));
        let api: Arc<dyn AccessHandler> = Arc::new(fixed(b"api"));
        let api_v2: Arc<dyn AccessHandler> = Arc::new(fixed(b"api-v2"));

        let mut table = HandlerTable::new(Arc::clone(&fallback));
        table.register("/api", Arc::clone(&api)).unwrap();
        table.register("/api/v2", Arc::clone(&api_v2)).unwrap();

        assert!(Arc::ptr_eq(&table.resolve("/api/v2/users"), &api_v2));
        assert!(Arc::ptr_eq(&table.resolve("/api/users"), &api));
        assert!(Arc::ptr_eq(&table.resolve("/other"), &fallback));
    }

    #[test]
    fn should_reject_duplicate_and_unknown_prefixes() {
        let mut table = HandlerTable::new(Arc::new(fixed(b"fallback")));
        table.register("/api", Arc::new(fixed(b"api"))).unwrap();

        assert!(matches!(
            table.register("/api", Arc::new(fixed(b"other"))),
            Err(Error::DuplicateHandler(_))
        ));
        assert!(matches!(
            table.unregister("/missing"),
            Err(Error::HandlerNotFound(_))
        ));
        table.unregister("/api").unwrap();
        assert!(matches!(
            table.unregister("/api"),
            Err(Error::HandlerNotFound(_))
        ));
    }

    #[test]
    fn should_error_without_an_address_family() {
        let result = Daemon::builder(0)
            .with_address_families(false, false)
            .start(fixed(b"x"));
        assert!(matches!(result, Err(Error::NoAddressFamily)));
    }

    #[test]
    fn should_refuse_run_and_fdset_outside_external_mode() {
        let daemon = Daemon::builder(0)
            .with_internal_select()
            .start(fixed(b"x"))
            .unwrap();
        assert!(matches!(daemon.run(), Err(Error::WrongMode)));
        let mut set = FdSet::new();
        assert!(matches!(daemon.fdset(&mut set), Err(Error::WrongMode)));
    }

    #[test]
    fn should_serve_request_in_external_mode() {
        let daemon = Daemon::builder(0).start(fixed(b"external!")).unwrap();
        let addr = daemon.local_addr();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
            .unwrap();
        drive(&daemon);

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("external!"));
    }

    #[test]
    fn should_route_to_registered_prefixes_at_dispatch_time() {
        let daemon = Daemon::builder(0).start(fixed(b"fallback")).unwrap();
        daemon.register_handler("/api", fixed(b"api!")).unwrap();
        let addr = daemon.local_addr();

        let mut client = TcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client
            .write_all(b"GET /api/users HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();
        drive(&daemon);

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        assert!(String::from_utf8_lossy(&response).ends_with("api!"));
    }

    #[test]
    fn should_fill_fdset_with_listener_and_connections() {
        let daemon = Daemon::builder(0).start(fixed(b"x")).unwrap();
        let mut set = FdSet::new();

        daemon.fdset(&mut set).unwrap();
        let listener_fd = daemon.core.listener_fd();
        assert_eq!(vec![listener_fd], set.read);
        assert_eq!(listener_fd, set.max_fd);

        let _client = TcpStream::connect(daemon.local_addr()).unwrap();
        for _ in 0..20 {
            daemon.run().unwrap();
            if daemon.connection_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(1, daemon.connection_count());

        daemon.fdset(&mut set).unwrap();
        assert_eq!(2, set.read.len(), "listener plus idle connection");
        assert_eq!(1, set.except.len());
        assert!(set.max_fd >= listener_fd);
    }

    #[test]
    fn should_time_out_idle_connections() {
        let clock = Arc::new(ManualClock::new());
        let ended = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ended);
        let daemon = Daemon::builder(0)
            .with_connection_timeout(Duration::from_secs(5))
            .with_time_source(Arc::clone(&clock))
            .with_request_ended_notifier(move |_peer, term| sink.lock().unwrap().push(term))
            .start(fixed(b"x"))
            .unwrap();

        let mut client = TcpStream::connect(daemon.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        for _ in 0..20 {
            daemon.run().unwrap();
            if daemon.connection_count() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(1, daemon.connection_count());

        clock.advance(Duration::from_secs(6));
        daemon.run().unwrap();

        assert_eq!(0, daemon.connection_count());
        assert_eq!(vec![Termination::TimedOut], *ended.lock().unwrap());
        let mut buf = [0u8; 16];
        assert_eq!(0, client.read(&mut buf).unwrap(), "peer socket must be closed");
    }

    #[test]
    fn should_deny_connections_via_accept_policy() {
        let daemon = Daemon::builder(0)
            .with_accept_policy(|_peer| false)
            .start(fixed(b"x"))
            .unwrap();

        let mut client = TcpStream::connect(daemon.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        drive(&daemon);

        assert_eq!(0, daemon.connection_count());
        let mut buf = [0u8; 16];
        match client.read(&mut buf) {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("denied peer received {n} bytes"),
        }
    }

    #[test]
    fn should_serve_over_internal_select_thread() {
        let mut daemon = Daemon::builder(0)
            .with_internal_select()
            .start(fixed(b"selected"))
            .unwrap();

        let response = exchange(
            daemon.local_addr(),
            b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("selected"));

        daemon.stop();
    }

    #[test]
    fn should_serve_with_thread_per_connection() {
        let mut daemon = Daemon::builder(0)
            .with_thread_per_connection()
            .start(fixed(b"threaded"))
            .unwrap();

        let response = exchange(
            daemon.local_addr(),
            b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n",
        );
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("threaded"));

        daemon.stop();
    }

    #[test]
    fn should_notify_shutdown_for_connections_still_open() {
        let ended = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&ended);
        let mut daemon = Daemon::builder(0)
            .with_internal_select()
            .with_request_ended_notifier(move |_peer, term| sink.lock().unwrap().push(term))
            .start(fixed(b"x"))
            .unwrap();

        let _client = TcpStream::connect(daemon.local_addr()).unwrap();
        thread::sleep(Duration::from_millis(300));
        daemon.stop();

        assert!(
            ended.lock().unwrap().contains(&Termination::DaemonShutdown),
            "open connection must see the shutdown termination"
        );
    }
}
