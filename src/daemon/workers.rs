//! Thread-per-connection mode: a daemon-owned accept thread hands every
//! admitted connection to its own worker thread.
//!
//! Workers reuse the same non-blocking state machine as the other modes and
//! park on a per-worker readiness poll between sweeps, waking on a short
//! tick to honor idle timeouts and daemon shutdown.

use crate::connection::{Connection, Progress, Termination};
use crate::daemon::DaemonCore;
use log::warn;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::Duration;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const CONN: Token = Token(0);

const ACCEPT_TICK: Duration = Duration::from_millis(200);
const WORKER_TICK: Duration = Duration::from_millis(200);

pub(crate) fn spawn_acceptor(
    core: Arc<DaemonCore>,
) -> io::Result<(thread::JoinHandle<()>, Arc<Waker>)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
    let handle = thread::Builder::new()
        .name("embedhttp-accept".to_owned())
        .spawn(move || accept_loop(core, poll))?;
    Ok((handle, waker))
}

fn accept_loop(core: Arc<DaemonCore>, mut poll: Poll) {
    let listener_fd = core.listener_fd();
    if let Err(err) = poll
        .registry()
        .register(&mut SourceFd(&listener_fd), LISTENER, Interest::READABLE)
    {
        warn!("cannot register listener with poller: {err}");
        return;
    }

    let mut events = Events::with_capacity(16);
    while !core.shutdown.load(Ordering::SeqCst) {
        if let Err(err) = poll.poll(&mut events, Some(ACCEPT_TICK)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("accept poll failed: {err}");
            break;
        }
        let now = core.time.now_nanos();
        while let Some(connection) = core.accept_once(now) {
            let worker_core = Arc::clone(&core);
            match thread::Builder::new()
                .name("embedhttp-conn".to_owned())
                .spawn(move || worker_loop(worker_core, connection))
            {
                Ok(handle) => core
                    .worker_handles
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle),
                Err(err) => warn!("cannot spawn connection worker: {err}"),
            }
        }
    }
}

fn worker_loop(core: Arc<DaemonCore>, mut connection: Connection) {
    let mut poll = match Poll::new() {
        Ok(poll) => poll,
        Err(err) => {
            warn!("worker poller setup failed: {err}");
            connection.close_for(Termination::WithError);
            return;
        }
    };
    let fd = connection.raw_fd();
    if poll
        .registry()
        .register(
            &mut SourceFd(&fd),
            CONN,
            Interest::READABLE | Interest::WRITABLE,
        )
        .is_err()
    {
        connection.close_for(Termination::WithError);
        return;
    }

    let mut events = Events::with_capacity(4);
    loop {
        if core.shutdown.load(Ordering::SeqCst) {
            connection.close_for(Termination::DaemonShutdown);
            return;
        }
        let now = core.time.now_nanos();
        if connection.advance(now) == Progress::Closed {
            return;
        }
        if let Some(timeout_ns) = core.timeout_ns {
            if now.saturating_sub(connection.last_activity_ns()) > timeout_ns {
                connection.close_for(Termination::TimedOut);
                return;
            }
        }
        if let Err(err) = poll.poll(&mut events, Some(WORKER_TICK)) {
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("worker poll failed: {err}");
                connection.close_for(Termination::WithError);
                return;
            }
        }
    }
}
