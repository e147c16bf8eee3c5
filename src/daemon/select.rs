//! Internal-select mode: one daemon-owned thread runs a `mio::Poll` loop
//! over the listener and every live connection.
//!
//! Registrations are refreshed from the connection registry before each
//! poll; closed sockets fall out of the poller on their own when the fd is
//! dropped. Shutdown is signalled with a `mio::Waker`, the readiness-loop
//! equivalent of a self-pipe.

use crate::daemon::DaemonCore;
use log::warn;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::Duration;

const LISTENER: Token = Token(usize::MAX - 2);
const WAKER: Token = Token(usize::MAX - 1);

/// Fallback tick so idle reaping happens even on a silent socket set.
const POLL_TICK: Duration = Duration::from_millis(100);

pub(crate) fn spawn(core: Arc<DaemonCore>) -> io::Result<(thread::JoinHandle<()>, Arc<Waker>)> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
    let handle = thread::Builder::new()
        .name("embedhttp-select".to_owned())
        .spawn(move || select_loop(core, poll))?;
    Ok((handle, waker))
}

fn select_loop(core: Arc<DaemonCore>, mut poll: Poll) {
    let listener_fd = core.listener_fd();
    if let Err(err) = poll
        .registry()
        .register(&mut SourceFd(&listener_fd), LISTENER, Interest::READABLE)
    {
        warn!("cannot register listener with poller: {err}");
        return;
    }

    let mut events = Events::with_capacity(256);
    // connection id -> interests currently registered
    let mut registered: HashMap<u64, Interest> = HashMap::new();

    while !core.shutdown.load(Ordering::SeqCst) {
        refresh_registrations(&core, &poll, &mut registered);
        if let Err(err) = poll.poll(&mut events, Some(POLL_TICK)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!("poll failed: {err}");
            break;
        }
        core.sweep(true);
    }
}

fn refresh_registrations(
    core: &DaemonCore,
    poll: &Poll,
    registered: &mut HashMap<u64, Interest>,
) {
    let connections = core
        .connections
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    registered.retain(|id, _| connections.contains_key(id));
    for (id, connection) in connections.iter() {
        let (read, write) = connection.wants();
        let interest = match (read, write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (_, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        };
        let fd = connection.raw_fd();
        match registered.get(id) {
            Some(&current) if current == interest => {}
            Some(_) => {
                if poll
                    .registry()
                    .reregister(&mut SourceFd(&fd), Token(*id as usize), interest)
                    .is_ok()
                {
                    registered.insert(*id, interest);
                }
            }
            None => {
                if poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(*id as usize), interest)
                    .is_ok()
                {
                    registered.insert(*id, interest);
                }
            }
        }
    }
}
