//! Embeddable, readiness-driven HTTP/1.1 server core.
//!
//! `embedhttp` links a small HTTP/1.1 engine into a host process. Each
//! accepted connection runs a non-blocking state machine that parses
//! requests, dispatches them to user handlers and serializes responses with
//! keep-alive, pipelining and chunked transfer encoding; any number of
//! connections multiplex over a single readiness loop. The loop can be owned
//! by the host (external mode), by a daemon thread (internal select) or
//! split one-thread-per-connection.
//!
//! ## Examples
//!
//! Serve a fixed body on a daemon-owned loop thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use embedhttp::{Daemon, HandlerResult, RequestPhase, Response, Session, StatusCode};
//!
//! let _daemon = Daemon::builder(8080)
//!     .with_internal_select()
//!     .start(|session: &mut Session<'_>, phase: RequestPhase<'_>| {
//!         if let RequestPhase::Complete = phase {
//!             let response = Arc::new(Response::from_copy(b"Hello, world!"));
//!             let _ = session.queue_response(StatusCode::OK, &response);
//!         }
//!         HandlerResult::Continue
//!     })
//!     .unwrap();
//! std::thread::park();
//! ```
//!
//! Drive the daemon from a host-owned loop instead.
//!
//! ```no_run
//! use embedhttp::{Daemon, FdSet, HandlerResult, RequestPhase, Session};
//!
//! # fn wait_for_readiness(_set: &FdSet) {}
//! let daemon = Daemon::builder(8080)
//!     .start(|_session: &mut Session<'_>, _phase: RequestPhase<'_>| HandlerResult::Abort)
//!     .unwrap();
//! let mut set = FdSet::new();
//! loop {
//!     daemon.fdset(&mut set).unwrap();
//!     wait_for_readiness(&set); // select/poll/epoll on the host's terms
//!     daemon.run().unwrap();
//! }
//! ```

pub mod arena;
mod buffer;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod headers;
mod parser;
pub mod response;
pub mod stream;
mod util;

pub use crate::arena::{MemoryPool, PoolMark, PoolSlice};
pub use crate::connection::{
    AccessHandler, DEFAULT_POOL_SIZE, HandlerResult, RequestPhase, Session, Termination,
};
pub use crate::daemon::time::{ManualClock, MonotonicClock, TimeSource};
pub use crate::daemon::{Daemon, DaemonBuilder, FdSet, Mode};
pub use crate::error::{Error, ParseError};
pub use crate::headers::{HeaderMap, KindMask, ValueKind};
pub use crate::response::{ContentReader, ReaderStatus, Response};
pub use crate::stream::{PlainStream, Transport};

// re-export
pub use http::{Method, StatusCode, Version};
