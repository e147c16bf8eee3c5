//! Minimal embedding: serve a fixed body on an internal-select daemon.
//!
//! Run with `cargo run --example hello`, then `curl http://127.0.0.1:8080/`.

use anyhow::Result;
use embedhttp::{Daemon, HandlerResult, RequestPhase, Response, Session, StatusCode};
use std::sync::Arc;
use std::time::Duration;

fn main() -> Result<()> {
    env_logger::init();

    let daemon = Daemon::builder(8080)
        .with_internal_select()
        .with_connection_timeout(Duration::from_secs(30))
        .start(|session: &mut Session<'_>, phase: RequestPhase<'_>| {
            if let RequestPhase::Complete = phase {
                let response = Arc::new(Response::from_copy(b"Hello, world!\n"));
                if session.queue_response(StatusCode::OK, &response).is_err() {
                    return HandlerResult::Abort;
                }
            }
            HandlerResult::Continue
        })?;

    println!("listening on {}", daemon.local_addr());
    std::thread::park();
    Ok(())
}
