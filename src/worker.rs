//! Worker thread pool. Each worker dequeues a ready session, services
//! exactly one request, then either returns the session to the
//! acceptor's poll set or tears it down, adapted from
//! `fuser::session_mt`'s fixed-size thread pool.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::acceptor::ReturnPipe;
use crate::codec::reader::read_framed;
use crate::codec::request::parse_request;
use crate::codec::response::emit_response;
use crate::dispatch::{self, DispatchOutcome};
use crate::error::{DispatchError, ReadFrameError};
use crate::service::Service;
use crate::session::{self, Session};

/// How often the lock-release broadcaster wakes every blocked
/// `LOCK`/`OPENL` waiter, so each re-checks its own deadline and the
/// shutdown flags even if nobody ever explicitly unlocked.
const BROADCAST_PERIOD: Duration = Duration::from_secs(2);

/// Spawn the fixed-size worker pool plus the periodic lock-release
/// broadcaster, returning their join handles.
pub fn spawn_pool(service: Arc<Service>, return_pipe: ReturnPipe) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(service.config.worker_threads_num as usize + 1);
    for _ in 0..service.config.worker_threads_num {
        let service = Arc::clone(&service);
        let return_pipe = return_pipe.clone();
        handles.push(thread::spawn(move || worker_loop(service, return_pipe)));
    }
    {
        let service = Arc::clone(&service);
        handles.push(thread::spawn(move || broadcast_loop(service)));
    }
    handles
}

fn worker_loop(service: Arc<Service>, return_pipe: ReturnPipe) {
    loop {
        let Some(id) = service.registry.wait_for_ready() else {
            return;
        };
        let Some(mut session) = service.registry.take(id) else {
            // Already torn down by a racing event (e.g. a peer EOF
            // observed on a different path); nothing to do.
            continue;
        };
        match service_one_request(&service, &mut session) {
            Some(()) => {
                service.registry.put_back(session);
                if let Err(e) = return_pipe.notify(id) {
                    log::error!("failed to notify acceptor of returned session {id}: {e}");
                }
            }
            None => session::teardown(&service.registry, &service.store, &service.log, session, None),
        }
    }
}

/// Read, dispatch and answer exactly one request on `session`. Returns
/// `Some(())` if the session should stay open, or `None` if it was
/// closed (peer EOF, a framing error, `QUIT`, or an internal error).
fn service_one_request(service: &Service, session: &mut Session) -> Option<()> {
    let req = match read_framed(&mut session.socket, &mut session.buffer, parse_request) {
        Ok(req) => req,
        Err(ReadFrameError::ConnectionClosed) => return None,
        Err(e) => {
            log::warn!("session {}: framing error: {e}", session.id);
            return None;
        }
    };

    let cmd_name = req.cmd.as_str();
    let arg = String::from_utf8_lossy(&req.arg).into_owned();

    let outcome = dispatch::dispatch(&req, session, &service.store, &service.registry, &service.log);
    let is_quit = req.cmd == crate::codec::Command::Quit;

    let (response_bytes, keep_open) = match outcome {
        Ok(DispatchOutcome { code, description, data }) => {
            let bytes = match emit_response(code.code(), description.as_bytes(), &data) {
                Ok(b) => b,
                Err(_) => {
                    service.log.command_result(session.id, cmd_name, &arg, Err("response too large"));
                    return None;
                }
            };
            service.log.command_result(session.id, cmd_name, &arg, Ok(bytes.len() as u64));
            (bytes, !is_quit)
        }
        Err(DispatchError::Protocol(code, description)) => {
            service.log.command_result(session.id, cmd_name, &arg, Err(&description));
            let bytes = emit_response(code.code(), description.as_bytes(), b"")
                .expect("a bare protocol error response never exceeds MAX_BUF");
            (bytes, true)
        }
        Err(DispatchError::Internal(reason)) => {
            service.log.command_result(session.id, cmd_name, &arg, Err(&reason));
            return None;
        }
    };

    if std::io::Write::write_all(&mut session.socket, &response_bytes).is_err() {
        return None;
    }

    // A session is always closed once `quit` is set, even if the
    // command itself succeeded, so a hard shutdown drains every
    // in-flight connection rather than handing it back to the
    // acceptor's idle set.
    if keep_open && !service.registry.quit() {
        Some(())
    } else {
        None
    }
}

/// Periodically wake every `LOCK`/`OPENL` waiter so each re-checks the
/// shutdown flags, even absent an explicit unlock.
fn broadcast_loop(service: Arc<Service>) {
    loop {
        thread::sleep(BROADCAST_PERIOD);
        if service.registry.quit() {
            return;
        }
        service.store.notify_lock_released();
    }
}
