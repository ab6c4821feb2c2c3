//! Client session and session registry.
//!
//! A `Session` is owned by exactly one place at a time: the acceptor's
//! idle poll set (by raw fd only — the acceptor never touches session
//! data), the [`Registry`]'s session map, or a worker's local stack
//! frame while it services one request. That single-owner discipline is
//! what lets the worker read/write the socket and mutate its buffer
//! without holding `registry_mutex`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::codec::reader::FrameBuffer;
use crate::codec::response::emit_response;
use crate::error::ResponseCode;
use crate::handoff::HandoffQueue;

/// Opaque per-connection identity. Backed by the connection's raw file
/// descriptor, which already is a unique, cheap, copyable identity for
/// the lifetime of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(RawFd);

impl SessionId {
    pub fn from_raw(fd: RawFd) -> Self {
        SessionId(fd)
    }

    pub fn as_raw(self) -> RawFd {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-connection state.
pub struct Session {
    pub id: SessionId,
    pub socket: UnixStream,
    pub buffer: FrameBuffer,
    pub open_set: HashSet<Vec<u8>>,
}

impl Session {
    fn new(socket: UnixStream) -> Self {
        let id = SessionId::from_raw(socket.as_raw_fd());
        Session {
            id,
            socket,
            buffer: FrameBuffer::new(),
            open_set: HashSet::new(),
        }
    }
}

fn send_greeting(socket: &mut UnixStream, code: ResponseCode) -> io::Result<()> {
    let bytes = emit_response(code.code(), code.default_description().as_bytes(), b"")
        .expect("a bare greeting never exceeds MAX_BUF");
    socket.write_all(&bytes)
}

struct RegistryState {
    sessions: HashMap<SessionId, Session>,
    live_count: u32,
    handoff: HandoffQueue,
}

/// Session admission, storage, and the hand-off queue, all behind one
/// mutex. The shutdown flags themselves are plain atomics rather than
/// fields of the mutexed state: `dispatch`'s bounded lock wait needs to
/// observe `quit` while already holding `store_mutex`, and keeping the
/// flags lock-free avoids ever nesting `registry_mutex` inside
/// `store_mutex`.
pub struct Registry {
    max_conn: u32,
    state: Mutex<RegistryState>,
    queue_nonempty: Condvar,
    quit: AtomicBool,
    no_more_connections: AtomicBool,
}

impl Registry {
    pub fn new(max_conn: u32) -> Self {
        Registry {
            max_conn,
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                live_count: 0,
                handoff: HandoffQueue::new(max_conn.max(1) as usize),
            }),
            queue_nonempty: Condvar::new(),
            quit: AtomicBool::new(false),
            no_more_connections: AtomicBool::new(false),
        }
    }

    /// Admit a freshly accepted connection: send 220 or reject with 421,
    /// and on success register the session.
    pub fn admit(&self, mut socket: UnixStream) -> Option<SessionId> {
        {
            let mut st = self.state.lock();
            if st.live_count >= self.max_conn {
                drop(st);
                let _ = send_greeting(&mut socket, ResponseCode::ServiceUnavailable);
                return None;
            }
            st.live_count += 1;
        }

        if send_greeting(&mut socket, ResponseCode::Ready).is_err() {
            let mut st = self.state.lock();
            st.live_count = st.live_count.saturating_sub(1);
            return None;
        }

        let session = Session::new(socket);
        let id = session.id;
        self.state.lock().sessions.insert(id, session);
        Some(id)
    }

    /// Push a ready handle onto the hand-off queue, waking one worker.
    pub fn push_ready(&self, id: SessionId) {
        let mut st = self.state.lock();
        st.handoff.enqueue(id);
        self.queue_nonempty.notify_one();
    }

    /// Block until a handle is ready, or return `None` once the queue is
    /// drained and shutdown has been requested.
    pub fn wait_for_ready(&self) -> Option<SessionId> {
        let mut st = self.state.lock();
        loop {
            if let Some(id) = st.handoff.dequeue() {
                return Some(id);
            }
            if self.quit.load(Ordering::SeqCst) {
                return None;
            }
            self.queue_nonempty.wait(&mut st);
        }
    }

    /// Check a session out of the registry for exclusive use by the
    /// calling worker. Absent means it was already torn down.
    pub fn take(&self, id: SessionId) -> Option<Session> {
        self.state.lock().sessions.remove(&id)
    }

    /// Return a session the caller is done servicing, for now, to the
    /// registry, so it can be re-admitted to the acceptor's poll set.
    pub fn put_back(&self, session: Session) {
        let id = session.id;
        self.state.lock().sessions.insert(id, session);
    }

    /// Record that a checked-out session has been permanently torn
    /// down (its id is not, and will not be, back in the map).
    pub fn finalize_removal(&self) {
        let mut st = self.state.lock();
        st.live_count = st.live_count.saturating_sub(1);
    }

    pub fn set_quit(&self) {
        self.quit.store(true, Ordering::SeqCst);
        let _st = self.state.lock();
        self.queue_nonempty.notify_all();
    }

    pub fn set_no_more_connections(&self) {
        self.no_more_connections.store(true, Ordering::SeqCst);
    }

    pub fn quit(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn no_more_connections(&self) -> bool {
        self.no_more_connections.load(Ordering::SeqCst)
    }

    pub fn live_count(&self) -> u32 {
        self.state.lock().live_count
    }

    pub fn max_conn(&self) -> u32 {
        self.max_conn
    }
}

/// Tear down a checked-out session: close every entry in its open-set
/// as `CLOSE` would, log `CONNECTION_CLOSED`, and drop the socket.
/// Takes `store_mutex` exactly once for the whole open-set rather than
/// once per pathname.
pub fn teardown(
    registry: &Registry,
    store: &crate::store::Store,
    log: &crate::logsink::LogSink,
    mut session: Session,
    cause: Option<&str>,
) {
    let id = session.id;
    let pathnames: Vec<Vec<u8>> = session.open_set.drain().collect();
    if !pathnames.is_empty() {
        let mut guard = store.lock();
        let mut any_lock_released = false;
        for pathname in &pathnames {
            let effect = guard.close_entry(pathname, id);
            any_lock_released |= effect.released_lock;
        }
        drop(guard);
        if any_lock_released {
            store.notify_lock_released();
        }
    }
    log.connection_closed(id, cause);
    registry.finalize_removal();
    // `session.socket` is dropped here, closing the underlying fd.
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_sends_ready_and_registers_session() {
        let (server_side, mut client_side) = UnixStream::pair().unwrap();
        let registry = Registry::new(1);
        let id = registry.admit(server_side).unwrap();
        assert_eq!(registry.live_count(), 1);
        assert!(registry.take(id).is_some());

        let mut buf = [0u8; 64];
        let n = std::io::Read::read(&mut client_side, &mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("220"));
    }

    #[test]
    fn admit_rejects_once_at_capacity() {
        let registry = Registry::new(1);
        let (a, _ca) = UnixStream::pair().unwrap();
        let (b, mut cb) = UnixStream::pair().unwrap();

        assert!(registry.admit(a).is_some());
        assert!(registry.admit(b).is_none());

        let mut buf = [0u8; 64];
        let n = std::io::Read::read(&mut cb, &mut buf).unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("421"));
    }

    #[test]
    fn handoff_round_trips_through_registry() {
        let registry = Registry::new(2);
        let (a, _ca) = UnixStream::pair().unwrap();
        let id = registry.admit(a).unwrap();
        registry.push_ready(id);
        assert_eq!(registry.wait_for_ready(), Some(id));
    }

    #[test]
    fn wait_for_ready_returns_none_after_quit_with_empty_queue() {
        let registry = Registry::new(2);
        registry.set_quit();
        assert_eq!(registry.wait_for_ready(), None);
    }
}
