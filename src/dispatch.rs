//! Command dispatcher: one handler per command, each running its
//! preconditions and store mutation under a single `store_mutex`
//! critical section.

use std::time::{Duration, Instant};

use parking_lot::MutexGuard;

use crate::codec::records::emit_data_record;
use crate::codec::request::{Command, Request};
use crate::error::{DispatchError, ResponseCode};
use crate::logsink::LogSink;
use crate::session::{Registry, Session, SessionId};
use crate::store::{run_eviction, CreateOutcome, EvictedFile, Store, StoreInner};

/// How long `LOCK`/`OPENL` will block waiting for a contested lock
/// before giving up with 556.
const LOCK_WAIT_BOUND: Duration = Duration::from_secs(4);

/// A successful dispatch outcome: the response code/description/data a
/// worker writes back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub code: ResponseCode,
    pub description: String,
    pub data: Vec<u8>,
}

impl DispatchOutcome {
    fn with_data(code: ResponseCode, data: Vec<u8>) -> Self {
        DispatchOutcome {
            description: code.default_description().to_string(),
            code,
            data,
        }
    }

    fn ok(data: Vec<u8>) -> Self {
        Self::with_data(ResponseCode::Ok, data)
    }

    fn ok_empty() -> Self {
        Self::ok(Vec::new())
    }
}

/// Dispatch one request against `store` on behalf of `session`.
pub fn dispatch(
    req: &Request,
    session: &mut Session,
    store: &Store,
    registry: &Registry,
    log: &LogSink,
) -> Result<DispatchOutcome, DispatchError> {
    match req.cmd {
        Command::Open => handle_open(req, session, store),
        Command::OpenC => handle_openc(req, session, store, log, None),
        Command::OpenL => handle_openl(req, session, store, registry),
        Command::OpenCl => {
            let id = session.id;
            handle_openc(req, session, store, log, Some(id))
        }
        Command::Close => handle_close(req, session, store),
        Command::Lock => handle_lock(req, session, store, registry),
        Command::Unlock => handle_unlock(req, session, store),
        Command::Read => handle_read(req, session, store),
        Command::ReadN => handle_readn(req, session, store),
        Command::Write => handle_write(req, session, store, log),
        Command::Append => handle_append(req, session, store, log),
        Command::Remove => handle_remove(req, session, store),
        Command::Quit => Ok(DispatchOutcome::with_data(ResponseCode::Closing, Vec::new())),
    }
}

fn handle_open(req: &Request, session: &mut Session, store: &Store) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let mut guard = store.lock();
    if guard.get(pathname).is_none() {
        return Err(DispatchError::code(ResponseCode::NotFound));
    }
    if session.open_set.insert(pathname.clone()) {
        guard.increment_open_count(pathname);
    }
    Ok(DispatchOutcome::ok_empty())
}

fn handle_openc(
    req: &Request,
    session: &mut Session,
    store: &Store,
    log: &LogSink,
    lock_holder: Option<SessionId>,
) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let mut guard = store.lock();
    if guard.files_cap() == 0 {
        return Err(DispatchError::code(ResponseCode::QuotaExceeded));
    }
    match guard.create(pathname, lock_holder) {
        CreateOutcome::AlreadyExists => return Err(DispatchError::code(ResponseCode::AlreadyExists)),
        CreateOutcome::Pending => return Err(DispatchError::code(ResponseCode::CannotPerform)),
        CreateOutcome::Created => {}
    }
    session.open_set.insert(pathname.clone());

    let evicted = run_eviction_logged(&mut guard, log)?;
    Ok(DispatchOutcome::ok(evicted_to_data(&evicted)?))
}

fn handle_openl(
    req: &Request,
    session: &mut Session,
    store: &Store,
    registry: &Registry,
) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let mut guard = store.lock();
    if guard.get(pathname).is_none() {
        return Err(DispatchError::code(ResponseCode::NotFound));
    }
    if session.open_set.insert(pathname.clone()) {
        guard.increment_open_count(pathname);
    }
    acquire_lock_blocking(store, guard, pathname, session.id, registry)?;
    Ok(DispatchOutcome::ok_empty())
}

fn handle_close(req: &Request, session: &mut Session, store: &Store) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let mut guard = store.lock();
    if guard.get_raw(pathname).is_none() {
        return Err(DispatchError::code(ResponseCode::NotFound));
    }
    if !session.open_set.contains(pathname) {
        return Err(DispatchError::code(ResponseCode::CannotPerform));
    }
    let effect = guard.close_entry(pathname, session.id);
    drop(guard);
    session.open_set.remove(pathname);
    if effect.released_lock {
        store.notify_lock_released();
    }
    Ok(DispatchOutcome::ok_empty())
}

fn handle_lock(
    req: &Request,
    session: &mut Session,
    store: &Store,
    registry: &Registry,
) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let guard = store.lock();
    if guard.get(pathname).is_none() {
        return Err(DispatchError::code(ResponseCode::NotFound));
    }
    if !session.open_set.contains(pathname) {
        return Err(DispatchError::code(ResponseCode::CannotPerform));
    }
    acquire_lock_blocking(store, guard, pathname, session.id, registry)?;
    Ok(DispatchOutcome::ok_empty())
}

fn handle_unlock(req: &Request, session: &mut Session, store: &Store) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let mut guard = store.lock();
    let Some(entry) = guard.get(pathname) else {
        return Err(DispatchError::code(ResponseCode::NotFound));
    };
    if !session.open_set.contains(pathname) {
        return Err(DispatchError::code(ResponseCode::CannotPerform));
    }
    if entry.lock_holder != Some(session.id) {
        return Err(DispatchError::code(ResponseCode::NoAccess));
    }
    guard.get_mut(pathname).expect("checked above").lock_holder = None;
    drop(guard);
    store.notify_lock_released();
    Ok(DispatchOutcome::ok_empty())
}

fn handle_read(req: &Request, session: &mut Session, store: &Store) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let guard = store.lock();
    let Some(entry) = guard.get(pathname) else {
        return Err(DispatchError::code(ResponseCode::NotFound));
    };
    if !session.open_set.contains(pathname) {
        return Err(DispatchError::code(ResponseCode::CannotPerform));
    }
    if !entry.lock_available_to(session.id) {
        return Err(DispatchError::code(ResponseCode::NoAccess));
    }
    let mut data = Vec::new();
    let bytes = entry.payload.clone().unwrap_or_default();
    emit_data_record(&mut data, pathname, &bytes)
        .map_err(|_| DispatchError::Internal("response buffer cap exceeded".into()))?;
    Ok(DispatchOutcome::ok(data))
}

fn handle_readn(req: &Request, session: &Session, store: &Store) -> Result<DispatchOutcome, DispatchError> {
    let n = req
        .arg_i64()
        .map_err(|_| DispatchError::code(ResponseCode::Syntax))?;
    let guard = store.lock();
    let mut data = Vec::new();
    let mut emitted = 0i64;
    for entry in guard.iter_visible() {
        if n > 0 && emitted >= n {
            break;
        }
        if !entry.lock_available_to(session.id) {
            continue;
        }
        let bytes = entry.payload.clone().unwrap_or_default();
        emit_data_record(&mut data, &entry.pathname, &bytes)
            .map_err(|_| DispatchError::Internal("response buffer cap exceeded".into()))?;
        emitted += 1;
    }
    Ok(DispatchOutcome::ok(data))
}

fn handle_write(
    req: &Request,
    session: &mut Session,
    store: &Store,
    log: &LogSink,
) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let mut guard = store.lock();
    if req.data.len() as u64 > guard.bytes_cap() {
        return Err(DispatchError::code(ResponseCode::QuotaExceeded));
    }
    let Some(entry) = guard.get(pathname) else {
        return Err(DispatchError::code(ResponseCode::NotFound));
    };
    if !session.open_set.contains(pathname) || entry.payload.is_some() {
        return Err(DispatchError::code(ResponseCode::CannotPerform));
    }
    if entry.lock_holder != Some(session.id) {
        return Err(DispatchError::code(ResponseCode::NoAccess));
    }

    guard.commit_payload(pathname, req.data.clone());
    let evicted = protect_and_evict(&mut guard, pathname, log)?;
    Ok(DispatchOutcome::ok(evicted_to_data(&evicted)?))
}

fn handle_append(
    req: &Request,
    session: &mut Session,
    store: &Store,
    log: &LogSink,
) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let mut guard = store.lock();
    let Some(entry) = guard.get(pathname) else {
        return Err(DispatchError::code(ResponseCode::NotFound));
    };
    let prospective_size = entry.size() + req.data.len() as u64;
    if prospective_size > guard.bytes_cap() {
        return Err(DispatchError::code(ResponseCode::QuotaExceeded));
    }
    if !session.open_set.contains(pathname) || entry.payload.is_none() {
        return Err(DispatchError::code(ResponseCode::CannotPerform));
    }
    if !entry.lock_available_to(session.id) {
        return Err(DispatchError::code(ResponseCode::NoAccess));
    }

    guard.append_payload(pathname, &req.data);
    let evicted = protect_and_evict(&mut guard, pathname, log)?;
    Ok(DispatchOutcome::ok(evicted_to_data(&evicted)?))
}

fn handle_remove(req: &Request, session: &mut Session, store: &Store) -> Result<DispatchOutcome, DispatchError> {
    let pathname = &req.arg;
    let mut guard = store.lock();
    let Some(entry) = guard.get(pathname) else {
        return Err(DispatchError::code(ResponseCode::NotFound));
    };
    if !session.open_set.contains(pathname) {
        return Err(DispatchError::code(ResponseCode::CannotPerform));
    }
    if entry.lock_holder != Some(session.id) {
        return Err(DispatchError::code(ResponseCode::NoAccess));
    }
    guard.mark_delete(pathname);
    drop(guard);
    store.notify_lock_released();
    Ok(DispatchOutcome::ok_empty())
}

/// Block until `pathname`'s lock is available to `holder`, acquiring it
/// before returning. Re-checks the entry's visibility on every wake,
/// since `mark_delete` or eviction may have hidden it while we slept.
fn acquire_lock_blocking<'a>(
    store: &'a Store,
    mut guard: MutexGuard<'a, StoreInner>,
    pathname: &[u8],
    holder: SessionId,
    registry: &Registry,
) -> Result<MutexGuard<'a, StoreInner>, DispatchError> {
    let deadline = Instant::now() + LOCK_WAIT_BOUND;
    loop {
        let available = match guard.get(pathname) {
            None => return Err(DispatchError::code(ResponseCode::NotFound)),
            Some(e) => e.lock_available_to(holder),
        };
        if available {
            guard.get_mut(pathname).expect("checked above").lock_holder = Some(holder);
            return Ok(guard);
        }
        if registry.quit() {
            return Err(DispatchError::code(ResponseCode::CannotPerform));
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(DispatchError::code(ResponseCode::CannotPerform));
        }
        store.wait_for_lock_released(&mut guard, deadline - now);
    }
}

fn run_eviction_logged(guard: &mut StoreInner, log: &LogSink) -> Result<Vec<EvictedFile>, DispatchError> {
    run_eviction(guard, || log.capacity_miss(), |p, s| log.rejected_file(p, s))
        .map_err(|_| DispatchError::Internal("eviction could not make room".into()))
}

/// Run eviction while protecting `pathname` from being chosen as its own
/// victim: detach it from the FIFO queue before evicting, then reinsert
/// at (approximately) its original position.
fn protect_and_evict(
    guard: &mut StoreInner,
    pathname: &[u8],
    log: &LogSink,
) -> Result<Vec<EvictedFile>, DispatchError> {
    let slot = guard.fifo_remove(pathname);
    let evicted = run_eviction_logged(guard, log);
    if let Some(index) = slot {
        guard.fifo_reinsert(index, pathname.to_vec());
    }
    evicted
}

fn evicted_to_data(evicted: &[EvictedFile]) -> Result<Vec<u8>, DispatchError> {
    let mut data = Vec::new();
    for file in evicted {
        emit_data_record(&mut data, &file.pathname, &file.bytes)
            .map_err(|_| DispatchError::Internal("response buffer cap exceeded".into()))?;
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::records::parse_data_field;
    use crate::codec::ParseOutcome;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;

    fn req(cmd: Command, arg: &[u8], data: &[u8]) -> Request {
        Request {
            cmd,
            arg: arg.to_vec(),
            data: data.to_vec(),
        }
    }

    fn harness() -> (Store, Registry, LogSink, Session) {
        let store = Store::new(2, 100);
        let registry = Registry::new(4);
        let dir = tempfile::tempdir().unwrap();
        let log = LogSink::open(&dir.path().join("test.log"), false).unwrap();
        let (server_side, _client_side) = UnixStream::pair().unwrap();
        let id = registry.admit(server_side).unwrap();
        let session = registry.take(id).unwrap();
        (store, registry, log, session)
    }

    #[test]
    fn create_write_read_close_quit_round_trip() {
        let (store, registry, log, mut session) = harness();

        let out = dispatch(&req(Command::OpenCl, b"/a", b""), &mut session, &store, &registry, &log).unwrap();
        assert_eq!(out.code, ResponseCode::Ok);

        let out = dispatch(&req(Command::Write, b"/a", b"hello"), &mut session, &store, &registry, &log).unwrap();
        assert_eq!(out.code, ResponseCode::Ok);
        assert!(out.data.is_empty());

        let out = dispatch(&req(Command::Read, b"/a", b""), &mut session, &store, &registry, &log).unwrap();
        let ParseOutcome::Complete(records, _) = parse_data_field(&out.data).unwrap() else {
            panic!("expected a complete record");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pathname, b"/a");
        assert_eq!(records[0].bytes, b"hello");

        let out = dispatch(&req(Command::Close, b"/a", b""), &mut session, &store, &registry, &log).unwrap();
        assert_eq!(out.code, ResponseCode::Ok);

        let out = dispatch(&req(Command::Quit, b"", b""), &mut session, &store, &registry, &log).unwrap();
        assert_eq!(out.code, ResponseCode::Closing);
    }

    #[test]
    fn write_without_lock_is_no_access() {
        let (store, registry, log, mut session) = harness();
        dispatch(&req(Command::OpenC, b"/a", b""), &mut session, &store, &registry, &log).unwrap();
        let err = dispatch(&req(Command::Write, b"/a", b"x"), &mut session, &store, &registry, &log).unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(ResponseCode::NoAccess, _)));
    }

    #[test]
    fn openc_over_zero_file_cap_is_quota_exceeded() {
        let store = Store::new(0, 100);
        let registry = Registry::new(4);
        let dir = tempfile::tempdir().unwrap();
        let log = LogSink::open(&dir.path().join("test.log"), false).unwrap();
        let (server_side, _client) = UnixStream::pair().unwrap();
        let id = registry.admit(server_side).unwrap();
        let mut session = registry.take(id).unwrap();

        let err = dispatch(&req(Command::OpenC, b"/a", b""), &mut session, &store, &registry, &log).unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(ResponseCode::QuotaExceeded, _)));
    }

    #[test]
    fn eviction_returns_evicted_file_on_write() {
        let (store, registry, log, mut session) = harness();
        dispatch(&req(Command::OpenCl, b"/a", b""), &mut session, &store, &registry, &log).unwrap();
        dispatch(&req(Command::Write, b"/a", &[b'A'; 60]), &mut session, &store, &registry, &log).unwrap();
        dispatch(&req(Command::Close, b"/a", b""), &mut session, &store, &registry, &log).unwrap();

        dispatch(&req(Command::OpenCl, b"/b", b""), &mut session, &store, &registry, &log).unwrap();
        let out = dispatch(&req(Command::Write, b"/b", &[b'B'; 50]), &mut session, &store, &registry, &log).unwrap();

        let ParseOutcome::Complete(records, _) = parse_data_field(&out.data).unwrap() else {
            panic!("expected a complete record");
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pathname, b"/a");
        assert_eq!(records[0].bytes, vec![b'A'; 60]);
    }

    #[test]
    fn remove_while_referenced_hides_then_frees_on_last_close() {
        let (store, registry, log, mut s1) = harness();
        let (server_side, _client) = UnixStream::pair().unwrap();
        let id2 = registry.admit(server_side).unwrap();
        let mut s2 = registry.take(id2).unwrap();

        dispatch(&req(Command::OpenCl, b"/y", b""), &mut s1, &store, &registry, &log).unwrap();
        dispatch(&req(Command::Open, b"/y", b""), &mut s2, &store, &registry, &log).unwrap();

        let out = dispatch(&req(Command::Remove, b"/y", b""), &mut s1, &store, &registry, &log).unwrap();
        assert_eq!(out.code, ResponseCode::Ok);

        let err = dispatch(&req(Command::Read, b"/y", b""), &mut s2, &store, &registry, &log).unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(ResponseCode::NotFound, _)));

        let out = dispatch(&req(Command::Close, b"/y", b""), &mut s2, &store, &registry, &log).unwrap();
        assert_eq!(out.code, ResponseCode::Ok);
        assert!(store.lock().get_raw(b"/y").is_none());
    }

    #[test]
    fn lock_blocks_until_holder_unlocks_then_acquires() {
        let (store, registry, log, mut s1) = harness();
        let (server_side, _client) = UnixStream::pair().unwrap();
        let id2 = registry.admit(server_side).unwrap();
        let mut s2 = registry.take(id2).unwrap();

        dispatch(&req(Command::OpenL, b"/x", b""), &mut s1, &store, &registry, &log).unwrap();
        dispatch(&req(Command::Open, b"/x", b""), &mut s2, &store, &registry, &log).unwrap();

        let store = Arc::new(store);
        let store_bg = Arc::clone(&store);
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            let mut guard = store_bg.lock();
            guard.get_mut(b"/x").unwrap().lock_holder = None;
            drop(guard);
            store_bg.notify_lock_released();
        });

        let out = dispatch(&req(Command::Lock, b"/x", b""), &mut s2, &store, &registry, &log).unwrap();
        assert_eq!(out.code, ResponseCode::Ok);
        releaser.join().unwrap();
    }

    #[test]
    fn lock_wait_aborts_once_shutdown_is_requested() {
        let (store, registry, log, mut s1) = harness();
        let (server_side, _client) = UnixStream::pair().unwrap();
        let id2 = registry.admit(server_side).unwrap();
        let mut s2 = registry.take(id2).unwrap();

        dispatch(&req(Command::OpenL, b"/x", b""), &mut s1, &store, &registry, &log).unwrap();
        dispatch(&req(Command::Open, b"/x", b""), &mut s2, &store, &registry, &log).unwrap();
        registry.set_quit();

        let err = dispatch(&req(Command::Lock, b"/x", b""), &mut s2, &store, &registry, &log).unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(ResponseCode::CannotPerform, _)));
    }

    #[test]
    fn readn_nonpositive_returns_all_visible_files() {
        let (store, registry, log, mut session) = harness();
        dispatch(&req(Command::OpenCl, b"/a", b""), &mut session, &store, &registry, &log).unwrap();
        dispatch(&req(Command::Write, b"/a", b"1"), &mut session, &store, &registry, &log).unwrap();
        dispatch(&req(Command::OpenCl, b"/b", b""), &mut session, &store, &registry, &log).unwrap();
        dispatch(&req(Command::Write, b"/b", b"22"), &mut session, &store, &registry, &log).unwrap();

        let out = dispatch(&req(Command::ReadN, b"0", b""), &mut session, &store, &registry, &log).unwrap();
        let ParseOutcome::Complete(records, _) = parse_data_field(&out.data).unwrap() else {
            panic!("expected a complete record list");
        };
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn readn_bad_argument_is_syntax_error() {
        let (store, registry, log, mut session) = harness();
        let err = dispatch(&req(Command::ReadN, b"not-a-number", b""), &mut session, &store, &registry, &log)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Protocol(ResponseCode::Syntax, _)));
    }
}
