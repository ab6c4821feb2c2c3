//! Acceptor: multiplexes readiness over the listening socket, every
//! idle client socket, and the return-pipe read end with `nix::poll`,
//! handing ready sessions to the worker pool via
//! [`crate::session::Registry::push_ready`].

use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::sync::Arc;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::error::ServiceError;
use crate::service::Service;
use crate::session::SessionId;
use crate::signals;

/// Acceptor wakes on this period even with nothing ready, so it can
/// re-check the shutdown flags.
const POLL_TIMEOUT_MS: u16 = 5_000;

/// The write end of the self-pipe workers use to hand a session back to
/// the acceptor. Cheap to clone (an `Arc` around the underlying fd): the
/// fd itself closes once every worker's clone has been dropped, which is
/// how the last worker signals the acceptor to stop.
#[derive(Clone)]
pub struct ReturnPipe(Arc<OwnedFd>);

impl ReturnPipe {
    /// Post `id` back to the acceptor's poll set.
    pub fn notify(&self, id: SessionId) -> nix::Result<()> {
        nix::unistd::write(self.0.as_raw_fd(), &id.as_raw().to_ne_bytes())?;
        Ok(())
    }
}

enum Role {
    Listener,
    Pipe,
    Idle(RawFd),
}

pub struct Acceptor {
    listener: UnixListener,
    pipe_read: OwnedFd,
    idle: Vec<RawFd>,
}

impl Acceptor {
    /// Bind the listening socket and create the return-pipe, returning
    /// the acceptor and the write handle workers will use.
    pub fn bind(path: &Path) -> Result<(Acceptor, ReturnPipe), ServiceError> {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        let listener = UnixListener::bind(path).map_err(ServiceError::Bind)?;
        let (pipe_read, pipe_write) = nix::unistd::pipe().map_err(|e| ServiceError::Bind(io::Error::from(e)))?;
        Ok((
            Acceptor {
                listener,
                pipe_read,
                idle: Vec::new(),
            },
            ReturnPipe(Arc::new(pipe_write)),
        ))
    }

    /// Run the readiness loop until a hard shutdown (`SIGINT`/`SIGQUIT`)
    /// is observed. A soft shutdown (`SIGHUP`) only drops the listening
    /// socket from the poll set; existing and idle sessions keep being
    /// serviced.
    pub fn run(&mut self, service: &Service) {
        loop {
            if signals::quit_requested() {
                service.registry.set_quit();
            }
            if signals::no_more_connections_requested() {
                service.registry.set_no_more_connections();
            }
            if service.registry.quit() {
                return;
            }
            let accepting = !service.registry.no_more_connections();

            let mut roles = Vec::with_capacity(self.idle.len() + 2);
            let mut pollfds = Vec::with_capacity(self.idle.len() + 2);

            if accepting {
                pollfds.push(PollFd::new(self.listener.as_fd(), PollFlags::POLLIN));
                roles.push(Role::Listener);
            }
            pollfds.push(PollFd::new(self.pipe_read.as_fd(), PollFlags::POLLIN));
            roles.push(Role::Pipe);

            // SAFETY: every fd in `self.idle` names a session whose
            // `UnixStream` is kept alive by the registry for as long as
            // the fd appears here (it is removed the moment a worker
            // takes the session, before the fd could be closed).
            let idle_fds: Vec<RawFd> = self.idle.clone();
            let idle_borrowed: Vec<BorrowedFd<'_>> =
                idle_fds.iter().map(|&fd| unsafe { BorrowedFd::borrow_raw(fd) }).collect();
            for (bfd, raw) in idle_borrowed.iter().zip(&idle_fds) {
                pollfds.push(PollFd::new(*bfd, PollFlags::POLLIN));
                roles.push(Role::Idle(*raw));
            }

            let n = match poll(&mut pollfds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => {
                    log::error!("poll failed: {e}");
                    continue;
                }
            };
            if n == 0 {
                continue; // 5s timer: just re-check shutdown flags next iteration.
            }

            let mut pipe_closed = false;
            let mut newly_ready: Vec<RawFd> = Vec::new();

            for (pollfd, role) in pollfds.iter().zip(&roles) {
                let revents = pollfd.revents().unwrap_or_else(PollFlags::empty);
                if revents.is_empty() {
                    continue;
                }
                match role {
                    Role::Listener => self.accept_one(service),
                    Role::Pipe => {
                        if self.drain_return_pipe() {
                            pipe_closed = true;
                        }
                    }
                    Role::Idle(fd) => newly_ready.push(*fd),
                }
            }

            for fd in newly_ready {
                if let Some(pos) = self.idle.iter().position(|&f| f == fd) {
                    self.idle.remove(pos);
                }
                // A fd may be reported ready by both a just-drained
                // return-pipe entry and a stale poll event in the same
                // batch; `push_ready` on a duplicate is harmless, C7 just
                // hands the same session to a worker twice in a row, and
                // the second dequeue finds it already checked out.
                service.registry.push_ready(SessionId::from_raw(fd));
            }

            if pipe_closed {
                return;
            }
        }
    }

    fn accept_one(&mut self, service: &Service) {
        match self.listener.accept() {
            Ok((stream, _addr)) => {
                if let Some(id) = service.registry.admit(stream) {
                    service.log.connection_opened(id);
                    self.idle.push(id.as_raw());
                }
            }
            Err(e) => log::warn!("accept failed: {e}"),
        }
    }

    /// Read every complete `(RawFd)` record currently buffered in the
    /// return-pipe, appending each to `self.idle`. Returns whether the
    /// write end has been closed (zero-byte read).
    fn drain_return_pipe(&mut self) -> bool {
        let mut buf = [0u8; 256];
        loop {
            match nix::unistd::read(self.pipe_read.as_raw_fd(), &mut buf) {
                Ok(0) => return true,
                Ok(n) => {
                    debug_assert_eq!(n % 4, 0, "return-pipe writes are always 4-byte fd records");
                    for chunk in buf[..n].chunks_exact(4) {
                        let fd = RawFd::from_ne_bytes(chunk.try_into().expect("chunk is exactly 4 bytes"));
                        self.idle.push(fd);
                    }
                    if n < buf.len() {
                        return false;
                    }
                }
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::EAGAIN) => return false,
                Err(e) => {
                    log::error!("return-pipe read failed: {e}");
                    return false;
                }
            }
        }
    }
}
