//! Process signal handling: `SIGINT`/`SIGQUIT` request a hard shutdown,
//! `SIGHUP` a soft one. Handlers only flip atomics — the acceptor's
//! poll loop observes them on its 5-second timer and translates them
//! into the registry's shutdown flags.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static QUIT_REQUESTED: AtomicBool = AtomicBool::new(false);
static NO_MORE_CONNECTIONS_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_hard_shutdown(_signum: i32) {
    QUIT_REQUESTED.store(true, Ordering::SeqCst);
}

extern "C" fn on_soft_shutdown(_signum: i32) {
    NO_MORE_CONNECTIONS_REQUESTED.store(true, Ordering::SeqCst);
}

/// Install handlers for `SIGINT`, `SIGQUIT`, `SIGHUP`. Must be called
/// once, before the acceptor starts polling.
pub fn install() -> nix::Result<()> {
    let hard = SigAction::new(SigHandler::Handler(on_hard_shutdown), SaFlags::empty(), SigSet::empty());
    let soft = SigAction::new(SigHandler::Handler(on_soft_shutdown), SaFlags::empty(), SigSet::empty());
    // SAFETY: the handlers only perform an atomic store, which is
    // async-signal-safe.
    unsafe {
        signal::sigaction(Signal::SIGINT, &hard)?;
        signal::sigaction(Signal::SIGQUIT, &hard)?;
        signal::sigaction(Signal::SIGHUP, &soft)?;
    }
    Ok(())
}

pub fn quit_requested() -> bool {
    QUIT_REQUESTED.load(Ordering::SeqCst)
}

pub fn no_more_connections_requested() -> bool {
    NO_MORE_CONNECTIONS_REQUESTED.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_setters_are_observable() {
        on_hard_shutdown(0);
        assert!(quit_requested());
        on_soft_shutdown(0);
        assert!(no_more_connections_requested());
    }
}
