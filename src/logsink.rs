//! Log sink: append structured event lines to a file, callable from
//! any thread.
//!
//! Two write paths share the same file: the structurally-required
//! lines below are written directly by the components that own those
//! events, through an `Arc<LogSink>` handle, guaranteeing their exact
//! wire format; `LogSink` additionally implements [`log::Log`] so
//! ordinary `log::info!`/`warn!`/`error!` diagnostics elsewhere in the
//! crate land in the same file.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;

use crate::error::ServiceError;
use crate::session::SessionId;

/// Append-only structured log file.
pub struct LogSink {
    file: Mutex<File>,
    mirror_stderr: bool,
}

impl LogSink {
    /// Open (creating if absent, and creating parent directories) the
    /// log file at `path`. `mirror_stderr` additionally echoes every
    /// line to stderr, for `--foreground` runs.
    pub fn open(path: &Path, mirror_stderr: bool) -> Result<Self, ServiceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(ServiceError::LogFile)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(ServiceError::LogFile)?;
        Ok(LogSink {
            file: Mutex::new(file),
            mirror_stderr,
        })
    }

    fn write_line(&self, line: &str) {
        let stamped = format!("{} {line}\n", timestamp());
        let mut f = self.file.lock();
        let _ = f.write_all(stamped.as_bytes());
        drop(f);
        if self.mirror_stderr {
            eprint!("{stamped}");
        }
    }

    pub fn server_started(&self) {
        self.write_line("SERVER_PROCESS_STARTED");
    }

    pub fn server_terminated(&self) {
        self.write_line("SERVER_PROCESS_TERMINATED");
    }

    pub fn connection_opened(&self, id: SessionId) {
        self.write_line(&format!("CONNECTION_OPENED: {id}"));
    }

    pub fn connection_closed(&self, id: SessionId, cause: Option<&str>) {
        match cause {
            Some(reason) => self.write_line(&format!("CONNECTION_CLOSED: {id} ({reason})")),
            None => self.write_line(&format!("CONNECTION_CLOSED: {id}")),
        }
    }

    /// One line per dispatched command: `<thread-id>: <handle> <CMD>
    /// <ARG> <SUCCESS|FAILURE> [(<bytes>|<reason>)]`.
    pub fn command_result(&self, id: SessionId, cmd: &str, arg: &str, outcome: Result<u64, &str>) {
        let thread_id = current_thread_id();
        match outcome {
            Ok(bytes) => self.write_line(&format!("{thread_id}: {id} {cmd} {arg} SUCCESS ({bytes})")),
            Err(reason) => self.write_line(&format!("{thread_id}: {id} {cmd} {arg} FAILURE ({reason})")),
        }
    }

    pub fn capacity_miss(&self) {
        self.write_line("CAPACITY_MISS");
    }

    pub fn rejected_file(&self, pathname: &[u8], size: u64) {
        self.write_line(&format!(
            "REJECTED_FILE: {} ({size})",
            String::from_utf8_lossy(pathname)
        ));
    }
}

impl log::Log for LogSink {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        self.write_line(&format!("{}: {}", record.level(), record.args()));
    }

    fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}

/// Thin `log::Log` wrapper around the shared `Arc<LogSink>` also held by
/// [`crate::service::Service`], so `log::info!`/`warn!`/`error!` land in
/// the same file as the structurally-required lines.
struct GlobalLog(std::sync::Arc<LogSink>);

impl log::Log for GlobalLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        self.0.log(record);
    }

    fn flush(&self) {
        self.0.flush();
    }
}

/// Install `log` to route through `sink`. Must be called at most once
/// per process, before the acceptor starts polling.
pub fn install_global_logger(sink: std::sync::Arc<LogSink>) -> Result<(), log::SetLoggerError> {
    log::set_boxed_logger(Box::new(GlobalLog(sink)))?;
    log::set_max_level(log::LevelFilter::Info);
    Ok(())
}

fn current_thread_id() -> u64 {
    // SAFETY: pthread_self takes no arguments and cannot fail.
    unsafe { libc::pthread_self() as u64 }
}

fn timestamp() -> String {
    // SAFETY: `time` and `localtime_r` are called with valid,
    // stack-owned out-parameters per their contract.
    unsafe {
        let mut raw: libc::time_t = 0;
        libc::time(&mut raw);
        let mut tm: libc::tm = std::mem::zeroed();
        libc::localtime_r(&raw, &mut tm);
        format!("{:02}:{:02}:{:02}", tm.tm_hour, tm.tm_min, tm.tm_sec)
    }
}
