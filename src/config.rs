//! Configuration file parsing.
//!
//! The file is a flat list of `KEY=VALUE` lines; unknown keys are a
//! hard error rather than being silently ignored.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ServiceError;

/// Default listening socket path.
pub const DEFAULT_SOCKET_FILE_NAME: &str = "/tmp/file_storage.sk";
/// Default number of files the store may hold.
pub const DEFAULT_FILES_MAX_NUM: u32 = 1000;
/// Default storage size cap, in MiB.
pub const DEFAULT_STORAGE_MAX_SIZE_MIB: u64 = 64;
/// Default simultaneous-session cap.
pub const DEFAULT_MAX_CONN: u32 = 16;
/// Default worker thread pool size.
pub const DEFAULT_WORKER_THREADS_NUM: u32 = 4;

const MIB: u64 = 1 << 20;

/// Populated configuration, ready to build a [`crate::service::Service`] from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Listening socket path.
    pub socket_file_name: PathBuf,
    /// Log file path.
    pub log_file_name: PathBuf,
    /// `files_cap`: maximum number of files the store may hold at once.
    pub files_max_num: u32,
    /// `bytes_cap`: maximum total bytes of file payloads, in bytes (already scaled from MiB).
    pub storage_max_size: u64,
    /// Maximum number of simultaneously live sessions.
    pub max_conn: u32,
    /// Number of worker threads in the pool.
    pub worker_threads_num: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket_file_name: PathBuf::from(DEFAULT_SOCKET_FILE_NAME),
            log_file_name: default_log_file_name(),
            files_max_num: DEFAULT_FILES_MAX_NUM,
            storage_max_size: DEFAULT_STORAGE_MAX_SIZE_MIB * MIB,
            max_conn: DEFAULT_MAX_CONN,
            worker_threads_num: DEFAULT_WORKER_THREADS_NUM,
        }
    }
}

fn default_log_file_name() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_else(|| "/root".into());
    Path::new(&home).join(".file_storage").join("file_storage.log")
}

impl Config {
    /// Parse a `KEY=VALUE` configuration file, falling back to defaults
    /// for any key that is absent. Unknown keys are a hard error.
    pub fn load(path: &Path) -> Result<Config, ServiceError> {
        let text = fs::read_to_string(path)
            .map_err(|e| ServiceError::Config(format!("reading {}: {e}", path.display())))?;
        Config::parse(&text)
    }

    /// Parse configuration text directly (split out for unit testing).
    pub fn parse(text: &str) -> Result<Config, ServiceError> {
        let mut config = Config::default();
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                ServiceError::Config(format!("line {}: missing '=': {raw_line:?}", lineno + 1))
            })?;
            let key = key.trim();
            let value = value.trim();
            match key {
                "SOCKET_FILE_NAME" => config.socket_file_name = PathBuf::from(value),
                "LOG_FILE_NAME" => config.log_file_name = PathBuf::from(value),
                "FILES_MAX_NUM" => config.files_max_num = parse_u32(key, value, lineno)?,
                "STORAGE_MAX_SIZE" => {
                    let mib = parse_u64(key, value, lineno)?;
                    config.storage_max_size = mib * MIB;
                }
                "MAX_CONN" => config.max_conn = parse_u32(key, value, lineno)?,
                "WORKER_THREADS_NUM" => config.worker_threads_num = parse_u32(key, value, lineno)?,
                other => {
                    return Err(ServiceError::Config(format!(
                        "line {}: unknown configuration key {other:?}",
                        lineno + 1
                    )))
                }
            }
        }
        Ok(config)
    }
}

fn parse_u32(key: &str, value: &str, lineno: usize) -> Result<u32, ServiceError> {
    value
        .parse()
        .map_err(|_| ServiceError::Config(format!("line {}: {key}={value:?} is not a u32", lineno + 1)))
}

fn parse_u64(key: &str, value: &str, lineno: usize) -> Result<u64, ServiceError> {
    value
        .parse()
        .map_err(|_| ServiceError::Config(format!("line {}: {key}={value:?} is not a u64", lineno + 1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.files_max_num, DEFAULT_FILES_MAX_NUM);
        assert_eq!(config.storage_max_size, DEFAULT_STORAGE_MAX_SIZE_MIB * MIB);
        assert_eq!(config.max_conn, DEFAULT_MAX_CONN);
        assert_eq!(config.worker_threads_num, DEFAULT_WORKER_THREADS_NUM);
    }

    #[test]
    fn overrides_and_comments() {
        let text = "\
# a comment
SOCKET_FILE_NAME=/tmp/custom.sk
FILES_MAX_NUM=10
STORAGE_MAX_SIZE=1
MAX_CONN=2
WORKER_THREADS_NUM=3
";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.socket_file_name, PathBuf::from("/tmp/custom.sk"));
        assert_eq!(config.files_max_num, 10);
        assert_eq!(config.storage_max_size, MIB);
        assert_eq!(config.max_conn, 2);
        assert_eq!(config.worker_threads_num, 3);
    }

    #[test]
    fn unknown_key_is_an_error() {
        let err = Config::parse("NOT_A_KEY=1").unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[test]
    fn missing_equals_is_an_error() {
        let err = Config::parse("FILES_MAX_NUM").unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));
    }
}
