//! The `Service` aggregate: the store, session registry, log sink and
//! configuration, constructed once in `main` and passed through
//! explicitly rather than reached for as module statics.

use std::path::Path;
use std::sync::Arc;

use crate::config::Config;
use crate::error::ServiceError;
use crate::logsink::LogSink;
use crate::session::Registry;
use crate::store::Store;

pub struct Service {
    pub config: Config,
    pub store: Store,
    pub registry: Registry,
    pub log: Arc<LogSink>,
}

impl Service {
    pub fn new(config: Config) -> Result<Self, ServiceError> {
        let log = Arc::new(LogSink::open(&config.log_file_name, false)?);
        Self::with_log(config, log)
    }

    /// Build a service mirroring stderr diagnostics to the console, for
    /// `--foreground` runs.
    pub fn new_foreground(config: Config) -> Result<Self, ServiceError> {
        let log = Arc::new(LogSink::open(&config.log_file_name, true)?);
        Self::with_log(config, log)
    }

    fn with_log(config: Config, log: Arc<LogSink>) -> Result<Self, ServiceError> {
        let store = Store::new(config.files_max_num, config.storage_max_size);
        let registry = Registry::new(config.max_conn);
        Ok(Service {
            config,
            store,
            registry,
            log,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_file_name
    }
}
