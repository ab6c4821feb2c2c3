//! An in-memory file storage service reachable over a local `AF_UNIX`
//! stream socket: a bounded-capacity keyed file store with per-file
//! locking, served by a master acceptor and a fixed-size worker pool
//! over a text-framed request/response protocol.

pub mod acceptor;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handoff;
pub mod logsink;
pub mod service;
pub mod session;
pub mod signals;
pub mod store;
pub mod worker;

pub use config::Config;
pub use error::ServiceError;
pub use service::Service;
