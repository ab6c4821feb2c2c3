//! Crate-wide error types.
//!
//! Mirrors the error taxonomy of the wire protocol: parsing/reader
//! failures, per-command dispatch failures, and service-startup
//! failures each get their own type so call sites can match on the
//! kind of failure rather than stringly-typed errors.

use std::fmt;
use std::io;

/// A failure while parsing a request, response or embedded file-list record.
///
/// `Incomplete` is intentionally not a variant here: the parsers return
/// it as a distinct success-shaped outcome (see [`crate::codec`]),
/// because "read more and retry" is not an error, it is the normal
/// steady state of a partially-received frame.
#[derive(Debug)]
pub enum ProtocolError {
    /// The byte range did not match the grammar of a request/response/record.
    Syntax(String),
    /// A message would need to exceed [`crate::codec::MAX_BUF`] to encode or decode.
    BufferCapExceeded,
    /// Allocating space to hold a parsed value failed.
    OutOfMemory,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Syntax(msg) => write!(f, "syntax error: {msg}"),
            ProtocolError::BufferCapExceeded => write!(f, "message exceeds buffer cap"),
            ProtocolError::OutOfMemory => write!(f, "allocation failure while parsing"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// The outcome of reading one complete frame from a connection.
#[derive(Debug)]
pub enum ReadFrameError {
    /// The peer closed the connection (zero-byte read before a complete frame).
    ConnectionClosed,
    /// An I/O error occurred while reading.
    Io(io::Error),
    /// The frame could not be parsed once it was fully buffered.
    Syntax(String),
    /// The buffer would need to exceed the hard cap to hold the frame.
    BufferCapExceeded,
    /// Allocating the growing buffer failed.
    OutOfMemory,
}

impl fmt::Display for ReadFrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadFrameError::ConnectionClosed => write!(f, "connection closed"),
            ReadFrameError::Io(e) => write!(f, "I/O error: {e}"),
            ReadFrameError::Syntax(msg) => write!(f, "syntax error: {msg}"),
            ReadFrameError::BufferCapExceeded => write!(f, "frame exceeds buffer cap"),
            ReadFrameError::OutOfMemory => write!(f, "allocation failure while reading"),
        }
    }
}

impl std::error::Error for ReadFrameError {}

impl From<io::Error> for ReadFrameError {
    fn from(e: io::Error) -> Self {
        ReadFrameError::Io(e)
    }
}

/// The response code a [`DispatchError`] maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    /// `200` success.
    Ok = 200,
    /// `220` service ready (session admission).
    Ready = 220,
    /// `221` closing (after `QUIT`).
    Closing = 221,
    /// `421` service unavailable.
    ServiceUnavailable = 421,
    /// `501` syntax error.
    Syntax = 501,
    /// `550` not found.
    NotFound = 550,
    /// `552` quota exceeded.
    QuotaExceeded = 552,
    /// `554` no access.
    NoAccess = 554,
    /// `555` already exists.
    AlreadyExists = 555,
    /// `556` operation not possible.
    CannotPerform = 556,
}

impl ResponseCode {
    /// Numeric wire value.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Default human-readable description for a bare code (handlers may
    /// supply a more specific one).
    pub fn default_description(self) -> &'static str {
        match self {
            ResponseCode::Ok => "OK",
            ResponseCode::Ready => "Service ready",
            ResponseCode::Closing => "Closing connection",
            ResponseCode::ServiceUnavailable => "Service not available, closing connection",
            ResponseCode::Syntax => "Syntax error",
            ResponseCode::NotFound => "File not found",
            ResponseCode::QuotaExceeded => "Quota exceeded",
            ResponseCode::NoAccess => "Operation not allowed",
            ResponseCode::AlreadyExists => "File already exists",
            ResponseCode::CannotPerform => "Operation not possible",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The outcome of a single command handler.
///
/// A normal protocol-level failure is `Err(DispatchError::Protocol(code,
/// description))`: the session survives and the worker sends that
/// response. `Err(DispatchError::Internal(reason))` marks an
/// unrecoverable failure: no response is sent and the worker tears down
/// the session.
#[derive(Debug)]
pub enum DispatchError {
    /// A normal, recoverable protocol failure: response code, description.
    Protocol(ResponseCode, String),
    /// An unrecoverable failure; the session is closed without a reply.
    Internal(String),
}

impl DispatchError {
    /// Build a protocol-level failure with the code's default description.
    pub fn code(code: ResponseCode) -> Self {
        DispatchError::Protocol(code, code.default_description().to_string())
    }

    /// Build a protocol-level failure with a specific description.
    pub fn with_description(code: ResponseCode, description: impl Into<String>) -> Self {
        DispatchError::Protocol(code, description.into())
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Protocol(code, descr) => write!(f, "{code} {descr}"),
            DispatchError::Internal(reason) => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// A failure during service startup (config, bind, log file creation).
#[derive(Debug)]
pub enum ServiceError {
    /// The configuration file could not be read or contained an invalid key/value.
    Config(String),
    /// Binding or preparing the listening socket failed.
    Bind(io::Error),
    /// Opening the log file failed.
    LogFile(io::Error),
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Config(msg) => write!(f, "configuration error: {msg}"),
            ServiceError::Bind(e) => write!(f, "failed to bind listening socket: {e}"),
            ServiceError::LogFile(e) => write!(f, "failed to open log file: {e}"),
        }
    }
}

impl std::error::Error for ServiceError {}
