// SPDX-License-Identifier: BSD-3-Clause

use std::fmt;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// A server-sent error record, preserved verbatim across the wire (§6.1).
///
/// Every field the server sent is kept, even when this crate has no special handling for
/// the particular `domain`/`code` pair, so that callers re-raising the error to their own
/// users see exactly what the peer reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorRecord {
    pub domain: i32,
    pub code: i32,
    pub level: i32,
    pub str1: Option<String>,
    pub str2: Option<String>,
    pub str3: Option<String>,
    pub int1: i32,
    pub int2: i32,
    pub message: Option<String>,
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(m) => write!(f, "{m}"),
            None => write!(f, "server error (domain={}, code={})", self.domain, self.code),
        }
    }
}

/// The canonical "no such procedure" error code used by the server, reinterpreted as
/// [`Error::Unsupported`] when a call is flagged quiet-missing (§7).
pub const RPC_ERROR_UNKNOWN_PROCEDURE: i32 = 7;

/// Every error kind the core can raise (§7).
#[derive(Debug)]
pub enum Error {
    /// Transport-level I/O failure (socket, pipe, subprocess).
    Transport(std::io::Error),
    /// TLS handshake or record-layer failure.
    Tls(String),
    /// Authentication handshake failure.
    Auth(String),
    /// Frame or header malformed, or a protocol invariant was violated. Fatal for the
    /// connection: the caller must close it.
    Protocol(String),
    /// A reply carrying a server-sent error record.
    Rpc(ErrorRecord),
    /// An operation was attempted on a stream that has already finished or errored.
    Stream(Box<Error>),
    /// Allocation or buffer-sizing failure.
    Memory(String),
    /// Caller passed invalid arguments.
    InvalidArgument(String),
    /// The remote procedure is not implemented by the peer (quiet-missing, §7).
    Unsupported(String),
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Error::Auth(msg.into())
    }

    pub fn tls(msg: impl Into<String>) -> Self {
        Error::Tls(msg.into())
    }

    /// Reinterprets an RPC error as [`Error::Unsupported`] when it is the well-known
    /// "unknown procedure" code and the call requested quiet-missing handling (§7, §8 P8).
    pub fn from_rpc_quiet_missing(record: ErrorRecord, quiet_missing: bool) -> Self {
        if quiet_missing && record.code == RPC_ERROR_UNKNOWN_PROCEDURE {
            Error::Unsupported(record.to_string())
        } else {
            Error::Rpc(record)
        }
    }

    /// A connection-wide "connection lost" error shared by every Call cancelled when the
    /// dispatcher's transport dies (§5 Cancellation).
    pub fn connection_lost(cause: &Error) -> Self {
        Error::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            format!("connection lost: {cause}"),
        ))
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            Error::Stream(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "transport error: {e}"),
            Error::Tls(e) => write!(f, "TLS error: {e}"),
            Error::Auth(e) => write!(f, "authentication error: {e}"),
            Error::Protocol(e) => write!(f, "protocol error: {e}"),
            Error::Rpc(e) => write!(f, "RPC error: {e}"),
            Error::Stream(e) => write!(f, "stream error: {e}"),
            Error::Memory(e) => write!(f, "memory error: {e}"),
            Error::InvalidArgument(e) => write!(f, "invalid argument: {e}"),
            Error::Unsupported(e) => write!(f, "unsupported: {e}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e)
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Transport(std::io::Error::from(e))
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Transport(e) => Error::Transport(std::io::Error::new(e.kind(), e.to_string())),
            Error::Tls(e) => Error::Tls(e.clone()),
            Error::Auth(e) => Error::Auth(e.clone()),
            Error::Protocol(e) => Error::Protocol(e.clone()),
            Error::Rpc(e) => Error::Rpc(e.clone()),
            Error::Stream(e) => Error::Stream(e.clone()),
            Error::Memory(e) => Error::Memory(e.clone()),
            Error::InvalidArgument(e) => Error::InvalidArgument(e.clone()),
            Error::Unsupported(e) => Error::Unsupported(e.clone()),
        }
    }
}
