//! Error types for cluster and transaction operations.
//!
//! Socket and parse failures are folded into the kinds below at the
//! executor boundary, so callers only ever match on [`Error`].

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type used throughout the client library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the cluster client.
#[derive(Error, Debug)]
pub enum Error {
    /// None of a node's addresses accepted a connection, or the socket died
    /// while a request was in flight.
    #[error("connection error: {0}")]
    Connection(String),

    /// A response was truncated or malformed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A value could not be laid out in the wire format.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The deadline passed, possibly after partial I/O.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The server answered with a non-OK result code.
    #[error("server returned {code}")]
    Server { code: ResultCode },

    /// No node could be found for a partition and no random fallback exists.
    #[error("cluster unavailable: no node found for namespace {namespace}")]
    ClusterUnavailable { namespace: String },

    /// The caller passed something unusable before any I/O took place.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The cluster handle has already been shut down.
    #[error("cluster has been shut down")]
    Shutdown,
}

impl Error {
    /// Whether the executor may retry the transaction after this error.
    ///
    /// Only transport failures qualify. Server answers and encoding
    /// failures are returned to the caller untouched.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Timeout(_))
    }

    /// The server result code, if this is a server error.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            Error::Server { code } => Some(*code),
            _ => None,
        }
    }

    /// Maps an I/O failure onto the connection/timeout split.
    pub(crate) fn from_io(err: io::Error, context: &str) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                Error::Timeout(format!("{context}: {err}"))
            }
            _ => Error::Connection(format!("{context}: {err}")),
        }
    }
}

/// Result codes carried in the message header of a server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Ok,
    Unknown,
    NotFound,
    Generation,
    Parameter,
    KeyExists,
    BinExists,
    ClusterKeyMismatch,
    PartitionOutOfSpace,
    ServerTimeout,
    NoXdr,
    Unavailable,
    IncompatibleType,
    RecordTooBig,
    KeyBusy,
    ScanAbort,
    UnsupportedFeature,
    BinNotFound,
    Other(u8),
}

impl ResultCode {
    pub fn from_u8(code: u8) -> Self {
        match code {
            0 => ResultCode::Ok,
            1 => ResultCode::Unknown,
            2 => ResultCode::NotFound,
            3 => ResultCode::Generation,
            4 => ResultCode::Parameter,
            5 => ResultCode::KeyExists,
            6 => ResultCode::BinExists,
            7 => ResultCode::ClusterKeyMismatch,
            8 => ResultCode::PartitionOutOfSpace,
            9 => ResultCode::ServerTimeout,
            10 => ResultCode::NoXdr,
            11 => ResultCode::Unavailable,
            12 => ResultCode::IncompatibleType,
            13 => ResultCode::RecordTooBig,
            14 => ResultCode::KeyBusy,
            15 => ResultCode::ScanAbort,
            16 => ResultCode::UnsupportedFeature,
            17 => ResultCode::BinNotFound,
            other => ResultCode::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::Unknown => 1,
            ResultCode::NotFound => 2,
            ResultCode::Generation => 3,
            ResultCode::Parameter => 4,
            ResultCode::KeyExists => 5,
            ResultCode::BinExists => 6,
            ResultCode::ClusterKeyMismatch => 7,
            ResultCode::PartitionOutOfSpace => 8,
            ResultCode::ServerTimeout => 9,
            ResultCode::NoXdr => 10,
            ResultCode::Unavailable => 11,
            ResultCode::IncompatibleType => 12,
            ResultCode::RecordTooBig => 13,
            ResultCode::KeyBusy => 14,
            ResultCode::ScanAbort => 15,
            ResultCode::UnsupportedFeature => 16,
            ResultCode::BinNotFound => 17,
            ResultCode::Other(code) => code,
        }
    }

    pub fn is_ok(self) -> bool {
        self == ResultCode::Ok
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultCode::Other(code) => write!(f, "result code {code}"),
            known => write!(f, "{known:?} ({})", known.as_u8()),
        }
    }
}
