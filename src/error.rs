//! Crate-wide error types.
//!
//! Consensus code propagates errors with `?`. Errors the node can't recover
//! from locally (I/O failures, corrupt data, inconsistent consensus state)
//! bubble out of the event loop and abort the process, since continuing
//! would risk diverging replicas.

/// A sraft error.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// An internal invariant violation, e.g. inconsistent consensus state.
    /// Always a bug; fatal to the node.
    Internal(String),
    /// Invalid data, e.g. a malformed wire frame or corrupt log record.
    InvalidData(String),
    /// Invalid user input, e.g. a bad configuration value.
    InvalidInput(String),
    /// An IO error, e.g. a failed disk write or broken peer channel.
    IO(String),
}

/// Constructs an `Error::InvalidData` for the given format string, wrapped in
/// an `Err` result.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => {
        Err($crate::error::Error::InvalidData(format!($($args)*)).into())
    };
}

/// Constructs an `Error::InvalidInput` for the given format string, wrapped in
/// an `Err` result.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => {
        Err($crate::error::Error::InvalidInput(format!($($args)*)).into())
    };
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::ParseLevelError> for Error {
    fn from(err: log::ParseLevelError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<log::SetLoggerError> for Error {
    fn from(err: log::SetLoggerError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(err: std::num::ParseIntError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::net::AddrParseError> for Error {
    fn from(err: std::net::AddrParseError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    fn from(err: crossbeam::channel::SendError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<crossbeam::channel::RecvError> for Error {
    fn from(err: crossbeam::channel::RecvError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

/// A sraft result returning `Error`.
pub type Result<T> = std::result::Result<T, Error>;
