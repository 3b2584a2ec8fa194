use std::fmt::Display;

/// Strata errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// A filesystem or disk failure. The engine remains usable if the WAL
    /// append for the failing operation had already succeeded.
    Io(String),
    /// Invalid on-disk data: bad magic, bad checksum, missing footer.
    /// Tail-truncated WAL records are not corruption and are dropped
    /// silently during recovery.
    Corrupt(String),
    /// A broken internal invariant, such as unsorted input handed to the
    /// SSTable writer or two tables sharing an id. These are programmer
    /// errors; the current operation is aborted.
    Invariant(String),
    /// An operation was issued after `close()`.
    Closed,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::Invariant(msg) => write!(f, "invariant violation: {msg}"),
            Error::Closed => write!(f, "engine is closed"),
        }
    }
}

/// Constructs an Error::Corrupt for the given format string.
#[macro_export]
macro_rules! corrupt {
    ($($args:tt)*) => { $crate::error::Error::Corrupt(format!($($args)*)).into() };
}

/// Constructs an Error::Invariant for the given format string.
#[macro_export]
macro_rules! invariant {
    ($($args:tt)*) => { $crate::error::Error::Invariant(format!($($args)*)).into() };
}

/// A strata Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
