use std::fmt::Display;
use std::io;

/// CinderDB errors.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// The store has been closed; no further operations are accepted.
    Closed,
    /// Invalid on-disk data: truncated records, bad magic, checksum mismatch.
    Corruption(String),
    /// Invalid caller input, typically a key that cannot be indexed.
    InvalidInput(String),
    /// An IO error.
    Io(String),
    /// The bucket table would need more than 2^32 entries.
    IndexTooLarge,
    /// The key is already present; content-addressed keys are written once.
    KeyExists,
    /// A stored key prefix would exceed the 255 byte limit.
    KeyTooLong(usize),
    /// A bucket or primary position outside the valid range.
    OutOfBounds,
    /// A lock was poisoned by a panicking thread.
    MutexPoisoned,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Closed => write!(f, "store is closed"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::IndexTooLarge => write!(f, "index size exceeds 32 bits"),
            Error::KeyExists => write!(f, "key already exists"),
            Error::KeyTooLong(len) => write!(f, "stored key of {len} bytes exceeds 255"),
            Error::OutOfBounds => write!(f, "position out of bounds"),
            Error::MutexPoisoned => write!(f, "lock poisoned by panicked thread"),
        }
    }
}

impl Error {
    /// Constructs an `Error::Corruption` from anything displayable.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Constructs an `Error::InvalidInput` from anything displayable.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }
}

/// A CinderDB Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Io(err.to_string())
    }
}
