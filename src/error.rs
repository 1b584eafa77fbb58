use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// emberdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation raced with a database shutdown and was aborted. No state
    /// was changed; the caller may retry against a live database.
    Cancelled,
    /// A complete manifest frame failed its checksum or could not be decoded.
    /// Fatal; the store needs operator intervention.
    CorruptManifest(String),
    /// A field was previously registered with a different kind.
    FieldKindMismatch(String),
    /// Invalid data, typically decoding errors, corruption, or unexpected internal values.
    InvalidData(String),
    /// Invalid user input, typically bad configuration or unknown names.
    InvalidInput(String),
    /// A point failed validation: empty metric name or no fields.
    InvalidPoint(String),
    /// An IO error.
    IO(String),
    /// Writing or syncing the manifest journal failed. Fatal at the store
    /// level; never retried.
    ManifestIO(String),
    /// A write would push a metric past its tag-set cardinality limit.
    TooManyTags(String),
    /// The metric's mutable map is younger than the freeze interval.
    TooRecent,
    /// An edit log referenced a family that was never created.
    UnknownFamily(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Cancelled => write!(f, "operation cancelled"),
            Error::CorruptManifest(msg) => write!(f, "corrupt manifest: {msg}"),
            Error::FieldKindMismatch(field) => {
                write!(f, "field kind mismatch for field: {field}")
            }
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::InvalidPoint(msg) => write!(f, "invalid point: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::ManifestIO(msg) => write!(f, "manifest io error: {msg}"),
            Error::TooManyTags(msg) => write!(f, "too many tags: {msg}"),
            Error::TooRecent => write!(f, "metric store is too recent to reset"),
            Error::UnknownFamily(family) => write!(f, "unknown family: {family}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}
