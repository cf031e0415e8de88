use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// emberdb errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// An operation was attempted on a block store before `create` or `open`.
    NotPrepared,
    /// `create` was called on a non-empty byte store.
    Exists,
    /// `open` was called on an empty byte store.
    NotExists,
    /// Invalid on-disk data: bad magic, unknown block type, or a corrupt
    /// node image.
    Malformed(String),
    /// The file's format version does not match the supported version.
    UnsupportedVersion(String),
    /// An attempt to erase the super block.
    Protected,
    /// A payload exceeds the block's (or element's) byte capacity. Carries
    /// the maximum allowed length.
    PayloadTooLarge(usize),
    /// A caller or on-disk state violated a block store contract, e.g. a
    /// reused block that does not start at the free head.
    InvariantViolation(String),
    /// An IO error.
    IO(String),
    /// A tree node's byte budget is too small to hold its elements.
    InsufficientRoom,
    /// No element with the given key.
    NotFound,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::NotPrepared => write!(f, "call create or open before any operation"),
            Error::Exists => write!(f, "byte store already exists"),
            Error::NotExists => write!(f, "byte store does not exist"),
            Error::Malformed(msg) => write!(f, "malformed data: {msg}"),
            Error::UnsupportedVersion(msg) => write!(f, "unsupported version: {msg}"),
            Error::Protected => write!(f, "super block can not be erased"),
            Error::PayloadTooLarge(max) => write!(f, "max payload length is {max}"),
            Error::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::InsufficientRoom => write!(f, "node byte budget too small"),
            Error::NotFound => write!(f, "not found"),
        }
    }
}

/// Constructs an Error::Malformed for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::Malformed(format!($($args)*)).into() };
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

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}
