//! Error types for pack building stages.
//!
//! Errors are stage-specific to keep diagnostics precise. All enums are
//! `#[non_exhaustive]` to allow adding variants without breaking callers;
//! consumers should include a fallback match arm.
//!
//! # Design Notes
//! - I/O errors preserve their source to keep diagnostics actionable.
//! - Consistency-check failures (object or delta size drifting between
//!   preparation and emission, write-order coverage) carry the observed and
//!   expected values.

use std::fmt;
use std::io;

use super::object_id::ObjectId;

/// Errors from the backing object store.
#[derive(Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The store could not supply an object by id.
    NotFound(ObjectId),
    /// I/O error while reading from the store.
    Io(io::Error),
    /// The stored object is malformed.
    Corrupt { detail: &'static str },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "object {id} not found"),
            Self::Io(err) => write!(f, "store I/O error: {err}"),
            Self::Corrupt { detail } => write!(f, "corrupt object: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Errors from configuration loading.
#[derive(Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A configuration value was negative where a size is required.
    Negative { key: &'static str, value: i64 },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negative { key, value } => {
                write!(f, "invalid configuration: {key} = {value} (must be >= 0)")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Errors from pack preparation and emission.
#[derive(Debug)]
#[non_exhaustive]
pub enum PackError {
    /// The backing store failed a lookup.
    Store(StoreError),
    /// A tree payload could not be parsed during `insert_tree`.
    CorruptTree { detail: &'static str },
    /// An object's payload length changed between metadata and read.
    ObjectSizeChanged {
        id: ObjectId,
        expected: u64,
        actual: u64,
    },
    /// A delta recomputed at write time did not match the search result.
    DeltaSizeChanged {
        id: ObjectId,
        expected: u64,
        actual: u64,
    },
    /// The write-order planner did not cover every object.
    InvalidWriteOrder { planned: u32, total: u32 },
    /// The sink rejected bytes.
    Io(io::Error),
    /// A worker thread could not be spawned.
    Thread(io::Error),
    /// Configuration was malformed.
    Config(ConfigError),
}

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(err) => write!(f, "{err}"),
            Self::CorruptTree { detail } => write!(f, "corrupt tree: {detail}"),
            Self::ObjectSizeChanged {
                id,
                expected,
                actual,
            } => write!(
                f,
                "object {id} length changed: expected {expected}, read {actual}"
            ),
            Self::DeltaSizeChanged {
                id,
                expected,
                actual,
            } => write!(
                f,
                "delta for {id} changed size: expected {expected}, got {actual}"
            ),
            Self::InvalidWriteOrder { planned, total } => {
                write!(f, "invalid write order: planned {planned} of {total}")
            }
            Self::Io(err) => write!(f, "sink I/O error: {err}"),
            Self::Thread(err) => write!(f, "unable to create thread: {err}"),
            Self::Config(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for PackError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            Self::Io(err) | Self::Thread(err) => Some(err),
            Self::Config(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for PackError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

impl From<io::Error> for PackError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ConfigError> for PackError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}
