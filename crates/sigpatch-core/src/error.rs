use serde::Serialize;
use strum::{Display, IntoStaticStr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Address {address:#x} is below the minimum valid address {minimum:#x}")]
    OutOfRange { address: u64, minimum: u64 },

    #[error("Stack slot {index:#x} is outside the captured stack ({depth:#x} words)")]
    StackIndexOutOfRange { index: usize, depth: usize },

    #[error("Address arithmetic overflowed: {base:#x} + ({delta})")]
    Overflow { base: u64, delta: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pattern mismatch at {address:#x}")]
    PatternMismatch { address: u64 },

    #[error("Prologue mismatch at {address:#x}")]
    PrologueMismatch { address: u64 },

    #[error("Target {target:#x} is out of 32-bit range from {origin:#x}")]
    DisplacementOutOfRange { target: u64, origin: u64 },

    #[error("Unknown fixup target: {0}")]
    UnknownTarget(String),

    #[error("Region {first_start:#x}..{first_end:#x} overlaps {second_start:#x}..{second_end:#x}")]
    Overlap {
        first_start: u64,
        first_end: u64,
        second_start: u64,
        second_end: u64,
    },

    #[error("Memory fault at {address:#x} (size: {size})")]
    Fault { address: u64, size: usize },

    #[error("Entry '{name}': {source}")]
    Entry {
        name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of [`Error`], stable enough to record in pipeline state
/// and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, IntoStaticStr)]
pub enum ErrorKind {
    InvalidConfiguration,
    OutOfRange,
    Overflow,
    NotFound,
    PatternMismatch,
    PrologueMismatch,
    DisplacementOutOfRange,
    UnknownTarget,
    Overlap,
    Fault,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidConfiguration(_) | Error::Io(_) | Error::Json(_) | Error::Toml(_) => {
                ErrorKind::InvalidConfiguration
            }
            Error::OutOfRange { .. } | Error::StackIndexOutOfRange { .. } => ErrorKind::OutOfRange,
            Error::Overflow { .. } => ErrorKind::Overflow,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::PatternMismatch { .. } => ErrorKind::PatternMismatch,
            Error::PrologueMismatch { .. } => ErrorKind::PrologueMismatch,
            Error::DisplacementOutOfRange { .. } => ErrorKind::DisplacementOutOfRange,
            Error::UnknownTarget(_) => ErrorKind::UnknownTarget,
            Error::Overlap { .. } => ErrorKind::Overlap,
            Error::Fault { .. } => ErrorKind::Fault,
            Error::Entry { source, .. } => source.kind(),
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::InvalidConfiguration(message.into())
    }

    /// Attach the name of the table entry or template being processed.
    pub(crate) fn in_entry(self, name: impl Into<String>) -> Self {
        Error::Entry {
            name: name.into(),
            source: Box::new(self),
        }
    }

    /// True when a profile or image path does not exist, as opposed to a
    /// lookup that found nothing in memory ([`ErrorKind::NotFound`]).
    pub fn is_missing_file(&self) -> bool {
        matches!(self, Error::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}
