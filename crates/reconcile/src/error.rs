use std::fmt;

use gipfelbuch_store::{Collection, StoreError};

/// Run-level errors. Any of these stops the run.
#[derive(Debug)]
pub enum ReconcileError {
    /// TOML parse / deserialization error.
    ConfigParse(String),
    /// Config validation error (unknown source, bad threshold, etc.).
    ConfigValidation(String),
    /// A collection names a source that has no loaded records.
    UnknownSource { collection: Collection, source: String },
    /// A source file could not be turned into records.
    SourceLoad { source: String, reason: String },
    /// The entity store is unreachable. Writes already committed for earlier
    /// collections stay committed.
    Store(StoreError),
    /// IO error (file read, etc.).
    Io(String),
}

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigParse(msg) => write!(f, "config parse error: {msg}"),
            Self::ConfigValidation(msg) => write!(f, "config validation error: {msg}"),
            Self::UnknownSource { collection, source } => {
                write!(f, "collection '{collection}': source '{source}' has no data")
            }
            Self::SourceLoad { source, reason } => {
                write!(f, "source '{source}': {reason}")
            }
            Self::Store(err) => write!(f, "{err}"),
            Self::Io(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for ReconcileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Why a single record could not be applied. Never fatal to the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordError {
    /// The record does not have the shape its entity kind requires.
    Shape(String),
    /// A referenced entity does not exist.
    MissingReference { entity: &'static str, reference: String },
    /// A bare name matched more than one entity.
    AmbiguousReference { entity: &'static str, reference: String, matches: usize },
    /// The store rejected the write for this record only.
    Persistence(String),
}

impl RecordError {
    pub fn missing(entity: &'static str, reference: impl Into<String>) -> Self {
        Self::MissingReference { entity, reference: reference.into() }
    }

    /// Short machine-readable category for reports.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Shape(_) => "shape",
            Self::MissingReference { .. } => "missing_reference",
            Self::AmbiguousReference { .. } => "ambiguous_reference",
            Self::Persistence(_) => "persistence",
        }
    }
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shape(msg) => write!(f, "malformed record: {msg}"),
            Self::MissingReference { entity, reference } => {
                write!(f, "{entity} '{reference}' not found")
            }
            Self::AmbiguousReference { entity, reference, matches } => {
                write!(f, "{entity} '{reference}' is ambiguous ({matches} matches)")
            }
            Self::Persistence(msg) => write!(f, "write failed: {msg}"),
        }
    }
}

impl std::error::Error for RecordError {}

/// Result of trying to apply one record: either the record is rejected, or
/// the store went away and the run must stop.
#[derive(Debug)]
pub enum ApplyError {
    Record(RecordError),
    Fatal(StoreError),
}

impl From<RecordError> for ApplyError {
    fn from(err: RecordError) -> Self {
        Self::Record(err)
    }
}

impl From<StoreError> for ApplyError {
    fn from(err: StoreError) -> Self {
        if err.is_fatal() {
            Self::Fatal(err)
        } else {
            Self::Record(RecordError::Persistence(err.to_string()))
        }
    }
}
