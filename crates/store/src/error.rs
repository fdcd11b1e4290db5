use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The database cannot be reached or opened at all. Fatal for a run.
    Unavailable(String),
    /// A uniqueness constraint rejected the write.
    Constraint { collection: String, key: String },
    /// Any other statement failure on a single document.
    Query(String),
    /// A stored body or timestamp could not be decoded.
    Corrupt { collection: String, id: i64, reason: String },
}

impl StoreError {
    /// Connection-level errors abort the whole run; everything else is local
    /// to the record being written.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::Constraint { collection, key } => {
                write!(f, "{collection}: duplicate natural key '{key}'")
            }
            Self::Query(msg) => write!(f, "store query failed: {msg}"),
            Self::Corrupt { collection, id, reason } => {
                write!(f, "{collection} #{id}: corrupt document ({reason})")
            }
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(
                ErrorCode::CannotOpen
                | ErrorCode::NotADatabase
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::SystemIoFailure
                | ErrorCode::PermissionDenied,
            ) => Self::Unavailable(err.to_string()),
            _ => Self::Query(err.to_string()),
        }
    }
}
