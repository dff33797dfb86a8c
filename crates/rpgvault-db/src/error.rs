//! Error types for the data layer.
//!
//! Three boundaries, three enums:
//!
//! - [`StoreError`] is the outcome of a single gateway call. It travels back
//!   to the tick thread as a value and carries its own retry classification.
//! - [`SchemaError`] is fatal at startup.
//! - [`DbError`] covers pool setup and teardown.

use sqlx::error::ErrorKind;

/// `SQLite` primary result code for a busy database file.
const SQLITE_BUSY: &str = "5";

/// `SQLite` primary result code for a locked table.
const SQLITE_LOCKED: &str = "6";

/// Errors returned by a storage gateway call.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A transient I/O or locking failure. Safe to retry.
    #[error("transient storage error: {message}")]
    Transient {
        /// Driver-level description.
        message: String,
    },

    /// The call did not finish within the operation timeout. Safe to retry.
    #[error("storage operation timed out after {elapsed_ms} ms")]
    Timeout {
        /// The timeout that was exceeded, in milliseconds.
        elapsed_ms: u64,
    },

    /// The stored revision has moved ahead of the snapshot's base revision.
    #[error("revision conflict: stored {stored_revision}, snapshot based on {base_revision}")]
    Conflict {
        /// Revision currently held by the durable store.
        stored_revision: u64,
        /// Revision the snapshot was based on.
        base_revision: u64,
    },

    /// A constraint violation. Not retryable.
    #[error("constraint violation: {message}")]
    Constraint {
        /// Driver-level description.
        message: String,
    },

    /// A row did not match the expected shape (missing column, bad type).
    #[error("schema mismatch: {message}")]
    Schema {
        /// Driver-level description.
        message: String,
    },

    /// A JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether retrying the same call may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    /// Short label used in structured log fields.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Timeout { .. } => "timeout",
            Self::Conflict { .. } => "conflict",
            Self::Constraint { .. } => "constraint",
            Self::Schema { .. } => "schema",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let message = err.to_string();
        match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Transient { message },
            sqlx::Error::Database(db) => {
                let code = db.code();
                if matches!(code.as_deref(), Some(SQLITE_BUSY | SQLITE_LOCKED)) {
                    return Self::Transient { message };
                }
                match db.kind() {
                    ErrorKind::UniqueViolation
                    | ErrorKind::ForeignKeyViolation
                    | ErrorKind::NotNullViolation
                    | ErrorKind::CheckViolation => Self::Constraint { message },
                    _ => Self::Schema { message },
                }
            }
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::Decode(_) => Self::Schema { message },
            _ => Self::Transient { message },
        }
    }
}

/// Errors raised by the schema manager. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// The database was written by a newer build.
    #[error("schema version {found} is newer than supported version {supported}")]
    TooNew {
        /// Version recorded in the database.
        found: u32,
        /// Highest version this build knows.
        supported: u32,
    },

    /// A numbered migration step failed; the previous version is intact.
    #[error("migration {version} ({description}) failed: {source}")]
    MigrationFailed {
        /// Version the step would have produced.
        version: u32,
        /// Step description.
        description: &'static str,
        /// The underlying driver error.
        source: sqlx::Error,
    },

    /// Reading or creating the version marker failed.
    #[error("schema bootstrap failed: {0}")]
    Bootstrap(#[from] sqlx::Error),

    /// The stored version marker is not a valid version number.
    #[error("invalid stored schema version {0}")]
    InvalidVersion(i64),
}

/// Errors that can occur while setting up or tearing down the store.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `SQLite` operation failed.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Creating the database directory failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_timeout_retry() {
        assert!(
            StoreError::Transient {
                message: String::from("disk I/O error")
            }
            .is_retryable()
        );
        assert!(StoreError::Timeout { elapsed_ms: 5000 }.is_retryable());
        assert!(
            !StoreError::Conflict {
                stored_revision: 4,
                base_revision: 2
            }
            .is_retryable()
        );
        assert!(
            !StoreError::Constraint {
                message: String::from("NOT NULL")
            }
            .is_retryable()
        );
        assert!(
            !StoreError::Schema {
                message: String::from("no such column")
            }
            .is_retryable()
        );
    }

    #[test]
    fn sqlx_errors_are_classified() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(StoreError::from(sqlx::Error::WorkerCrashed).is_retryable());
        let err = StoreError::from(sqlx::Error::ColumnNotFound(String::from("inventory")));
        assert_eq!(err.kind(), "schema");
    }
}
