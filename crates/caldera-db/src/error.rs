//! # Database Error Types
//!
//! Error types for store and Writer operations.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  SQLite Error (sqlx::Error)        CoreError (validation, state)       │
//! │       │                                 │                               │
//! │       └───────────────┬─────────────────┘                               │
//! │                       ▼                                                 │
//! │  DbError (this module) ← Adds context and categorization               │
//! │       │                                                                 │
//! │       ├── NotFound / InvalidState → thrown to the immediate caller     │
//! │       │                                                                 │
//! │       └── everything else → transaction rolled back, nothing changed   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use caldera_core::CoreError;
use thiserror::Error;

/// Database and Writer errors.
///
/// These errors wrap sqlx errors and provide additional context
/// for debugging and user feedback.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    ///
    /// ## When This Occurs
    /// - `fetch_optional` returns no rows
    /// - Event is soft-deleted (PendingDelete)
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The operation does not fit the event.
    ///
    /// ## When This Occurs
    /// - editSingleOccurrence on a non-recurring event
    /// - splitSeries at or before the first occurrence
    /// - Moving an exception event on its own
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Input rejected before the transaction opened.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Duplicate master UID
    /// - Second exception for the same (master, instance)
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    ///
    /// ## When This Occurs
    /// - Creating an event in a calendar that doesn't exist
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// Database connection failed.
    ///
    /// ## When This Occurs
    /// - Database file doesn't exist and can't be created
    /// - File permissions issue
    /// - Disk full
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Transaction failed.
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// A stored value could not be decoded (e.g., malformed EXDATE JSON).
    #[error("Corrupt {field} on {id}: {reason}")]
    Corrupt {
        field: String,
        id: String,
        reason: String,
    },

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    /// Creates a NotFound error for a given entity type and ID.
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a UniqueViolation error.
    pub fn duplicate(field: impl Into<String>, value: impl Into<String>) -> Self {
        DbError::UniqueViolation {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Creates an InvalidState error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        DbError::InvalidState(reason.into())
    }

    /// Creates a Corrupt error.
    pub fn corrupt(field: impl Into<String>, id: impl Into<String>, reason: impl ToString) -> Self {
        DbError::Corrupt {
            field: field.into(),
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns true for precondition failures the caller is expected to check.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            DbError::NotFound { .. } | DbError::InvalidState(_) | DbError::Validation(_)
        )
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // UNIQUE constraint: "UNIQUE constraint failed: <table>.<column>"
                // FK constraint: "FOREIGN KEY constraint failed"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

/// Core errors keep their category.
impl From<CoreError> for DbError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidState(reason) => DbError::InvalidState(reason),
            CoreError::Validation(e) => DbError::Validation(e.to_string()),
            CoreError::Recurrence(e) => DbError::InvalidState(e.to_string()),
        }
    }
}

impl From<caldera_core::ValidationError> for DbError {
    fn from(err: caldera_core::ValidationError) -> Self {
        DbError::Validation(err.to_string())
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_errors_keep_category() {
        let err: DbError = CoreError::invalid_state("not recurring").into();
        assert!(matches!(err, DbError::InvalidState(_)));
        assert!(err.is_precondition());

        let err: DbError = caldera_core::ValidationError::Required {
            field: "summary".into(),
        }
        .into();
        assert!(matches!(err, DbError::Validation(_)));
    }

    #[test]
    fn test_not_found_message() {
        let err = DbError::not_found("Event", "evt-1");
        assert_eq!(err.to_string(), "Event not found: evt-1");
        assert!(!DbError::PoolExhausted.is_precondition());
    }
}
