//! # Error Types
//!
//! Domain-specific error types for caldera-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  caldera-core errors (this file)                                       │
//! │  ├── CoreError        - General domain errors                          │
//! │  ├── RecurrenceError  - RRULE / timezone input that cannot be expanded │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  caldera-db errors (separate crate)                                    │
//! │  └── DbError          - Store + Writer failures (NotFound, ...)        │
//! │                                                                         │
//! │  caldera-sync errors (separate crate)                                  │
//! │  └── SyncError        - Protocol, auth, transport failures             │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → DbError → UI                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design Principles
//! 1. Use `thiserror` for derive macros (not manual impl)
//! 2. Include context in error messages (rule text, field name, etc.)
//! 3. Errors are enum variants, never String
//! 4. A `RecurrenceError` never destroys state: callers keep what they had

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Core domain errors.
///
/// These errors represent calendar rule violations or expansion failures.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The operation does not fit the shape of the event.
    ///
    /// ## When This Occurs
    /// - Editing a single occurrence of a non-recurring event
    /// - Splitting a series at or before its first occurrence
    /// - Adding an RRULE to an exception event
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Recurrence input could not be expanded.
    #[error("Recurrence error: {0}")]
    Recurrence(#[from] RecurrenceError),

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

impl CoreError {
    /// Creates an InvalidState error.
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        CoreError::InvalidState(reason.into())
    }
}

// =============================================================================
// Recurrence Error
// =============================================================================

/// Errors raised while expanding or rewriting a recurrence rule.
///
/// ## Corrupt Input Is Never Destructive
/// ```text
/// RRULE:FREQ=SOMETIMES
///      │
///      ▼
/// expand() → Err(InvalidRule)
///      │
///      ▼
/// Regeneration skipped: stored occurrences untouched, 0 new reported
/// ```
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecurrenceError {
    /// The RRULE text is malformed or rejected by the expansion engine.
    #[error("Invalid recurrence rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    /// The event references a timezone that is not in the IANA database.
    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    /// A date-time value inside the rule could not be read.
    #[error("Invalid date-time value: {0}")]
    InvalidDateTime(String),
}

impl RecurrenceError {
    /// Creates an InvalidRule error.
    pub fn invalid_rule(rule: impl Into<String>, reason: impl Into<String>) -> Self {
        RecurrenceError::InvalidRule {
            rule: rule.into(),
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
///
/// These errors occur when user input doesn't meet requirements.
/// Used for early validation before the Writer opens a transaction.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., unknown timezone, malformed UID).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Event ends before it starts.
    #[error("end ({end}) is before start ({start})")]
    EndBeforeStart { start: String, end: String },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = RecurrenceError::invalid_rule("FREQ=SOMETIMES", "unknown frequency");
        assert_eq!(
            err.to_string(),
            "Invalid recurrence rule 'FREQ=SOMETIMES': unknown frequency"
        );

        let err = CoreError::invalid_state("event is not recurring");
        assert_eq!(err.to_string(), "Invalid state: event is not recurring");
    }

    #[test]
    fn test_validation_error_messages() {
        let err = ValidationError::Required {
            field: "summary".to_string(),
        };
        assert_eq!(err.to_string(), "summary is required");

        let err = ValidationError::TooLong {
            field: "uid".to_string(),
            max: 255,
        };
        assert_eq!(err.to_string(), "uid must be at most 255 characters");
    }

    #[test]
    fn test_validation_converts_to_core_error() {
        let validation_err = ValidationError::Required {
            field: "calendar_id".to_string(),
        };
        let core_err: CoreError = validation_err.into();
        assert!(matches!(core_err, CoreError::Validation(_)));

        let core_err: CoreError = RecurrenceError::UnknownTimezone("Mars/Olympus".into()).into();
        assert!(matches!(core_err, CoreError::Recurrence(_)));
    }
}
