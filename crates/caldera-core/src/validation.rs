//! # Validation Module
//!
//! Input validation for event mutations.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: UI                                                           │
//! │  └── Basic format checks, immediate feedback                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Writer (before the transaction opens)                        │
//! │  └── THIS MODULE: summary, span, timezone, UID, RRULE shape            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── UNIQUE uid among masters                                          │
//! │  └── Foreign key constraints                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! RRULE checks here are shape-only. A rule that passes but cannot be
//! expanded is stored as-is and handled non-destructively by the expander.
//!
//! ## Usage
//! ```rust
//! use caldera_core::validation::{validate_summary, validate_timezone};
//!
//! validate_summary("Standup").unwrap();
//! validate_timezone("Europe/Berlin").unwrap();
//! assert!(validate_timezone("Mars/Olympus").is_err());
//! ```

use chrono::{DateTime, Utc};

use crate::error::ValidationError;
use crate::types::{parse_timezone, EventPatch, NewEvent};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Maximum summary length.
pub const MAX_SUMMARY_LEN: usize = 1024;

/// Maximum UID length.
pub const MAX_UID_LEN: usize = 255;

// =============================================================================
// Field Validators
// =============================================================================

/// Validates an event summary.
///
/// ## Rules
/// - Must not be empty
/// - At most 1024 characters
pub fn validate_summary(summary: &str) -> ValidationResult<()> {
    let summary = summary.trim();

    if summary.is_empty() {
        return Err(ValidationError::Required {
            field: "summary".to_string(),
        });
    }

    if summary.chars().count() > MAX_SUMMARY_LEN {
        return Err(ValidationError::TooLong {
            field: "summary".to_string(),
            max: MAX_SUMMARY_LEN,
        });
    }

    Ok(())
}

/// Validates that an event does not end before it starts.
pub fn validate_span(start: DateTime<Utc>, end: DateTime<Utc>) -> ValidationResult<()> {
    if end < start {
        return Err(ValidationError::EndBeforeStart {
            start: start.to_rfc3339(),
            end: end.to_rfc3339(),
        });
    }
    Ok(())
}

/// Validates an IANA timezone name.
pub fn validate_timezone(tz: &str) -> ValidationResult<()> {
    parse_timezone(tz).map(|_| ()).map_err(|_| ValidationError::InvalidFormat {
        field: "timezone".to_string(),
        reason: format!("'{}' is not an IANA timezone", tz),
    })
}

/// Validates an iCalendar UID.
///
/// ## Rules
/// - Must not be empty
/// - At most 255 characters
/// - No whitespace or control characters (UIDs end up in resource URLs)
///
/// ## Example
/// ```rust
/// use caldera_core::validation::validate_uid;
///
/// assert!(validate_uid("0d9c5a2e@caldera").is_ok());
/// assert!(validate_uid("has space").is_err());
/// ```
pub fn validate_uid(uid: &str) -> ValidationResult<()> {
    if uid.is_empty() {
        return Err(ValidationError::Required {
            field: "uid".to_string(),
        });
    }

    if uid.len() > MAX_UID_LEN {
        return Err(ValidationError::TooLong {
            field: "uid".to_string(),
            max: MAX_UID_LEN,
        });
    }

    if uid.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ValidationError::InvalidFormat {
            field: "uid".to_string(),
            reason: "must not contain whitespace".to_string(),
        });
    }

    Ok(())
}

/// Validates the shape of an RRULE value.
///
/// ## Rules
/// - Must not be blank
/// - Must contain a `FREQ=` part
pub fn validate_rrule(rrule: &str) -> ValidationResult<()> {
    let rule = rrule.trim();

    if rule.is_empty() {
        return Err(ValidationError::Required {
            field: "rrule".to_string(),
        });
    }

    if !rule.to_ascii_uppercase().contains("FREQ=") {
        return Err(ValidationError::InvalidFormat {
            field: "rrule".to_string(),
            reason: "missing FREQ".to_string(),
        });
    }

    Ok(())
}

/// Validates a calendar id reference.
pub fn validate_calendar_id(id: &str) -> ValidationResult<()> {
    if id.trim().is_empty() {
        return Err(ValidationError::Required {
            field: "calendar_id".to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Input Validators
// =============================================================================

/// Validates a creation draft.
pub fn validate_new_event(draft: &NewEvent) -> ValidationResult<()> {
    validate_calendar_id(&draft.calendar_id)?;
    validate_summary(&draft.summary)?;
    validate_span(draft.start, draft.end)?;
    if let Some(ref uid) = draft.uid {
        validate_uid(uid)?;
    }
    if let Some(ref tz) = draft.timezone {
        validate_timezone(tz)?;
    }
    if let Some(ref rrule) = draft.rrule {
        validate_rrule(rrule)?;
    }
    Ok(())
}

/// Validates the fields a patch sets.
///
/// Empty strings are allowed where they clear a value.
pub fn validate_patch(patch: &EventPatch) -> ValidationResult<()> {
    if let Some(ref summary) = patch.summary {
        validate_summary(summary)?;
    }
    if let (Some(start), Some(end)) = (patch.start, patch.end) {
        validate_span(start, end)?;
    }
    if let Some(ref tz) = patch.timezone {
        if !tz.trim().is_empty() {
            validate_timezone(tz)?;
        }
    }
    if let Some(ref rrule) = patch.rrule {
        if !rrule.trim().is_empty() {
            validate_rrule(rrule)?;
        }
    }
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
