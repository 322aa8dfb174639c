//! # Sync Error Types
//!
//! Error types for sync operations.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Sync Error Categories                             │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │   Transport     │  │     Protocol            │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Network        │  │  NotFound               │ │
//! │  │  InvalidUrl     │  │  Timeout        │  │  Conflict (412/409)     │ │
//! │  │  ConfigLoad/Save│  │                 │  │  AuthFailure/Forbidden  │ │
//! │  └─────────────────┘  └─────────────────┘  │  RateLimited            │ │
//! │                                            │  ServerError            │ │
//! │  ┌─────────────────┐  ┌─────────────────┐  │  ResponseTooLarge       │ │
//! │  │    Database     │  │     Queue       │  │  InvalidResponse        │ │
//! │  │                 │  │                 │  │  NotCalDav              │ │
//! │  │  DatabaseError  │  │  MaxRetries     │  │  InvalidSyncToken       │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Who Handles What
//! - Transport and rate-limit errors go back to the queue for backoff.
//! - `Conflict` goes to the conflict resolver, never to backoff.
//! - `AuthFailure` stops the pass and is surfaced to the user.
//! - `Forbidden` is a per-resource refusal; it counts as a failed attempt.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Sync error type covering all possible sync failures.
#[derive(Debug, Error)]
pub enum SyncError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid sync configuration.
    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    /// Invalid server or resource URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// Connection refused, reset, DNS failure...
    #[error("Network error: {0}")]
    Network(String),

    /// Request did not complete in time.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// The resource does not exist on the server (404/410).
    #[error("Not found on server: {0}")]
    NotFound(String),

    /// ETag precondition failed (412, or 409 on some servers).
    ///
    /// ## When This Occurs
    /// - PUT with `If-Match` after someone else changed the resource
    /// - PUT with `If-None-Match: *` on a URL that already exists
    /// - DELETE with a stale `If-Match`
    #[error("Precondition failed for {url}")]
    Conflict { url: String },

    /// Credentials rejected (401 after the challenge was answered).
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// The server refused this request (403) even though we authenticated.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// 429/503; `retry_after` is the server-requested delay.
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Any other non-success status.
    #[error("Server error: HTTP {status}")]
    ServerError { status: u16 },

    /// Body exceeded the configured cap.
    #[error("Response larger than {limit} bytes")]
    ResponseTooLarge { limit: usize },

    /// Malformed XML or iCalendar.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The server does not advertise `calendar-access`.
    #[error("Server at {0} does not support CalDAV")]
    NotCalDav(String),

    /// Sync token rejected; a full listing is required.
    #[error("Sync token no longer valid")]
    InvalidSyncToken,

    // =========================================================================
    // Database Errors
    // =========================================================================
    /// Local store failure.
    #[error("Database error: {0}")]
    DatabaseError(String),

    // =========================================================================
    // Queue Errors
    // =========================================================================
    /// Maximum retry attempts exceeded.
    #[error("Max retries exceeded for operation {id}: {last_error}")]
    MaxRetriesExceeded { id: String, last_error: String },

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal sync agent error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Agent is shutting down.
    #[error("Sync agent is shutting down")]
    ShuttingDown,

    /// Another pass of this agent is still running.
    #[error("A sync pass is already running")]
    PassInProgress,

    /// Channel send/receive failed.
    #[error("Channel error: {0}")]
    ChannelError(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<caldera_db::DbError> for SyncError {
    fn from(err: caldera_db::DbError) -> Self {
        SyncError::DatabaseError(err.to_string())
    }
}

impl From<url::ParseError> for SyncError {
    fn from(err: url::ParseError) -> Self {
        SyncError::InvalidUrl(err.to_string())
    }
}

/// Convert reqwest errors to SyncError.
///
/// ## Error Mapping
/// ```text
/// timeout         → SyncError::Timeout
/// builder / url   → SyncError::InvalidUrl
/// anything else   → SyncError::Network
/// ```
impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout(0)
        } else if err.is_builder() {
            SyncError::InvalidUrl(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<roxmltree::Error> for SyncError {
    fn from(err: roxmltree::Error) -> Self {
        SyncError::InvalidResponse(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(err: toml::de::Error) -> Self {
        SyncError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SyncError {
    fn from(err: toml::ser::Error) -> Self {
        SyncError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization (for retry logic)
// =============================================================================

impl SyncError {
    /// Returns true if the operation can be retried with backoff.
    ///
    /// ## Retryable Errors
    /// - Network failures and timeouts
    /// - 5xx responses
    /// - Rate limiting
    ///
    /// ## Non-Retryable Errors
    /// - Configuration errors
    /// - ETag conflicts (resolver's job)
    /// - Authentication failures (user's job)
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network(_) | SyncError::Timeout(_) | SyncError::RateLimited { .. } => true,
            SyncError::ServerError { status } => *status >= 500,
            SyncError::DatabaseError(_) => true,
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidConfig(_)
                | SyncError::InvalidUrl(_)
                | SyncError::ConfigLoadFailed(_)
                | SyncError::ConfigSaveFailed(_)
        )
    }

    /// Returns true if the server answered but not the way we needed.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            SyncError::NotFound(_)
                | SyncError::Conflict { .. }
                | SyncError::AuthFailure(_)
                | SyncError::Forbidden(_)
                | SyncError::RateLimited { .. }
                | SyncError::ServerError { .. }
                | SyncError::ResponseTooLarge { .. }
                | SyncError::InvalidResponse(_)
                | SyncError::NotCalDav(_)
                | SyncError::InvalidSyncToken
        )
    }

    /// Server-requested delay for a rate-limited call.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Returns true for ETag precondition failures.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncError::Conflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(SyncError::Network("connection reset".into()).is_retryable());
        assert!(SyncError::Timeout(30).is_retryable());
        assert!(SyncError::ServerError { status: 502 }.is_retryable());
        assert!(SyncError::RateLimited { retry_after: None }.is_retryable());

        assert!(!SyncError::ServerError { status: 400 }.is_retryable());
        assert!(!SyncError::InvalidConfig("bad config".into()).is_retryable());
        assert!(!SyncError::AuthFailure("401".into()).is_retryable());
        assert!(!SyncError::Forbidden("403".into()).is_retryable());
        assert!(SyncError::Forbidden("403".into()).is_protocol_error());
        assert!(!SyncError::Conflict { url: "/a.ics".into() }.is_retryable());
    }

    #[test]
    fn test_conflict_is_not_not_found() {
        let conflict = SyncError::Conflict { url: "/a.ics".into() };
        assert!(conflict.is_conflict());
        assert!(!SyncError::NotFound("/a.ics".into()).is_conflict());
        assert!(conflict.to_string().contains("/a.ics"));
    }

    #[test]
    fn test_retry_after() {
        let err = SyncError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert!(err.is_protocol_error());
        assert_eq!(SyncError::Timeout(5).retry_after(), None);
    }
}
