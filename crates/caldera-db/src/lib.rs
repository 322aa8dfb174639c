//! # caldera-db: Local Store for Caldera
//!
//! This crate owns the SQLite database: calendars, events, the materialized
//! occurrence table and the outbound operation queue. Every event mutation
//! goes through the [`Writer`].
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Caldera Data Flow                                │
//! │                                                                         │
//! │  Calendar UI (month view, editor)        caldera-sync (SyncAgent)      │
//! │       │ reads           │ edits                  │ apply_remote /       │
//! │       │                 │                        │ mark_synced          │
//! │       ▼                 ▼                        ▼                      │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   caldera-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │    Writer     │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │ (writer.rs)   │    │  (embedded)  │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ per-event lock│    │ 001_init.sql │  │   │
//! │  │   │ Repositories  │    │ one tx/change │    │              │  │   │
//! │  │   └───────────────┘    └───────┬───────┘    └──────────────┘  │   │
//! │  │                                │ schedule.rs                   │   │
//! │  │                                ▼ (occurrence regeneration)     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Read-side repositories and transaction-level queries
//! - [`schedule`] - Occurrence materialization
//! - [`writer`] - The mutation engine
//!
//! ## Usage
//!
//! ```rust,ignore
//! use caldera_db::{Database, DbConfig, WriterConfig};
//!
//! let db = Database::new(DbConfig::new("path/to/caldera.db")).await?;
//! let writer = db.writer(WriterConfig::default(), Arc::new(SystemClock));
//!
//! let cal = db.calendars().create_local("Personal").await?;
//! writer.create(NewEvent::new(&cal.id, "Dentist", start, end)).await?;
//!
//! let month = db.occurrences().in_range(first_day, next_month, None).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;
pub mod schedule;
pub mod writer;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use schedule::{materialization_window, RegenerationReport};
pub use writer::{ApplyOutcome, RemoveOutcome, Writer, WriterConfig};

// Repository re-exports for convenience
pub use repository::calendar::CalendarRepository;
pub use repository::event::EventRepository;
pub use repository::occurrence::OccurrenceRepository;
pub use repository::pending::PendingOperationRepository;

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
pub(crate) mod test_support {
    use caldera_core::{Event, SyncState};
    use chrono::{DateTime, Duration, Utc};

    /// A plain one-hour local event starting at `start`.
    pub(crate) fn event_at(start: DateTime<Utc>) -> Event {
        Event {
            id: "evt-1".to_string(),
            uid: "uid-1@caldera".to_string(),
            calendar_id: "cal-1".to_string(),
            summary: "Test".to_string(),
            description: None,
            location: None,
            start,
            end: start + Duration::hours(1),
            all_day: false,
            timezone: None,
            rrule: None,
            exdates: Vec::new(),
            rdates: Vec::new(),
            sequence: 0,
            sync_state: SyncState::Synced,
            remote_url: None,
            etag: None,
            original_event_id: None,
            original_instance_time: None,
            has_conflict: false,
            created_at: start,
            updated_at: start,
        }
    }
}
