//! # Repository Module
//!
//! Read-side repositories and the connection-level queries the Writer
//! composes into transactions.
//!
//! ## Two Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Layers                                    │
//! │                                                                         │
//! │  UI / sync engine                                                      │
//! │       │                                                                 │
//! │       │  db.occurrences().in_range(start, end, None)                   │
//! │       ▼                                                                 │
//! │  XxxRepository (pool-backed, one statement per call)                   │
//! │  ├── get / list / in_range / eligible ...                              │
//! │       │                                                                 │
//! │       │                                                                 │
//! │  Writer ──► pub(crate) fn xxx(conn: &mut SqliteConnection, ...)        │
//! │             (run inside the Writer's transaction)                       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Event rows are only ever written through the Writer.
//!
//! ## Available Repositories
//!
//! - [`CalendarRepository`](calendar::CalendarRepository) - Local and remote calendars
//! - [`EventRepository`](event::EventRepository) - Event lookups
//! - [`OccurrenceRepository`](occurrence::OccurrenceRepository) - Materialized schedule
//! - [`PendingOperationRepository`](pending::PendingOperationRepository) - Outbound queue

pub mod calendar;
pub mod event;
pub mod occurrence;
pub mod pending;
