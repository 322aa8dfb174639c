//! # caldera-core: Pure Calendar Logic for Caldera
//!
//! This crate is the **heart** of Caldera. It contains the calendar rules
//! as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Caldera Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    Calendar UI (external)                       │   │
//! │  │    Month view ──► Event editor ──► "Sync now" button           │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ Writer / SyncHandle                    │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ caldera-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │recurrence │  │   queue   │  │ conflict  │  │   │
//! │  │   │   Event   │  │  expand   │  │ coalesce  │  │  resolve  │  │   │
//! │  │   │Occurrence │  │  DST      │  │  backoff  │  │ strategy  │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │            caldera-db (store + Writer)  /  caldera-sync         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Calendar, Event, Occurrence, PendingOperation)
//! - [`recurrence`] - Occurrence Expander (RRULE/EXDATE/RDATE, DST resolution)
//! - [`queue`] - Pending queue rules (coalescing, backoff, eligibility)
//! - [`conflict`] - Conflict Resolver
//! - [`clock`] - Time source abstraction
//! - [`error`] - Domain error types
//! - [`validation`] - Input validation
//!
//! ## Example Usage
//!
//! ```rust
//! use caldera_core::queue::calculate_retry_delay;
//! use chrono::Duration;
//!
//! // 30s × 2^k, capped at 5 hours
//! assert_eq!(calculate_retry_delay(2), Duration::seconds(120));
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod clock;
pub mod conflict;
pub mod error;
pub mod queue;
pub mod recurrence;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use clock::{Clock, MockClock, SystemClock};
pub use conflict::{ConflictOutcome, ConflictStrategy, RemoteVersion};
pub use error::{CoreError, CoreResult, RecurrenceError, ValidationError};
pub use recurrence::{ExpandedInstance, ExpansionWindow};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default materialization horizon in days past `max(now, start)`.
pub const DEFAULT_HORIZON_DAYS: i64 = 730;

/// Suffix of generated iCalendar UIDs.
pub const UID_DOMAIN: &str = "caldera";
