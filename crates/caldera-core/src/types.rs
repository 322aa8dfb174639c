//! # Domain Types
//!
//! Core domain types used throughout Caldera.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    Calendar     │   │      Event      │   │   Occurrence    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │◄──│  calendar_id    │◄──│  event_id (FK)  │       │
//! │  │  kind           │   │  uid (iCal)     │   │  instance_time  │       │
//! │  │  remote_url     │   │  rrule/exdates  │   │  start / end    │       │
//! │  │  sync_token     │   │  sync_state     │   │  cancelled      │       │
//! │  └─────────────────┘   └────────┬────────┘   └─────────────────┘       │
//! │                                 │                                       │
//! │                        ┌────────▼────────┐                              │
//! │                        │PendingOperation │  at most one per event       │
//! │                        │  kind / status  │                              │
//! │                        │  retry_count    │                              │
//! │                        └─────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Dual-Key Identity Pattern
//! Every event has:
//! - `id`: UUID v4 - immutable, used for database relations
//! - `uid`: iCalendar UID - shared by a master and all of its exception events

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::error::RecurrenceError;

// =============================================================================
// Calendar
// =============================================================================

/// Where a calendar lives.
///
/// Local calendars never produce remote work: their events are always
/// `Synced` and no pending operation is ever queued for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum CalendarKind {
    /// Device-only calendar.
    Local,
    /// Calendar collection on a CalDAV server.
    Remote,
}

/// A calendar collection (local or remote).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Calendar {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Account this calendar was discovered through (remote only).
    pub account_id: Option<String>,

    /// Display name shown in the calendar list.
    pub display_name: String,

    /// Local or remote.
    pub kind: CalendarKind,

    /// Collection URL on the server (remote only).
    pub remote_url: Option<String>,

    /// Last seen collection tag (`getctag`).
    pub ctag: Option<String>,

    /// Last seen RFC 6578 sync token.
    pub sync_token: Option<String>,

    /// Display color (`#RRGGBB`), if the server advertises one.
    pub color: Option<String>,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Calendar {
    /// Returns true if events in this calendar are mirrored to a server.
    #[inline]
    pub fn is_remote(&self) -> bool {
        self.kind == CalendarKind::Remote
    }
}

// =============================================================================
// Sync State
// =============================================================================

/// Sync status of an event relative to its server copy.
///
/// ## Transitions
/// ```text
///   create (remote cal) ──► PendingCreate ──push──► Synced
///                                                     │
///   update ──────────────────────────────────────────►│──► PendingUpdate
///   delete ──────────────────────────────────────────►│──► PendingDelete
///
///   PendingCreate + update  → stays PendingCreate
///   PendingCreate + delete  → row removed entirely
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Local state matches the last known server state.
    #[default]
    Synced,
    /// Created locally, never uploaded.
    PendingCreate,
    /// Changed locally since the last upload.
    PendingUpdate,
    /// Deleted locally, server copy still exists.
    PendingDelete,
}

impl SyncState {
    /// Returns true if local changes have not reached the server yet.
    #[inline]
    pub fn has_local_changes(&self) -> bool {
        !matches!(self, SyncState::Synced)
    }
}

// =============================================================================
// Event
// =============================================================================

/// One logical calendar item.
///
/// ## Exceptions
/// An exception event overrides a single occurrence of a recurring master:
/// - `uid` equals the master's `uid`
/// - `original_event_id` points at the master
/// - `original_instance_time` is the rule-implied start it replaces
/// - it never carries an RRULE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Event {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// Globally unique iCalendar UID.
    pub uid: String,

    /// Calendar this event belongs to.
    pub calendar_id: String,

    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,

    /// Start instant. All-day events start at midnight UTC of their date.
    #[ts(as = "String")]
    pub start: DateTime<Utc>,

    /// End instant (exclusive).
    #[ts(as = "String")]
    pub end: DateTime<Utc>,

    /// All-day events are always expanded in UTC.
    pub all_day: bool,

    /// IANA timezone the event was authored in (`None` = UTC).
    pub timezone: Option<String>,

    /// RFC 5545 RRULE value (without the `RRULE:` prefix).
    pub rrule: Option<String>,

    /// Excluded instants.
    #[ts(as = "Vec<String>")]
    pub exdates: Vec<DateTime<Utc>>,

    /// Additional instants.
    #[ts(as = "Vec<String>")]
    pub rdates: Vec<DateTime<Utc>>,

    /// iCalendar SEQUENCE; bumped only when timing or recurrence changes.
    pub sequence: i64,

    pub sync_state: SyncState,

    /// Resource URL on the server, once known.
    pub remote_url: Option<String>,

    /// Last known ETag of the server resource.
    pub etag: Option<String>,

    /// Master event id (exceptions only).
    pub original_event_id: Option<String>,

    /// Rule-implied instant this exception replaces (exceptions only).
    #[ts(as = "Option<String>")]
    pub original_instance_time: Option<DateTime<Utc>>,

    /// Set when a sync conflict awaits manual resolution.
    pub has_conflict: bool,

    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// Returns true if this event overrides an occurrence of another event.
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.original_event_id.is_some()
    }

    /// Returns true if this is a recurring master.
    #[inline]
    pub fn is_recurring(&self) -> bool {
        !self.is_exception() && self.rrule.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    /// Returns true once the event has been soft-deleted locally.
    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.sync_state == SyncState::PendingDelete
    }

    /// Duration of a single occurrence.
    #[inline]
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// The zone recurrence is evaluated in.
    ///
    /// All-day events and events without a timezone use UTC, never the
    /// device's local zone.
    pub fn nominal_zone(&self) -> Result<Tz, RecurrenceError> {
        if self.all_day {
            return Ok(Tz::UTC);
        }
        match self.timezone.as_deref() {
            None | Some("") => Ok(Tz::UTC),
            Some(name) => parse_timezone(name),
        }
    }

    /// Returns true if `other` differs in anything that moves occurrences.
    ///
    /// Metadata (summary, description, location) is ignored.
    pub fn timing_differs(&self, other: &Event) -> bool {
        self.start != other.start
            || self.end != other.end
            || self.all_day != other.all_day
            || self.timezone != other.timezone
            || self.rrule != other.rrule
            || self.exdates != other.exdates
            || self.rdates != other.rdates
    }
}

/// Parses an IANA timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, RecurrenceError> {
    name.parse::<Tz>()
        .map_err(|_| RecurrenceError::UnknownTimezone(name.to_string()))
}

/// Packs a date into the `YYYYMMDD` day key stored on occurrences.
#[inline]
pub fn day_key(date: NaiveDate) -> i64 {
    date.year() as i64 * 10_000 + date.month() as i64 * 100 + date.day() as i64
}

/// Generates a fresh, globally unique iCalendar UID.
pub fn generate_uid() -> String {
    format!("{}@{}", uuid::Uuid::new_v4(), crate::UID_DOMAIN)
}

/// Encodes an instant list for a JSON text column.
pub fn instants_to_json(instants: &[DateTime<Utc>]) -> String {
    serde_json::to_string(instants).unwrap_or_else(|_| "[]".to_string())
}

/// Decodes an instant list from a JSON text column.
pub fn instants_from_json(text: &str) -> Result<Vec<DateTime<Utc>>, serde_json::Error> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(text)
}

/// Truncates an instant to whole seconds (iCalendar precision).
#[inline]
pub fn to_second(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant - Duration::nanoseconds(instant.timestamp_subsec_nanos() as i64)
}

// =============================================================================
// Event Inputs
// =============================================================================

/// Input for creating an event.
///
/// ## Example
/// ```rust
/// use caldera_core::NewEvent;
/// use chrono::{TimeZone, Utc};
///
/// let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
/// let draft = NewEvent::new("cal-1", "Standup", start, start + chrono::Duration::minutes(15))
///     .timezone("Europe/Berlin")
///     .rrule("FREQ=DAILY;COUNT=10");
/// assert!(draft.rrule.is_some());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct NewEvent {
    /// iCalendar UID; generated when absent.
    pub uid: Option<String>,
    pub calendar_id: String,
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    #[ts(as = "String")]
    pub start: DateTime<Utc>,
    #[ts(as = "String")]
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub all_day: bool,
    pub timezone: Option<String>,
    pub rrule: Option<String>,
    #[serde(default)]
    #[ts(as = "Vec<String>")]
    pub exdates: Vec<DateTime<Utc>>,
    #[serde(default)]
    #[ts(as = "Vec<String>")]
    pub rdates: Vec<DateTime<Utc>>,
}

impl NewEvent {
    /// Creates a draft with the required fields.
    pub fn new(
        calendar_id: impl Into<String>,
        summary: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        NewEvent {
            uid: None,
            calendar_id: calendar_id.into(),
            summary: summary.into(),
            description: None,
            location: None,
            start,
            end,
            all_day: false,
            timezone: None,
            rrule: None,
            exdates: Vec::new(),
            rdates: Vec::new(),
        }
    }

    pub fn uid(mut self, uid: impl Into<String>) -> Self {
        self.uid = Some(uid.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn all_day(mut self, all_day: bool) -> Self {
        self.all_day = all_day;
        self
    }

    pub fn rrule(mut self, rrule: impl Into<String>) -> Self {
        self.rrule = Some(rrule.into());
        self
    }

    pub fn exdates(mut self, exdates: Vec<DateTime<Utc>>) -> Self {
        self.exdates = exdates;
        self
    }

    pub fn rdates(mut self, rdates: Vec<DateTime<Utc>>) -> Self {
        self.rdates = rdates;
        self
    }
}

/// Partial update for an event.
///
/// `None` leaves a field untouched. For optional text fields, an empty
/// string clears the value (`rrule: Some("")` removes recurrence).
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct EventPatch {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    #[ts(as = "Option<String>")]
    pub start: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub end: Option<DateTime<Utc>>,
    pub all_day: Option<bool>,
    pub timezone: Option<String>,
    pub rrule: Option<String>,
    #[ts(as = "Option<Vec<String>>")]
    pub exdates: Option<Vec<DateTime<Utc>>>,
    #[ts(as = "Option<Vec<String>>")]
    pub rdates: Option<Vec<DateTime<Utc>>>,
}

impl EventPatch {
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn timing(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn rrule(mut self, rrule: impl Into<String>) -> Self {
        self.rrule = Some(rrule.into());
        self
    }

    pub fn clear_rrule(mut self) -> Self {
        self.rrule = Some(String::new());
        self
    }

    pub fn exdates(mut self, exdates: Vec<DateTime<Utc>>) -> Self {
        self.exdates = Some(exdates);
        self
    }

    /// Returns true if the patch sets an RRULE value (non-empty).
    pub fn sets_rrule(&self) -> bool {
        self.rrule.as_deref().is_some_and(|r| !r.trim().is_empty())
    }

    /// Applies the patch to an event in place.
    ///
    /// ## Returns
    /// `true` if timing or recurrence changed (sequence bump + regeneration).
    pub fn apply(&self, event: &mut Event) -> bool {
        let before = event.clone();

        if let Some(ref summary) = self.summary {
            event.summary = summary.clone();
        }
        if let Some(ref description) = self.description {
            event.description = non_empty(description);
        }
        if let Some(ref location) = self.location {
            event.location = non_empty(location);
        }
        if let Some(start) = self.start {
            event.start = to_second(start);
        }
        if let Some(end) = self.end {
            event.end = to_second(end);
        }
        if let Some(all_day) = self.all_day {
            event.all_day = all_day;
        }
        if let Some(ref tz) = self.timezone {
            event.timezone = non_empty(tz);
        }
        if let Some(ref rrule) = self.rrule {
            event.rrule = non_empty(rrule);
        }
        if let Some(ref exdates) = self.exdates {
            event.exdates = normalize_instants(exdates);
        }
        if let Some(ref rdates) = self.rdates {
            event.rdates = normalize_instants(rdates);
        }

        event.timing_differs(&before)
    }
}

/// Changes applied to one occurrence by `edit_single_occurrence`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct OccurrenceEdit {
    pub summary: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    #[ts(as = "Option<String>")]
    pub start: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub end: Option<DateTime<Utc>>,
}

impl OccurrenceEdit {
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn timing(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Sorts, deduplicates and truncates a list of instants to seconds.
pub fn normalize_instants(instants: &[DateTime<Utc>]) -> Vec<DateTime<Utc>> {
    let mut out: Vec<DateTime<Utc>> = instants.iter().copied().map(to_second).collect();
    out.sort();
    out.dedup();
    out
}

// =============================================================================
// Occurrence
// =============================================================================

/// A materialized, queryable instant of an event.
///
/// Exactly one row exists per `(event_id, instance_time)`. When an exception
/// overrides the instant, the same row carries `exception_event_id` and the
/// exception's timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct Occurrence {
    /// Deterministic id: `{event_id}:{instance unix seconds}`.
    pub id: String,
    pub event_id: String,
    pub calendar_id: String,
    /// Rule-implied start of this instance (identity key).
    #[ts(as = "String")]
    pub instance_time: DateTime<Utc>,
    #[ts(as = "String")]
    pub start_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub end_at: DateTime<Utc>,
    /// `YYYYMMDD` of the first day covered, in the event's nominal zone.
    pub start_day: i64,
    /// `YYYYMMDD` of the last day covered, in the event's nominal zone.
    pub end_day: i64,
    pub cancelled: bool,
    pub exception_event_id: Option<String>,
}

impl Occurrence {
    /// Builds the deterministic row id for an instance.
    pub fn make_id(event_id: &str, instance_time: DateTime<Utc>) -> String {
        format!("{}:{}", event_id, instance_time.timestamp())
    }
}

// =============================================================================
// Pending Operation
// =============================================================================

/// Kind of remote work owed for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// PUT with `If-None-Match: *`.
    Create,
    /// PUT with `If-Match: <etag>`.
    Update,
    /// DELETE with `If-Match: <etag>`.
    Delete,
    /// PUT into the new collection, then DELETE the old resource.
    Move,
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationKind::Create => write!(f, "create"),
            OperationKind::Update => write!(f, "update"),
            OperationKind::Delete => write!(f, "delete"),
            OperationKind::Move => write!(f, "move"),
        }
    }
}

/// Execution status of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting for its retry window.
    #[default]
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Retries exhausted; needs user attention.
    Failed,
}

/// One unit of owed remote work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[ts(export)]
pub struct PendingOperation {
    pub id: String,
    pub event_id: String,
    pub kind: OperationKind,
    /// Resource URL to act on (Delete/Move source).
    pub target_url: Option<String>,
    /// Calendar the target URL lives in (Delete/Move).
    pub target_calendar_id: Option<String>,
    pub retry_count: i64,
    #[ts(as = "String")]
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub status: OperationStatus,
    /// Incremented on every coalesce; guards against lost updates while in flight.
    pub revision: i64,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Remote Objects
// =============================================================================

/// One VEVENT as delivered by the server (master or override).
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteComponent {
    pub summary: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub timezone: Option<String>,
    pub rrule: Option<String>,
    pub exdates: Vec<DateTime<Utc>>,
    pub rdates: Vec<DateTime<Utc>>,
    pub sequence: i64,
    /// `RECURRENCE-ID` (overrides only).
    pub recurrence_id: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// A calendar object resource: one master plus overrides sharing a UID.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub uid: String,
    /// Absolute resource URL.
    pub href: String,
    pub etag: Option<String>,
    pub master: Option<RemoteComponent>,
    pub overrides: Vec<RemoteComponent>,
}

impl RemoteEvent {
    /// Version information for conflict resolution.
    pub fn version(&self) -> crate::conflict::RemoteVersion {
        let newest_override = self.overrides.iter().filter_map(|o| o.last_modified).max();
        let master_modified = self.master.as_ref().and_then(|m| m.last_modified);
        crate::conflict::RemoteVersion {
            etag: self.etag.clone(),
            last_modified: master_modified.max(newest_override),
            sequence: self.master.as_ref().map(|m| m.sequence),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> Event {
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        Event {
            id: "evt-1".into(),
            uid: "uid-1".into(),
            calendar_id: "cal-1".into(),
            summary: "Standup".into(),
            description: None,
            location: None,
            start,
            end: start + Duration::minutes(15),
            all_day: false,
            timezone: Some("Europe/Berlin".into()),
            rrule: Some("FREQ=DAILY;COUNT=5".into()),
            exdates: vec![],
            rdates: vec![],
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

    #[test]
    fn test_sync_state_default() {
        assert_eq!(SyncState::default(), SyncState::Synced);
        assert!(!SyncState::Synced.has_local_changes());
        assert!(SyncState::PendingCreate.has_local_changes());
    }

    #[test]
    fn test_all_day_events_use_utc() {
        let mut event = sample_event();
        event.all_day = true;
        event.timezone = Some("America/New_York".into());
        assert_eq!(event.nominal_zone().unwrap(), Tz::UTC);

        event.all_day = false;
        event.timezone = None;
        assert_eq!(event.nominal_zone().unwrap(), Tz::UTC);
    }

    #[test]
    fn test_unknown_timezone() {
        let mut event = sample_event();
        event.timezone = Some("Mars/Olympus".into());
        assert!(matches!(
            event.nominal_zone(),
            Err(RecurrenceError::UnknownTimezone(_))
        ));
    }

    #[test]
    fn test_patch_metadata_only() {
        let mut event = sample_event();
        let changed = EventPatch::default()
            .summary("Daily sync")
            .location("Room 4")
            .apply(&mut event);
        assert!(!changed);
        assert_eq!(event.summary, "Daily sync");
        assert_eq!(event.location.as_deref(), Some("Room 4"));
    }

    #[test]
    fn test_patch_timing_change() {
        let mut event = sample_event();
        let start = event.start + Duration::hours(1);
        let changed = EventPatch::default()
            .timing(start, start + Duration::minutes(15))
            .apply(&mut event);
        assert!(changed);

        let changed = EventPatch::default().clear_rrule().apply(&mut event);
        assert!(changed);
        assert!(event.rrule.is_none());
        assert!(!event.is_recurring());
    }

    #[test]
    fn test_day_key() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        assert_eq!(day_key(date), 20240304);
    }

    #[test]
    fn test_occurrence_id_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        assert_eq!(Occurrence::make_id("evt-1", at), Occurrence::make_id("evt-1", at));
        assert_eq!(Occurrence::make_id("evt-1", at), format!("evt-1:{}", at.timestamp()));
    }

    #[test]
    fn test_instants_json() {
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let text = instants_to_json(&[at]);
        assert_eq!(instants_from_json(&text).unwrap(), vec![at]);
        assert!(instants_from_json("").unwrap().is_empty());
        assert!(instants_from_json("not json").is_err());
    }

    #[test]
    fn test_generated_uids_are_unique() {
        let a = generate_uid();
        assert!(a.ends_with("@caldera"));
        assert_ne!(a, generate_uid());
    }

    #[test]
    fn test_normalize_instants() {
        let at = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        let with_nanos = at + Duration::milliseconds(250);
        let out = normalize_instants(&[with_nanos, at, at + Duration::days(1)]);
        assert_eq!(out, vec![at, at + Duration::days(1)]);
    }
}
