//! # Occurrence Expander
//!
//! Turns one event (start, RRULE, EXDATE, RDATE) into concrete instants.
//!
//! ## Expansion Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  Event.start (UTC) ──► wall clock in nominal zone                       │
//! │                            │                                            │
//! │  RRULE (UNTIL rewritten ───┤                                            │
//! │   to wall clock)           ▼                                            │
//! │                     rrule::RRuleSet (naive times labeled UTC)          │
//! │                            │                                            │
//! │  RDATE (to wall clock) ──► ∪ ──► BTreeSet<NaiveDateTime>               │
//! │                            │                                            │
//! │                            ▼                                            │
//! │                     resolve_local(zone, wall)                           │
//! │                       Single    → that instant                          │
//! │                       Ambiguous → earlier instant                       │
//! │                       Gap       → offset in force before the gap        │
//! │                            │                                            │
//! │  EXDATE ─────────────────► cancelled flag (row kept)                    │
//! │                            │                                            │
//! │                            ▼                                            │
//! │                     Vec<ExpandedInstance> (ordered)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Evaluating the rule on wall-clock times keeps "every day at 09:00" at
//! 09:00 on both sides of a DST transition. All-day events are evaluated in
//! UTC, never in the device's zone.
//!
//! ## DST Resolution (RFC 5545 §3.3.5)
//! - Overlap (fall back): the earlier of the two instants.
//! - Gap (spring forward): the wall time is read with the offset in force
//!   before the gap, so `02:30` in a `02:00→03:00` gap becomes `03:30`.
//!
//! Both rules are pure functions of (zone, wall time), so regenerating the
//! same event always yields the same instants.

use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::error::RecurrenceError;
use crate::types::{day_key, Event};

// =============================================================================
// Constants
// =============================================================================

/// Upper bound on instances produced by one expansion.
pub const MAX_OCCURRENCES: u16 = 5000;

/// `UNTIL` / `DTSTART` date-time layout (without the trailing `Z`).
const RULE_TIME_FORMAT: &str = "%Y%m%dT%H%M%S";

// =============================================================================
// Types
// =============================================================================

/// Half-open time window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ExpansionWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// Returns true if a span `[start, end)` touches the window.
    ///
    /// Zero-length spans count when their instant lies inside the window.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        if end <= start {
            return start >= self.start && start < self.end;
        }
        start < self.end && end > self.start
    }
}

/// One expanded instance of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedInstance {
    /// Rule-implied start (identity of the instance).
    pub instance_time: DateTime<Utc>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Matched an EXDATE.
    pub cancelled: bool,
    pub start_day: i64,
    pub end_day: i64,
}

// =============================================================================
// Expansion
// =============================================================================

/// Expands an event into its ordered instances.
///
/// ## Arguments
/// * `event` - Master or single event
/// * `window` - Optional window; `None` expands the whole series (capped at
///   [`MAX_OCCURRENCES`])
///
/// Non-recurring events and exception events always produce exactly one
/// instance equal to their own span, whatever the window.
///
/// ## Errors
/// `RecurrenceError` when the RRULE cannot be parsed or the timezone is
/// unknown. Callers must treat this as "no progress", never as "no
/// occurrences".
pub fn expand(
    event: &Event,
    window: Option<&ExpansionWindow>,
) -> Result<Vec<ExpandedInstance>, RecurrenceError> {
    let zone = event.nominal_zone()?;

    if !event.is_recurring() {
        let instance_time = event.original_instance_time.unwrap_or(event.start);
        return Ok(vec![instance(zone, instance_time, event.start, event.end, false)]);
    }

    let duration = event.duration().max(Duration::zero());
    let mut walls = rule_wall_times(event, zone, window)?;
    for rdate in &event.rdates {
        walls.insert(rdate.with_timezone(&zone).naive_local());
    }

    let exdates: HashSet<DateTime<Utc>> = event.exdates.iter().copied().collect();

    let mut out = Vec::new();
    for wall in walls.into_iter().take(MAX_OCCURRENCES as usize) {
        let start = resolve_local(zone, wall);
        let end = start + duration;
        if let Some(w) = window {
            if !w.overlaps(start, end) {
                continue;
            }
        }
        out.push(instance(zone, start, start, end, exdates.contains(&start)));
    }
    out.sort_by_key(|i| i.instance_time);
    Ok(out)
}

/// Side-effect-free expansion for read-only callers.
///
/// Unparseable input yields an empty list instead of an error.
pub fn preview(event: &Event, window: &ExpansionWindow) -> Vec<ExpandedInstance> {
    match expand(event, Some(window)) {
        Ok(instances) => instances,
        Err(e) => {
            warn!(event_id = %event.id, error = %e, "Preview skipped unparseable recurrence");
            Vec::new()
        }
    }
}

/// Returns the first instance of the series, if any.
pub fn first_instance(event: &Event) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    Ok(expand(event, None)?.first().map(|i| i.instance_time))
}

/// Returns true if `instant` is one of the event's rule or RDATE instances.
pub fn contains_instance(event: &Event, instant: DateTime<Utc>) -> Result<bool, RecurrenceError> {
    let window = ExpansionWindow::new(instant - Duration::days(1), instant + Duration::days(1));
    Ok(expand(event, Some(&window))?
        .iter()
        .any(|i| i.instance_time == instant))
}

/// Number of RRULE instances strictly before `split` (RDATEs excluded).
pub fn rule_instances_before(event: &Event, split: DateTime<Utc>) -> Result<u32, RecurrenceError> {
    let zone = event.nominal_zone()?;
    let count = rule_wall_times(event, zone, None)?
        .into_iter()
        .map(|wall| resolve_local(zone, wall))
        .take_while(|instant| *instant < split)
        .count();
    Ok(count as u32)
}

/// COUNT left for a tail series starting at `split`.
///
/// `None` when the rule has no COUNT.
pub fn remaining_count(event: &Event, split: DateTime<Utc>) -> Result<Option<u32>, RecurrenceError> {
    let rule = match event.rrule.as_deref() {
        Some(r) => r,
        None => return Ok(None),
    };
    match rule_count(rule)? {
        Some(total) => {
            let before = rule_instances_before(event, split)?;
            Ok(Some(total.saturating_sub(before)))
        }
        None => Ok(None),
    }
}

/// First instance at or after `from`, searching ever wider windows.
pub fn next_instance(
    event: &Event,
    from: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, RecurrenceError> {
    for days in [31, 400, 4_000, 40_000] {
        let window = ExpansionWindow::new(from, from + Duration::days(days));
        let found = expand(event, Some(&window))?
            .into_iter()
            .map(|i| i.instance_time)
            .find(|at| *at >= from);
        if found.is_some() {
            return Ok(found);
        }
    }
    Ok(None)
}

fn instance(
    zone: Tz,
    instance_time: DateTime<Utc>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cancelled: bool,
) -> ExpandedInstance {
    let (start_day, end_day) = day_span(zone, start, end);
    ExpandedInstance {
        instance_time,
        start,
        end,
        cancelled,
        start_day,
        end_day,
    }
}

/// Day keys of the first and last day a span covers in `zone`.
///
/// The end is exclusive: an all-day event ending at midnight covers one day.
pub fn day_span(zone: Tz, start: DateTime<Utc>, end: DateTime<Utc>) -> (i64, i64) {
    let first = start.with_timezone(&zone).date_naive();
    let last = if end > start {
        (end - Duration::seconds(1)).with_timezone(&zone).date_naive()
    } else {
        first
    };
    (day_key(first), day_key(last))
}

/// Wall-clock times produced by the RRULE alone.
fn rule_wall_times(
    event: &Event,
    zone: Tz,
    window: Option<&ExpansionWindow>,
) -> Result<BTreeSet<NaiveDateTime>, RecurrenceError> {
    let raw = event.rrule.as_deref().unwrap_or_default();
    let rule = wall_clock_rule(raw, zone)?;
    let local_start = event.start.with_timezone(&zone).naive_local();
    let text = format!(
        "DTSTART:{}Z\nRRULE:{}",
        local_start.format(RULE_TIME_FORMAT),
        rule
    );

    let mut set = text
        .parse::<rrule::RRuleSet>()
        .map_err(|e| RecurrenceError::invalid_rule(raw, e.to_string()))?;

    if let Some(w) = window {
        // Wall times differ from instants by at most one day of offset.
        let margin = Duration::days(1) + event.duration().max(Duration::zero());
        let utc = rrule::Tz::Tz(chrono_tz::UTC);
        set = set
            .after((w.start - margin).with_timezone(&utc))
            .before((w.end + Duration::days(1)).with_timezone(&utc));
    }

    Ok(set
        .all(MAX_OCCURRENCES)
        .dates
        .iter()
        .map(|d| d.naive_utc())
        .collect())
}

// =============================================================================
// DST Resolution
// =============================================================================

/// Resolves a wall-clock time in `zone` to one instant.
///
/// ## Example
/// ```rust
/// use caldera_core::recurrence::resolve_local;
/// use chrono::{NaiveDate, TimeZone, Utc};
///
/// // 02:30 does not exist in Berlin on 2024-03-31; it lands on 03:30 CEST.
/// let wall = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap().and_hms_opt(2, 30, 0).unwrap();
/// let instant = resolve_local(chrono_tz::Europe::Berlin, wall);
/// assert_eq!(instant, Utc.with_ymd_and_hms(2024, 3, 31, 1, 30, 0).unwrap());
/// ```
pub fn resolve_local(zone: Tz, wall: NaiveDateTime) -> DateTime<Utc> {
    match zone.from_local_datetime(&wall) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let offset = offset_before_gap(zone, wall);
            Utc.from_utc_datetime(&(wall - Duration::seconds(offset as i64)))
        }
    }
}

/// UTC offset (seconds) in force just before the gap containing `wall`.
fn offset_before_gap(zone: Tz, wall: NaiveDateTime) -> i32 {
    for hours in 1..=48 {
        match zone.from_local_datetime(&(wall - Duration::hours(hours))) {
            LocalResult::Single(dt) => return dt.offset().fix().local_minus_utc(),
            LocalResult::Ambiguous(_, latest) => return latest.offset().fix().local_minus_utc(),
            LocalResult::None => continue,
        }
    }
    0
}

// =============================================================================
// Rule Helpers
// =============================================================================

/// Splits an RRULE value into upper-cased `(KEY, value)` pairs.
///
/// A leading `RRULE:` is tolerated.
pub fn parse_rule_parts(rule: &str) -> Result<Vec<(String, String)>, RecurrenceError> {
    let body = rule.trim();
    let body = body.strip_prefix("RRULE:").unwrap_or(body);
    let mut parts = Vec::new();
    for part in body.split(';').filter(|p| !p.trim().is_empty()) {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| RecurrenceError::invalid_rule(rule, format!("malformed part '{}'", part)))?;
        parts.push((key.trim().to_ascii_uppercase(), value.trim().to_string()));
    }
    if parts.is_empty() {
        return Err(RecurrenceError::invalid_rule(rule, "empty rule"));
    }
    Ok(parts)
}

fn format_rule_parts(parts: &[(String, String)]) -> String {
    parts
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(";")
}

/// COUNT of a rule, if present.
pub fn rule_count(rule: &str) -> Result<Option<u32>, RecurrenceError> {
    for (key, value) in parse_rule_parts(rule)? {
        if key == "COUNT" {
            let count = value
                .parse::<u32>()
                .map_err(|_| RecurrenceError::invalid_rule(rule, "COUNT is not a number"))?;
            return Ok(Some(count));
        }
    }
    Ok(None)
}

/// Reads an UNTIL value as a UTC instant.
///
/// Date-only values mean the end of that day; floating values are read as UTC.
pub fn parse_until(value: &str) -> Result<DateTime<Utc>, RecurrenceError> {
    let bare = value.trim_end_matches('Z');
    if bare.len() == 8 {
        let date = NaiveDate::parse_from_str(bare, "%Y%m%d")
            .map_err(|_| RecurrenceError::InvalidDateTime(value.to_string()))?;
        let end_of_day = date
            .and_hms_opt(23, 59, 59)
            .ok_or_else(|| RecurrenceError::InvalidDateTime(value.to_string()))?;
        return Ok(Utc.from_utc_datetime(&end_of_day));
    }
    let naive = NaiveDateTime::parse_from_str(bare, RULE_TIME_FORMAT)
        .map_err(|_| RecurrenceError::InvalidDateTime(value.to_string()))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Rewrites UNTIL into the wall-clock space the rule is evaluated in.
fn wall_clock_rule(rule: &str, zone: Tz) -> Result<String, RecurrenceError> {
    let mut parts = parse_rule_parts(rule)?;
    if !parts.iter().any(|(k, _)| k == "FREQ") {
        return Err(RecurrenceError::invalid_rule(rule, "missing FREQ"));
    }
    for (key, value) in parts.iter_mut() {
        if key != "UNTIL" {
            continue;
        }
        let wall = if value.ends_with('Z') {
            parse_until(value)?.with_timezone(&zone).naive_local()
        } else {
            // Date-only and floating values are already wall clock.
            parse_until(value)?.naive_utc()
        };
        *value = format!("{}Z", wall.format(RULE_TIME_FORMAT));
    }
    Ok(format_rule_parts(&parts))
}

/// Ends a rule just before `split`.
///
/// COUNT is replaced by `UNTIL = split - 1s` (UTC). An existing UNTIL that
/// is already earlier is kept.
///
/// ## Example
/// ```rust
/// use caldera_core::recurrence::truncate_rule;
/// use chrono::{TimeZone, Utc};
///
/// let split = Utc.with_ymd_and_hms(2024, 1, 5, 8, 0, 0).unwrap();
/// let rule = truncate_rule("FREQ=DAILY;COUNT=10", split).unwrap();
/// assert_eq!(rule, "FREQ=DAILY;UNTIL=20240105T075959Z");
/// ```
pub fn truncate_rule(rule: &str, split: DateTime<Utc>) -> Result<String, RecurrenceError> {
    let parts = parse_rule_parts(rule)?;
    let mut until = split - Duration::seconds(1);
    for (key, value) in &parts {
        if key == "UNTIL" {
            let existing = parse_until(value)?;
            if existing < until {
                until = existing;
            }
        }
    }

    let mut kept: Vec<(String, String)> = parts
        .into_iter()
        .filter(|(k, _)| k != "COUNT" && k != "UNTIL")
        .collect();
    kept.push((
        "UNTIL".to_string(),
        format!("{}Z", until.format(RULE_TIME_FORMAT)),
    ));
    Ok(format_rule_parts(&kept))
}

/// Replaces (or removes) the COUNT of a rule, dropping any UNTIL.
pub fn with_count(rule: &str, count: Option<u32>) -> Result<String, RecurrenceError> {
    let mut parts: Vec<(String, String)> = parse_rule_parts(rule)?
        .into_iter()
        .filter(|(k, _)| k != "COUNT" && (count.is_none() || k != "UNTIL"))
        .collect();
    if let Some(n) = count {
        parts.push(("COUNT".to_string(), n.to_string()));
    }
    Ok(format_rule_parts(&parts))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SyncState;
    use chrono_tz::Europe::Berlin;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn event(start: DateTime<Utc>, minutes: i64, tz: Option<&str>, rrule: Option<&str>) -> Event {
        Event {
            id: "evt-1".into(),
            uid: "uid-1".into(),
            calendar_id: "cal-1".into(),
            summary: "Test".into(),
            description: None,
            location: None,
            start,
            end: start + Duration::minutes(minutes),
            all_day: false,
            timezone: tz.map(String::from),
            rrule: rrule.map(String::from),
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
    fn test_single_event_one_instance() {
        let start = utc(2024, 5, 1, 10, 0);
        let ev = event(start, 60, None, None);

        let far = ExpansionWindow::new(utc(2030, 1, 1, 0, 0), utc(2030, 2, 1, 0, 0));
        for window in [None, Some(&far)] {
            let out = expand(&ev, window).unwrap();
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].start, ev.start);
            assert_eq!(out[0].end, ev.end);
            assert!(!out[0].cancelled);
        }
    }

    #[test]
    fn test_daily_count_keeps_wall_clock_across_dst() {
        // 09:00 Berlin, DST starts 2024-03-31
        let ev = event(utc(2024, 3, 29, 8, 0), 30, Some("Europe/Berlin"), Some("FREQ=DAILY;COUNT=5"));
        let out = expand(&ev, None).unwrap();

        assert_eq!(out.len(), 5);
        for inst in &out {
            let local = inst.start.with_timezone(&Berlin);
            assert_eq!(local.format("%H:%M").to_string(), "09:00");
            assert_eq!(inst.end - inst.start, Duration::minutes(30));
        }
        assert_eq!(out[2].start, utc(2024, 3, 31, 7, 0));
    }

    #[test]
    fn test_dst_gap_moves_forward() {
        // 02:30 Berlin does not exist on 2024-03-31
        let ev = event(utc(2024, 3, 30, 1, 30), 30, Some("Europe/Berlin"), Some("FREQ=DAILY;COUNT=3"));
        let out = expand(&ev, None).unwrap();
        let starts: Vec<_> = out.iter().map(|i| i.start).collect();

        assert_eq!(
            starts,
            vec![utc(2024, 3, 30, 1, 30), utc(2024, 3, 31, 1, 30), utc(2024, 4, 1, 0, 30)]
        );
        assert_eq!(
            out[1].start.with_timezone(&Berlin).format("%H:%M").to_string(),
            "03:30"
        );
    }

    #[test]
    fn test_dst_overlap_picks_earlier_and_is_stable() {
        // 02:30 Berlin occurs twice on 2024-10-27
        let ev = event(utc(2024, 10, 26, 0, 30), 30, Some("Europe/Berlin"), Some("FREQ=DAILY;COUNT=3"));
        let first = expand(&ev, None).unwrap();
        let second = expand(&ev, None).unwrap();

        assert_eq!(first, second);
        assert_eq!(first[1].start, utc(2024, 10, 27, 0, 30));
        assert_eq!(first[2].start, utc(2024, 10, 28, 1, 30));
    }

    #[test]
    fn test_all_day_uses_utc() {
        let mut ev = event(utc(2024, 3, 9, 0, 0), 24 * 60, Some("America/New_York"), Some("FREQ=DAILY;COUNT=3"));
        ev.all_day = true;
        let out = expand(&ev, None).unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[1].start, utc(2024, 3, 10, 0, 0));
        assert_eq!(out[1].start_day, 20240310);
        assert_eq!(out[1].end_day, 20240310);
    }

    #[test]
    fn test_exdate_cancels_but_keeps_instance() {
        let mut ev = event(utc(2024, 1, 1, 9, 0), 60, None, Some("FREQ=DAILY;COUNT=4"));
        ev.exdates = vec![utc(2024, 1, 2, 9, 0)];
        let out = expand(&ev, None).unwrap();

        assert_eq!(out.len(), 4);
        assert!(out[1].cancelled);
        assert_eq!(out.iter().filter(|i| i.cancelled).count(), 1);
    }

    #[test]
    fn test_rdate_is_added() {
        let mut ev = event(utc(2024, 1, 1, 9, 0), 60, None, Some("FREQ=WEEKLY;COUNT=2"));
        ev.rdates = vec![utc(2024, 1, 3, 15, 0)];
        let out = expand(&ev, None).unwrap();

        let starts: Vec<_> = out.iter().map(|i| i.start).collect();
        assert_eq!(
            starts,
            vec![utc(2024, 1, 1, 9, 0), utc(2024, 1, 3, 15, 0), utc(2024, 1, 8, 9, 0)]
        );
    }

    #[test]
    fn test_window_filters_instances() {
        let ev = event(utc(2024, 1, 1, 9, 0), 60, None, Some("FREQ=DAILY;COUNT=10"));
        let window = ExpansionWindow::new(utc(2024, 1, 3, 0, 0), utc(2024, 1, 6, 0, 0));
        let out = expand(&ev, Some(&window)).unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].start, utc(2024, 1, 3, 9, 0));
    }

    #[test]
    fn test_utc_until_is_inclusive_in_wall_clock() {
        // UNTIL 08:00Z == 09:00 Berlin on Jan 5
        let ev = event(
            utc(2024, 1, 1, 8, 0),
            30,
            Some("Europe/Berlin"),
            Some("FREQ=DAILY;UNTIL=20240105T080000Z"),
        );
        let out = expand(&ev, None).unwrap();
        assert_eq!(out.len(), 5);
        assert_eq!(out[4].start, utc(2024, 1, 5, 8, 0));
    }

    #[test]
    fn test_invalid_rule_is_error_and_preview_empty() {
        let ev = event(utc(2024, 1, 1, 9, 0), 60, None, Some("FREQ=SOMETIMES"));
        assert!(matches!(
            expand(&ev, None),
            Err(RecurrenceError::InvalidRule { .. })
        ));

        let window = ExpansionWindow::new(utc(2024, 1, 1, 0, 0), utc(2024, 2, 1, 0, 0));
        assert!(preview(&ev, &window).is_empty());
    }

    #[test]
    fn test_truncate_rule() {
        let split = utc(2024, 1, 5, 8, 0);
        assert_eq!(
            truncate_rule("FREQ=DAILY;COUNT=10", split).unwrap(),
            "FREQ=DAILY;UNTIL=20240105T075959Z"
        );
        assert_eq!(
            truncate_rule("FREQ=DAILY;UNTIL=20240103T000000Z", split).unwrap(),
            "FREQ=DAILY;UNTIL=20240103T000000Z"
        );
        assert_eq!(
            truncate_rule("RRULE:FREQ=WEEKLY;BYDAY=MO,WE", split).unwrap(),
            "FREQ=WEEKLY;BYDAY=MO,WE;UNTIL=20240105T075959Z"
        );
    }

    #[test]
    fn test_remaining_count_for_split() {
        let ev = event(utc(2024, 1, 1, 9, 0), 60, None, Some("FREQ=DAILY;COUNT=10"));
        let split = utc(2024, 1, 4, 9, 0);

        assert_eq!(rule_instances_before(&ev, split).unwrap(), 3);
        assert_eq!(remaining_count(&ev, split).unwrap(), Some(7));
        assert_eq!(
            with_count("FREQ=DAILY;COUNT=10", Some(7)).unwrap(),
            "FREQ=DAILY;COUNT=7"
        );
    }

    #[test]
    fn test_contains_instance() {
        let ev = event(utc(2024, 1, 1, 9, 0), 60, None, Some("FREQ=DAILY;COUNT=3"));
        assert!(contains_instance(&ev, utc(2024, 1, 2, 9, 0)).unwrap());
        assert!(!contains_instance(&ev, utc(2024, 1, 2, 10, 0)).unwrap());
        assert!(!contains_instance(&ev, utc(2024, 1, 5, 9, 0)).unwrap());
    }

    #[test]
    fn test_next_instance_searches_past_gaps() {
        let ev = event(utc(2024, 1, 1, 9, 0), 60, None, Some("FREQ=YEARLY;COUNT=3"));
        assert_eq!(
            next_instance(&ev, utc(2024, 1, 1, 10, 0)).unwrap(),
            Some(utc(2025, 1, 1, 9, 0))
        );
        assert_eq!(
            next_instance(&ev, utc(2025, 1, 1, 9, 0)).unwrap(),
            Some(utc(2025, 1, 1, 9, 0))
        );
        assert_eq!(next_instance(&ev, utc(2026, 6, 1, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_parse_rule_parts_rejects_garbage() {
        assert!(parse_rule_parts("").is_err());
        assert!(parse_rule_parts("FREQ").is_err());
        assert_eq!(rule_count("FREQ=DAILY;COUNT=3").unwrap(), Some(3));
        assert_eq!(rule_count("FREQ=DAILY").unwrap(), None);
    }
}
