//! # iCalendar Mapping
//!
//! Converts between calendar object resources and the core event types.
//!
//! ## Resource Shape
//! ```text
//! BEGIN:VCALENDAR
//!   BEGIN:VEVENT          master        UID, DTSTART, DTEND, RRULE, EXDATE, RDATE
//!   END:VEVENT
//!   BEGIN:VEVENT          override      same UID + RECURRENCE-ID
//!   END:VEVENT
//! END:VCALENDAR
//!
//! parse_resource(..) ──► RemoteEvent { master, overrides }
//! render_event(..)   ◄── master Event + its live exception Events
//! ```
//!
//! ## Time Values
//! - `VALUE=DATE` → all-day, midnight UTC
//! - `...Z` → UTC instant, no timezone
//! - `TZID=Zone/Name` → resolved in that zone (earlier instant on overlap)
//! - floating → read as UTC
//!
//! A TZID that is not an IANA name is read as UTC and logged.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use icalendar::parser::{read_calendar, unfold, Component as ParsedComponent, Property as ParsedProperty};
use icalendar::{Calendar, CalendarDateTime, Component, DatePerhapsTime, EventLike, Property, ValueType};
use tracing::warn;

use caldera_core::recurrence::resolve_local;
use caldera_core::{Event, RemoteComponent, RemoteEvent};

use crate::error::{SyncError, SyncResult};

const UTC_FORMAT: &str = "%Y%m%dT%H%M%SZ";
const LOCAL_FORMAT: &str = "%Y%m%dT%H%M%S";
const DATE_FORMAT: &str = "%Y%m%d";

// =============================================================================
// Parsing
// =============================================================================

/// Parses one calendar object resource.
///
/// ## Arguments
/// * `body` - iCalendar text
/// * `href` - Absolute resource URL
/// * `etag` - ETag the body was fetched with
///
/// ## Returns
/// The master (if present) and every override sharing its UID. Components
/// other than VEVENT are ignored.
pub fn parse_resource(body: &str, href: &str, etag: Option<&str>) -> SyncResult<RemoteEvent> {
    let unfolded = unfold(body);
    let calendar = read_calendar(&unfolded)
        .map_err(|e| SyncError::InvalidResponse(format!("{}: {}", href, e)))?;

    let vevents: Vec<&ParsedComponent<'_>> = calendar
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
        .collect();

    let uid = vevents
        .iter()
        .find_map(|c| c.find_prop("UID"))
        .map(|p| p.val.to_string())
        .ok_or_else(|| SyncError::InvalidResponse(format!("{}: no VEVENT with a UID", href)))?;

    let mut master = None;
    let mut overrides = Vec::new();
    for vevent in vevents {
        if vevent.find_prop("UID").map(|p| p.val.as_ref()) != Some(uid.as_str()) {
            continue;
        }
        let component = parse_component(vevent, href)?;
        if component.recurrence_id.is_some() {
            overrides.push(component);
        } else if master.is_none() {
            master = Some(component);
        }
    }

    Ok(RemoteEvent {
        uid,
        href: href.to_string(),
        etag: etag.map(String::from),
        master,
        overrides,
    })
}

fn parse_component(vevent: &ParsedComponent<'_>, href: &str) -> SyncResult<RemoteComponent> {
    let dtstart = vevent
        .find_prop("DTSTART")
        .ok_or_else(|| SyncError::InvalidResponse(format!("{}: VEVENT without DTSTART", href)))?;
    let start = read_time(dtstart, href)?;

    let end = match vevent.find_prop("DTEND") {
        Some(prop) => read_time(prop, href)?.at,
        None => {
            let length = vevent
                .find_prop("DURATION")
                .and_then(|p| parse_duration(p.val.as_ref()))
                .unwrap_or_else(|| {
                    if start.all_day {
                        Duration::days(1)
                    } else {
                        Duration::zero()
                    }
                });
            start.at + length
        }
    };

    let zone = start
        .timezone
        .as_deref()
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC);

    let instants = |name: &str| -> Vec<DateTime<Utc>> {
        vevent
            .properties
            .iter()
            .filter(|p| p.name == name)
            .flat_map(|p| read_instant_list(p, zone))
            .collect()
    };

    let recurrence_id = match vevent.find_prop("RECURRENCE-ID") {
        Some(prop) => Some(read_time(prop, href)?.at),
        None => None,
    };

    Ok(RemoteComponent {
        summary: text(vevent, "SUMMARY").unwrap_or_default(),
        description: text(vevent, "DESCRIPTION"),
        location: text(vevent, "LOCATION"),
        start: start.at,
        end: end.max(start.at),
        all_day: start.all_day,
        timezone: start.timezone,
        rrule: vevent.find_prop("RRULE").map(|p| p.val.to_string()),
        exdates: instants("EXDATE"),
        rdates: instants("RDATE"),
        sequence: vevent
            .find_prop("SEQUENCE")
            .and_then(|p| p.val.as_ref().trim().parse().ok())
            .unwrap_or(0),
        recurrence_id,
        last_modified: vevent
            .find_prop("LAST-MODIFIED")
            .and_then(|p| parse_utc(p.val.as_ref())),
    })
}

/// A DTSTART-like value reduced to what the store keeps.
struct Timed {
    at: DateTime<Utc>,
    all_day: bool,
    timezone: Option<String>,
}

fn read_time(prop: &ParsedProperty<'_>, href: &str) -> SyncResult<Timed> {
    let value = DatePerhapsTime::try_from(prop).map_err(|_| {
        SyncError::InvalidResponse(format!("{}: bad {} value '{}'", href, prop.name, prop.val))
    })?;

    let timed = match value {
        DatePerhapsTime::Date(date) => Timed {
            at: midnight_utc(date),
            all_day: true,
            timezone: None,
        },
        DatePerhapsTime::DateTime(CalendarDateTime::Utc(at)) => Timed {
            at,
            all_day: false,
            timezone: None,
        },
        DatePerhapsTime::DateTime(CalendarDateTime::Floating(wall)) => Timed {
            at: Utc.from_utc_datetime(&wall),
            all_day: false,
            timezone: None,
        },
        DatePerhapsTime::DateTime(CalendarDateTime::WithTimezone { date_time, tzid }) => {
            match tzid.parse::<Tz>() {
                Ok(zone) => Timed {
                    at: resolve_local(zone, date_time),
                    all_day: false,
                    timezone: Some(zone.name().to_string()),
                },
                Err(_) => {
                    warn!(href = %href, tzid = %tzid, "Unknown TZID; reading as UTC");
                    Timed {
                        at: Utc.from_utc_datetime(&date_time),
                        all_day: false,
                        timezone: None,
                    }
                }
            }
        }
    };
    Ok(timed)
}

/// EXDATE / RDATE values, comma lists and PERIOD starts included.
fn read_instant_list(prop: &ParsedProperty<'_>, default_zone: Tz) -> Vec<DateTime<Utc>> {
    let param = |key: &str| {
        prop.params
            .iter()
            .find(|p| p.key == key)
            .and_then(|p| p.val.as_ref().map(|v| v.to_string()))
    };
    let is_date = param("VALUE").is_some_and(|v| v.eq_ignore_ascii_case("DATE"));
    let zone = param("TZID")
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(default_zone);

    prop.val
        .as_ref()
        .split(',')
        .filter_map(|raw| {
            let raw = raw.trim().split('/').next().unwrap_or_default();
            if raw.is_empty() {
                return None;
            }
            if is_date || raw.len() == 8 {
                return NaiveDate::parse_from_str(raw, DATE_FORMAT)
                    .ok()
                    .map(midnight_utc);
            }
            if raw.ends_with('Z') {
                return parse_utc(raw);
            }
            NaiveDateTime::parse_from_str(raw, LOCAL_FORMAT)
                .ok()
                .map(|wall| resolve_local(zone, wall))
        })
        .collect()
}

fn text(vevent: &ParsedComponent<'_>, name: &str) -> Option<String> {
    vevent
        .find_prop(name)
        .map(|p| unescape(p.val.as_ref()))
        .filter(|v| !v.trim().is_empty())
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

fn parse_utc(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), UTC_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(chrono::NaiveTime::MIN))
}

/// Parses `[+-]P[nW][nD][T[nH][nM][nS]]`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, rest) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let rest = rest.strip_prefix('P')?;

    let mut total = Duration::zero();
    let mut number = String::new();
    let mut in_time = false;
    for c in rest.chars() {
        match c {
            'T' => in_time = true,
            '0'..='9' => number.push(c),
            unit => {
                let n: i64 = number.parse().ok()?;
                number.clear();
                total += match (unit, in_time) {
                    ('W', false) => Duration::weeks(n),
                    ('D', false) => Duration::days(n),
                    ('H', true) => Duration::hours(n),
                    ('M', true) => Duration::minutes(n),
                    ('S', true) => Duration::seconds(n),
                    _ => return None,
                };
            }
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(if negative { -total } else { total })
}

// =============================================================================
// Rendering
// =============================================================================

/// Renders a master and its exceptions as one resource.
///
/// ## Arguments
/// * `master` - The series (or single) event
/// * `exceptions` - Its exception events; deleted ones are skipped
pub fn render_event(master: &Event, exceptions: &[Event]) -> String {
    let zone = master.nominal_zone().unwrap_or(Tz::UTC);

    let mut calendar = Calendar::new();

    let mut vevent = base_component(master, zone);
    if let Some(ref rule) = master.rrule {
        vevent.add_property("RRULE", rule.as_str());
    }
    if !master.exdates.is_empty() {
        vevent.append_multi_property(Property::new("EXDATE", join_utc(&master.exdates)));
    }
    if !master.rdates.is_empty() {
        vevent.append_multi_property(Property::new("RDATE", join_utc(&master.rdates)));
    }
    calendar.push(vevent.done());

    for exception in exceptions.iter().filter(|e| !e.is_deleted()) {
        let Some(instance) = exception.original_instance_time else {
            continue;
        };
        let mut vevent = base_component(exception, zone);
        vevent.append_property(time_property("RECURRENCE-ID", instance, master.all_day, zone));
        calendar.push(vevent.done());
    }

    calendar.done().to_string()
}

fn base_component(event: &Event, zone: Tz) -> icalendar::Event {
    let mut vevent = icalendar::Event::new();
    vevent.uid(&event.uid);
    vevent.summary(&event.summary);
    if let Some(ref description) = event.description {
        vevent.description(description);
    }
    if let Some(ref location) = event.location {
        vevent.location(location);
    }
    vevent.append_property(time_property("DTSTART", event.start, event.all_day, zone));
    vevent.append_property(time_property("DTEND", event.end, event.all_day, zone));
    vevent.add_property("SEQUENCE", event.sequence.to_string());
    vevent.add_property("LAST-MODIFIED", event.updated_at.format(UTC_FORMAT).to_string());
    vevent
}

fn time_property(name: &str, at: DateTime<Utc>, all_day: bool, zone: Tz) -> Property {
    if all_day {
        let mut prop = Property::new(name, at.date_naive().format(DATE_FORMAT).to_string());
        prop.append_parameter(ValueType::Date);
        return prop;
    }
    if zone == Tz::UTC {
        return Property::new(name, at.format(UTC_FORMAT).to_string());
    }
    let local = at.with_timezone(&zone).naive_local();
    let mut prop = Property::new(name, local.format(LOCAL_FORMAT).to_string());
    prop.add_parameter("TZID", zone.name());
    prop
}

fn join_utc(instants: &[DateTime<Utc>]) -> String {
    instants
        .iter()
        .map(|i| i.format(UTC_FORMAT).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Resource name for a new event: `<uid>.ics` under the collection.
pub fn resource_name(uid: &str) -> String {
    let safe: String = uid
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || "-_.@".contains(c) { c } else { '_' })
        .collect();
    format!("{}.ics", safe)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use caldera_core::SyncState;

    const SERIES: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:-//Test//EN\r\n\
BEGIN:VEVENT\r\n\
UID:standup@example.com\r\n\
DTSTAMP:20240101T000000Z\r\n\
DTSTART;TZID=Europe/Berlin:20240304T090000\r\n\
DTEND;TZID=Europe/Berlin:20240304T091500\r\n\
SUMMARY:Standup\\, daily\r\n\
RRULE:FREQ=DAILY;COUNT=5\r\n\
EXDATE;TZID=Europe/Berlin:20240305T090000\r\n\
SEQUENCE:2\r\n\
LAST-MODIFIED:20240301T120000Z\r\n\
END:VEVENT\r\n\
BEGIN:VEVENT\r\n\
UID:standup@example.com\r\n\
DTSTAMP:20240101T000000Z\r\n\
RECURRENCE-ID;TZID=Europe/Berlin:20240306T090000\r\n\
DTSTART;TZID=Europe/Berlin:20240306T100000\r\n\
DURATION:PT30M\r\n\
SUMMARY:Standup (moved)\r\n\
END:VEVENT\r\n\
BEGIN:VTODO\r\n\
UID:todo@example.com\r\n\
SUMMARY:ignored\r\n\
END:VTODO\r\n\
END:VCALENDAR\r\n";

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_parse_series_with_override() {
        let remote = parse_resource(SERIES, "https://dav.example.com/cal/a.ics", Some("\"1\"")).unwrap();
        assert_eq!(remote.uid, "standup@example.com");
        assert_eq!(remote.etag.as_deref(), Some("\"1\""));

        let master = remote.master.unwrap();
        assert_eq!(master.summary, "Standup, daily");
        assert_eq!(master.start, utc(2024, 3, 4, 8, 0));
        assert_eq!(master.end, utc(2024, 3, 4, 8, 15));
        assert_eq!(master.timezone.as_deref(), Some("Europe/Berlin"));
        assert_eq!(master.rrule.as_deref(), Some("FREQ=DAILY;COUNT=5"));
        assert_eq!(master.exdates, vec![utc(2024, 3, 5, 8, 0)]);
        assert_eq!(master.sequence, 2);
        assert_eq!(master.last_modified, Some(utc(2024, 3, 1, 12, 0)));

        assert_eq!(remote.overrides.len(), 1);
        let moved = &remote.overrides[0];
        assert_eq!(moved.recurrence_id, Some(utc(2024, 3, 6, 8, 0)));
        assert_eq!(moved.start, utc(2024, 3, 6, 9, 0));
        assert_eq!(moved.end, utc(2024, 3, 6, 9, 30));
    }

    #[test]
    fn test_parse_all_day_without_end() {
        let body = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:x\r\nBEGIN:VEVENT\r\n\
UID:holiday\r\nDTSTART;VALUE=DATE:20241225\r\nSUMMARY:Holiday\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let remote = parse_resource(body, "/h.ics", None).unwrap();
        let master = remote.master.unwrap();
        assert!(master.all_day);
        assert_eq!(master.start, utc(2024, 12, 25, 0, 0));
        assert_eq!(master.end, utc(2024, 12, 26, 0, 0));
    }

    #[test]
    fn test_parse_rejects_broken_bodies() {
        assert!(parse_resource("not a calendar", "/x.ics", None).is_err());
        let no_uid = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:x\r\nBEGIN:VEVENT\r\n\
DTSTART:20240101T000000Z\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        assert!(matches!(
            parse_resource(no_uid, "/x.ics", None),
            Err(SyncError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_render_then_parse_keeps_series() {
        let start = utc(2024, 3, 4, 8, 0);
        let master = Event {
            id: "m".into(),
            uid: "standup@caldera".into(),
            calendar_id: "cal".into(),
            summary: "Standup".into(),
            description: Some("Daily sync".into()),
            location: None,
            start,
            end: start + Duration::minutes(15),
            all_day: false,
            timezone: Some("Europe/Berlin".into()),
            rrule: Some("FREQ=DAILY;COUNT=5".into()),
            exdates: vec![utc(2024, 3, 5, 8, 0)],
            rdates: vec![],
            sequence: 3,
            sync_state: SyncState::PendingUpdate,
            remote_url: None,
            etag: None,
            original_event_id: None,
            original_instance_time: None,
            has_conflict: false,
            created_at: start,
            updated_at: start,
        };
        let mut exception = master.clone();
        exception.id = "x".into();
        exception.rrule = None;
        exception.exdates = vec![];
        exception.summary = "Standup (moved)".into();
        exception.start = utc(2024, 3, 6, 9, 0);
        exception.end = utc(2024, 3, 6, 9, 15);
        exception.original_event_id = Some("m".into());
        exception.original_instance_time = Some(utc(2024, 3, 6, 8, 0));

        let mut deleted = exception.clone();
        deleted.id = "d".into();
        deleted.original_instance_time = Some(utc(2024, 3, 7, 8, 0));
        deleted.sync_state = SyncState::PendingDelete;

        let body = render_event(&master, &[exception, deleted]);
        assert!(body.contains("DTSTART;TZID=Europe/Berlin:20240304T090000"));
        assert!(body.contains("EXDATE:20240305T080000Z"));

        let parsed = parse_resource(&body, "/standup.ics", None).unwrap();
        let parsed_master = parsed.master.unwrap();
        assert_eq!(parsed_master.start, master.start);
        assert_eq!(parsed_master.exdates, master.exdates);
        assert_eq!(parsed_master.sequence, 3);
        assert_eq!(parsed.overrides.len(), 1);
        assert_eq!(parsed.overrides[0].recurrence_id, Some(utc(2024, 3, 6, 8, 0)));
        assert_eq!(parsed.overrides[0].summary, "Standup (moved)");
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("PT1H30M"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("P1W"), Some(Duration::weeks(1)));
        assert_eq!(parse_duration("-P1DT2H"), Some(-Duration::hours(26)));
        assert_eq!(parse_duration("P1H"), None);
        assert_eq!(parse_duration("1H"), None);
    }

    #[test]
    fn test_resource_name_is_url_safe() {
        assert_eq!(resource_name("abc@caldera"), "abc@caldera.ics");
        assert_eq!(resource_name("a/b c"), "a_b_c.ics");
    }
}
