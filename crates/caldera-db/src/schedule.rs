//! # Schedule Materialization
//!
//! Rebuilds the occurrence rows of one master inside the caller's
//! transaction.
//!
//! ## Regeneration
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    regenerate(master)                                   │
//! │                                                                         │
//! │  expand(master, [start, max(now, start) + horizon])                    │
//! │       │                                                                 │
//! │       ├── Err ──► warn, leave existing rows untouched                  │
//! │       ▼                                                                 │
//! │  remember cancelled flags of exception-linked rows                     │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DELETE master rows ──► INSERT expanded rows                           │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  link each exception whose instance the rule still produces            │
//! │  (timing from the exception, instance_time from the rule)              │
//! │  others stay stored but unlinked until the rule produces them again    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  DELETE rows owned by exception events                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use caldera_core::recurrence::{self, day_span};
use caldera_core::{Event, ExpansionWindow, Occurrence};

use crate::error::DbResult;
use crate::repository::{event, occurrence};

/// What one regeneration produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegenerationReport {
    /// Rows written from the expansion.
    pub generated: usize,
    /// Exceptions linked onto their instance rows.
    pub linked: usize,
    /// Exceptions whose instance the rule no longer produces in the window.
    pub orphaned: usize,
    /// True when expansion failed and the rows were left as they were.
    pub skipped: bool,
}

/// Window materialized for an event.
///
/// From the event's own start up to `max(now, start) + horizon_days`.
pub fn materialization_window(event: &Event, now: DateTime<Utc>, horizon_days: i64) -> ExpansionWindow {
    let anchor = now.max(event.start);
    ExpansionWindow::new(event.start, anchor + Duration::days(horizon_days))
}

/// Replaces the occurrence rows of `master`.
///
/// Exception events are ignored; their instance lives on the master's row.
pub(crate) async fn regenerate(
    conn: &mut SqliteConnection,
    master: &Event,
    now: DateTime<Utc>,
    horizon_days: i64,
) -> DbResult<RegenerationReport> {
    if master.is_exception() {
        return Ok(RegenerationReport::default());
    }

    let window = materialization_window(master, now, horizon_days);
    let instances = match recurrence::expand(master, Some(&window)) {
        Ok(instances) => instances,
        Err(e) => {
            warn!(
                event_id = %master.id,
                error = %e,
                "Recurrence could not be expanded; keeping existing occurrences"
            );
            return Ok(RegenerationReport {
                skipped: true,
                ..RegenerationReport::default()
            });
        }
    };

    let prior_cancelled: HashMap<DateTime<Utc>, bool> = occurrence::linked_rows(conn, &master.id)
        .await?
        .into_iter()
        .map(|row| (row.instance_time, row.cancelled))
        .collect();

    let exceptions = event::fetch_exceptions(conn, &master.id).await?;

    occurrence::delete_for_event(conn, &master.id).await?;

    let rows: Vec<Occurrence> = instances
        .iter()
        .map(|i| Occurrence {
            id: Occurrence::make_id(&master.id, i.instance_time),
            event_id: master.id.clone(),
            calendar_id: master.calendar_id.clone(),
            instance_time: i.instance_time,
            start_at: i.start,
            end_at: i.end,
            start_day: i.start_day,
            end_day: i.end_day,
            cancelled: i.cancelled,
            exception_event_id: None,
        })
        .collect();
    occurrence::insert_many(conn, &rows).await?;

    let expanded: HashSet<DateTime<Utc>> = rows.iter().map(|r| r.instance_time).collect();
    let mut linked = 0;
    let mut orphaned = 0;
    for exception in &exceptions {
        let instance_time = match exception.original_instance_time {
            Some(at) => at,
            None => continue,
        };
        if !expanded.contains(&instance_time) {
            if instance_time >= window.start && instance_time < window.end {
                debug!(
                    event_id = %master.id,
                    exception_id = %exception.id,
                    instance = %instance_time,
                    "Exception no longer matches an occurrence; left unlinked"
                );
                orphaned += 1;
            }
            continue;
        }
        let cancelled = prior_cancelled
            .get(&instance_time)
            .copied()
            .unwrap_or_else(|| master.exdates.contains(&instance_time));
        if link_exception(conn, master, exception, cancelled).await? {
            linked += 1;
        }
    }

    occurrence::delete_owned_by_exceptions(conn, &master.id).await?;

    debug!(
        event_id = %master.id,
        generated = rows.len(),
        linked,
        orphaned,
        "Regenerated occurrences"
    );

    Ok(RegenerationReport {
        generated: rows.len(),
        linked,
        orphaned,
        skipped: false,
    })
}

/// Writes an exception's timing onto the master's row for its instance.
///
/// ## Returns
/// `false` if the exception has no `original_instance_time`.
pub(crate) async fn link_exception(
    conn: &mut SqliteConnection,
    master: &Event,
    exception: &Event,
    cancelled: bool,
) -> DbResult<bool> {
    let instance_time = match exception.original_instance_time {
        Some(at) => at,
        None => return Ok(false),
    };

    let zone = exception
        .nominal_zone()
        .or_else(|_| master.nominal_zone())
        .unwrap_or(chrono_tz::UTC);
    let (start_day, end_day) = day_span(zone, exception.start, exception.end);

    let row = Occurrence {
        id: Occurrence::make_id(&master.id, instance_time),
        event_id: master.id.clone(),
        calendar_id: master.calendar_id.clone(),
        instance_time,
        start_at: exception.start,
        end_at: exception.end,
        start_day,
        end_day,
        cancelled,
        exception_event_id: Some(exception.id.clone()),
    };
    occurrence::upsert(conn, &row).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_anchors_on_later_of_now_and_start() {
        let start = Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut event = crate::test_support::event_at(start);

        let window = materialization_window(&event, now, 10);
        assert_eq!(window.start, start);
        assert_eq!(window.end, start + Duration::days(10));

        event.start = Utc.with_ymd_and_hms(2020, 1, 1, 9, 0, 0).unwrap();
        let window = materialization_window(&event, now, 10);
        assert_eq!(window.start, event.start);
        assert_eq!(window.end, now + Duration::days(10));
    }
}
