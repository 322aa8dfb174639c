//! # Occurrence Repository
//!
//! The materialized schedule: one row per `(event_id, instance_time)`.
//!
//! ## Range Query
//! ```text
//!   window:            [start ─────────────── end)
//!   row A:        [────────)                          overlaps
//!   row B:                        [──────)            overlaps
//!   row C:                                   [────)   starts at end: excluded
//!   row D (zero):              │                      inside: included
//! ```
//!
//! Cancelled rows stay in the table (they still own their instance) but are
//! never returned by range or day queries.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};

use caldera_core::recurrence;
use caldera_core::{ExpandedInstance, ExpansionWindow, Occurrence};

use crate::error::{DbError, DbResult};
use crate::repository::event;

const OCCURRENCE_COLUMNS: &str = "id, event_id, calendar_id, instance_time, start_at, end_at, \
                                  start_day, end_day, cancelled, exception_event_id";

/// Rows per multi-row INSERT (10 binds each, under SQLite's 999 limit).
const INSERT_CHUNK: usize = 90;

/// Read-side repository for occurrences.
#[derive(Debug, Clone)]
pub struct OccurrenceRepository {
    pool: SqlitePool,
}

impl OccurrenceRepository {
    /// Creates a new OccurrenceRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OccurrenceRepository { pool }
    }

    /// Visible occurrences overlapping `[start, end)`, ordered by start.
    ///
    /// ## Arguments
    /// * `calendar_ids` - Restrict to these calendars; `None` means all.
    ///   An empty slice matches nothing.
    pub async fn in_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        calendar_ids: Option<&[String]>,
    ) -> DbResult<Vec<Occurrence>> {
        if matches!(calendar_ids, Some(ids) if ids.is_empty()) || end <= start {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT ");
        builder.push(OCCURRENCE_COLUMNS);
        builder.push(" FROM occurrences WHERE cancelled = 0 AND start_at < ");
        builder.push_bind(end);
        builder.push(" AND (end_at > ");
        builder.push_bind(start);
        builder.push(" OR (end_at = start_at AND start_at >= ");
        builder.push_bind(start);
        builder.push("))");

        if let Some(ids) = calendar_ids {
            builder.push(" AND calendar_id IN (");
            let mut separated = builder.separated(", ");
            for id in ids {
                separated.push_bind(id);
            }
            separated.push_unseparated(")");
        }

        builder.push(" ORDER BY start_at ASC, event_id ASC");

        let rows = builder
            .build_query_as::<Occurrence>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Visible occurrences touching a `YYYYMMDD` day key.
    pub async fn on_day(&self, day: i64) -> DbResult<Vec<Occurrence>> {
        let sql = format!(
            "SELECT {} FROM occurrences WHERE cancelled = 0 AND start_day <= ?1 AND end_day >= ?1 \
             ORDER BY start_at ASC, event_id ASC",
            OCCURRENCE_COLUMNS
        );
        let rows = sqlx::query_as::<_, Occurrence>(&sql)
            .bind(day)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Every row of an event, cancelled ones included.
    pub async fn for_event(&self, event_id: &str) -> DbResult<Vec<Occurrence>> {
        let sql = format!(
            "SELECT {} FROM occurrences WHERE event_id = ?1 ORDER BY instance_time ASC",
            OCCURRENCE_COLUMNS
        );
        let rows = sqlx::query_as::<_, Occurrence>(&sql)
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Number of rows (cancelled included) owned by an event.
    pub async fn count_for_event(&self, event_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM occurrences WHERE event_id = ?1")
            .bind(event_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Expands a stored event over a window without touching the schedule.
    ///
    /// Unparseable recurrence yields an empty list.
    pub async fn preview(
        &self,
        event_id: &str,
        window: &ExpansionWindow,
    ) -> DbResult<Vec<ExpandedInstance>> {
        let mut conn = self.pool.acquire().await?;
        let event = event::fetch(&mut conn, event_id)
            .await?
            .ok_or_else(|| DbError::not_found("Event", event_id))?;
        Ok(recurrence::preview(&event, window))
    }
}

// =============================================================================
// Connection-Level Queries
// =============================================================================

pub(crate) async fn insert_many(conn: &mut SqliteConnection, rows: &[Occurrence]) -> DbResult<()> {
    for chunk in rows.chunks(INSERT_CHUNK) {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("INSERT INTO occurrences (");
        builder.push(OCCURRENCE_COLUMNS);
        builder.push(") ");
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(&row.id)
                .push_bind(&row.event_id)
                .push_bind(&row.calendar_id)
                .push_bind(row.instance_time)
                .push_bind(row.start_at)
                .push_bind(row.end_at)
                .push_bind(row.start_day)
                .push_bind(row.end_day)
                .push_bind(row.cancelled)
                .push_bind(&row.exception_event_id);
        });
        builder.build().execute(&mut *conn).await?;
    }
    Ok(())
}

pub(crate) async fn delete_for_event(conn: &mut SqliteConnection, event_id: &str) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM occurrences WHERE event_id = ?1")
        .bind(event_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Rows of a master that are overridden by an exception.
pub(crate) async fn linked_rows(
    conn: &mut SqliteConnection,
    event_id: &str,
) -> DbResult<Vec<Occurrence>> {
    let sql = format!(
        "SELECT {} FROM occurrences WHERE event_id = ?1 AND exception_event_id IS NOT NULL",
        OCCURRENCE_COLUMNS
    );
    let rows = sqlx::query_as::<_, Occurrence>(&sql)
        .bind(event_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows)
}

pub(crate) async fn fetch_at(
    conn: &mut SqliteConnection,
    event_id: &str,
    instance_time: DateTime<Utc>,
) -> DbResult<Option<Occurrence>> {
    let sql = format!(
        "SELECT {} FROM occurrences WHERE event_id = ?1 AND instance_time = ?2",
        OCCURRENCE_COLUMNS
    );
    let row = sqlx::query_as::<_, Occurrence>(&sql)
        .bind(event_id)
        .bind(instance_time)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row)
}

/// Inserts or overwrites the row for `(event_id, instance_time)`.
pub(crate) async fn upsert(conn: &mut SqliteConnection, row: &Occurrence) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO occurrences (
            id, event_id, calendar_id, instance_time, start_at, end_at,
            start_day, end_day, cancelled, exception_event_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        ON CONFLICT(id) DO UPDATE SET
            calendar_id = excluded.calendar_id,
            start_at = excluded.start_at,
            end_at = excluded.end_at,
            start_day = excluded.start_day,
            end_day = excluded.end_day,
            cancelled = excluded.cancelled,
            exception_event_id = excluded.exception_event_id
        "#,
    )
    .bind(&row.id)
    .bind(&row.event_id)
    .bind(&row.calendar_id)
    .bind(row.instance_time)
    .bind(row.start_at)
    .bind(row.end_at)
    .bind(row.start_day)
    .bind(row.end_day)
    .bind(row.cancelled)
    .bind(&row.exception_event_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Marks an instance cancelled and drops its exception link.
pub(crate) async fn cancel_instance(
    conn: &mut SqliteConnection,
    event_id: &str,
    instance_time: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE occurrences SET cancelled = 1, exception_event_id = NULL \
         WHERE event_id = ?1 AND instance_time = ?2",
    )
    .bind(event_id)
    .bind(instance_time)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn set_calendar(
    conn: &mut SqliteConnection,
    event_id: &str,
    calendar_id: &str,
) -> DbResult<u64> {
    let result = sqlx::query("UPDATE occurrences SET calendar_id = ?2 WHERE event_id = ?1")
        .bind(event_id)
        .bind(calendar_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Removes rows an exception event produced as its own owner.
///
/// Exceptions are represented by the master's linked row, never by rows of
/// their own.
pub(crate) async fn delete_owned_by_exceptions(
    conn: &mut SqliteConnection,
    master_id: &str,
) -> DbResult<u64> {
    let result = sqlx::query(
        "DELETE FROM occurrences WHERE event_id IN \
         (SELECT id FROM events WHERE original_event_id = ?1)",
    )
    .bind(master_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}
