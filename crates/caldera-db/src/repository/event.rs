//! # Event Repository
//!
//! Read access to events plus the connection-level statements the Writer
//! runs inside its transactions.
//!
//! ## Row Mapping
//! ```text
//! events row                         Event
//! ──────────                         ─────
//! start_at / end_at (TEXT)     ──►   start / end (DateTime<Utc>)
//! exdates / rdates (JSON TEXT) ──►   Vec<DateTime<Utc>>
//! sync_state (TEXT)            ──►   SyncState
//! ```
//!
//! Events never change except through the Writer, so this repository has no
//! public mutating methods.

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqliteConnection, SqlitePool};

use caldera_core::{instants_from_json, instants_to_json, Event, SyncState};

use crate::error::{DbError, DbResult};

const EVENT_COLUMNS: &str = "id, uid, calendar_id, summary, description, location, start_at, end_at, \
                             all_day, timezone, rrule, exdates, rdates, sequence, sync_state, \
                             remote_url, etag, original_event_id, original_instance_time, \
                             has_conflict, created_at, updated_at";

// =============================================================================
// Row Type
// =============================================================================

#[derive(Debug, FromRow)]
struct EventRow {
    id: String,
    uid: String,
    calendar_id: String,
    summary: String,
    description: Option<String>,
    location: Option<String>,
    start_at: DateTime<Utc>,
    end_at: DateTime<Utc>,
    all_day: bool,
    timezone: Option<String>,
    rrule: Option<String>,
    exdates: String,
    rdates: String,
    sequence: i64,
    sync_state: SyncState,
    remote_url: Option<String>,
    etag: Option<String>,
    original_event_id: Option<String>,
    original_instance_time: Option<DateTime<Utc>>,
    has_conflict: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for Event {
    type Error = DbError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let exdates =
            instants_from_json(&row.exdates).map_err(|e| DbError::corrupt("exdates", &row.id, e))?;
        let rdates =
            instants_from_json(&row.rdates).map_err(|e| DbError::corrupt("rdates", &row.id, e))?;

        Ok(Event {
            id: row.id,
            uid: row.uid,
            calendar_id: row.calendar_id,
            summary: row.summary,
            description: row.description,
            location: row.location,
            start: row.start_at,
            end: row.end_at,
            all_day: row.all_day,
            timezone: row.timezone,
            rrule: row.rrule,
            exdates,
            rdates,
            sequence: row.sequence,
            sync_state: row.sync_state,
            remote_url: row.remote_url,
            etag: row.etag,
            original_event_id: row.original_event_id,
            original_instance_time: row.original_instance_time,
            has_conflict: row.has_conflict,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn collect(rows: Vec<EventRow>) -> DbResult<Vec<Event>> {
    rows.into_iter().map(Event::try_from).collect()
}

// =============================================================================
// Repository
// =============================================================================

/// Read-side repository for events.
#[derive(Debug, Clone)]
pub struct EventRepository {
    pool: SqlitePool,
}

impl EventRepository {
    /// Creates a new EventRepository.
    pub fn new(pool: SqlitePool) -> Self {
        EventRepository { pool }
    }

    /// Gets an event by ID (including soft-deleted ones).
    pub async fn get(&self, id: &str) -> DbResult<Option<Event>> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, id).await
    }

    /// Gets a master event by iCalendar UID.
    pub async fn get_by_uid(&self, uid: &str) -> DbResult<Option<Event>> {
        let mut conn = self.pool.acquire().await?;
        fetch_master_by_uid(&mut conn, uid).await
    }

    /// Gets a master event by its server resource URL.
    pub async fn get_by_remote_url(&self, remote_url: &str) -> DbResult<Option<Event>> {
        let mut conn = self.pool.acquire().await?;
        fetch_by_remote_url(&mut conn, remote_url).await
    }

    /// Lists live master events of a calendar ordered by start.
    pub async fn list_by_calendar(&self, calendar_id: &str) -> DbResult<Vec<Event>> {
        let sql = format!(
            "SELECT {} FROM events WHERE calendar_id = ?1 AND original_event_id IS NULL \
             AND sync_state != 'pending_delete' ORDER BY start_at ASC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(calendar_id)
            .fetch_all(&self.pool)
            .await?;
        collect(rows)
    }

    /// Lists the exception events of a master.
    pub async fn exceptions(&self, master_id: &str) -> DbResult<Vec<Event>> {
        let mut conn = self.pool.acquire().await?;
        fetch_exceptions(&mut conn, master_id).await
    }

    /// Lists events flagged for manual conflict resolution.
    pub async fn list_conflicts(&self) -> DbResult<Vec<Event>> {
        let sql = format!(
            "SELECT {} FROM events WHERE has_conflict = 1 ORDER BY updated_at DESC",
            EVENT_COLUMNS
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql).fetch_all(&self.pool).await?;
        collect(rows)
    }

    /// Server identities of a calendar's masters: `(event_id, remote_url, etag)`.
    ///
    /// Used to diff a server listing against local state.
    pub async fn remote_identities(
        &self,
        calendar_id: &str,
    ) -> DbResult<Vec<(String, String, Option<String>)>> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, remote_url, etag FROM events WHERE calendar_id = ?1 \
             AND original_event_id IS NULL AND remote_url IS NOT NULL",
        )
        .bind(calendar_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Counts master events per sync state.
    pub async fn count_by_state(&self, state: SyncState) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE sync_state = ?1 AND original_event_id IS NULL",
        )
        .bind(state)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// =============================================================================
// Connection-Level Queries
// =============================================================================

pub(crate) async fn fetch(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Event>> {
    let sql = format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS);
    let row = sqlx::query_as::<_, EventRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Event::try_from).transpose()
}

pub(crate) async fn fetch_master_by_uid(
    conn: &mut SqliteConnection,
    uid: &str,
) -> DbResult<Option<Event>> {
    let sql = format!(
        "SELECT {} FROM events WHERE uid = ?1 AND original_event_id IS NULL",
        EVENT_COLUMNS
    );
    let row = sqlx::query_as::<_, EventRow>(&sql)
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Event::try_from).transpose()
}

pub(crate) async fn fetch_by_remote_url(
    conn: &mut SqliteConnection,
    remote_url: &str,
) -> DbResult<Option<Event>> {
    let sql = format!(
        "SELECT {} FROM events WHERE remote_url = ?1 AND original_event_id IS NULL LIMIT 1",
        EVENT_COLUMNS
    );
    let row = sqlx::query_as::<_, EventRow>(&sql)
        .bind(remote_url)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Event::try_from).transpose()
}

/// Live exceptions of a master, ordered by the instance they replace.
pub(crate) async fn fetch_exceptions(
    conn: &mut SqliteConnection,
    master_id: &str,
) -> DbResult<Vec<Event>> {
    let sql = format!(
        "SELECT {} FROM events WHERE original_event_id = ?1 AND sync_state != 'pending_delete' \
         ORDER BY original_instance_time ASC",
        EVENT_COLUMNS
    );
    let rows = sqlx::query_as::<_, EventRow>(&sql)
        .bind(master_id)
        .fetch_all(&mut *conn)
        .await?;
    collect(rows)
}

pub(crate) async fn fetch_exception_at(
    conn: &mut SqliteConnection,
    master_id: &str,
    instance: DateTime<Utc>,
) -> DbResult<Option<Event>> {
    let sql = format!(
        "SELECT {} FROM events WHERE original_event_id = ?1 AND original_instance_time = ?2",
        EVENT_COLUMNS
    );
    let row = sqlx::query_as::<_, EventRow>(&sql)
        .bind(master_id)
        .bind(instance)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(Event::try_from).transpose()
}

pub(crate) async fn insert(conn: &mut SqliteConnection, event: &Event) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO events (
            id, uid, calendar_id, summary, description, location,
            start_at, end_at, all_day, timezone, rrule, exdates, rdates,
            sequence, sync_state, remote_url, etag,
            original_event_id, original_instance_time, has_conflict,
            created_at, updated_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6,
            ?7, ?8, ?9, ?10, ?11, ?12, ?13,
            ?14, ?15, ?16, ?17,
            ?18, ?19, ?20,
            ?21, ?22
        )
        "#,
    )
    .bind(&event.id)
    .bind(&event.uid)
    .bind(&event.calendar_id)
    .bind(&event.summary)
    .bind(&event.description)
    .bind(&event.location)
    .bind(event.start)
    .bind(event.end)
    .bind(event.all_day)
    .bind(&event.timezone)
    .bind(&event.rrule)
    .bind(instants_to_json(&event.exdates))
    .bind(instants_to_json(&event.rdates))
    .bind(event.sequence)
    .bind(event.sync_state)
    .bind(&event.remote_url)
    .bind(&event.etag)
    .bind(&event.original_event_id)
    .bind(event.original_instance_time)
    .bind(event.has_conflict)
    .bind(event.created_at)
    .bind(event.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Writes every mutable column of an existing event.
pub(crate) async fn update(conn: &mut SqliteConnection, event: &Event) -> DbResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE events SET
            uid = ?2, calendar_id = ?3, summary = ?4, description = ?5, location = ?6,
            start_at = ?7, end_at = ?8, all_day = ?9, timezone = ?10, rrule = ?11,
            exdates = ?12, rdates = ?13, sequence = ?14, sync_state = ?15,
            remote_url = ?16, etag = ?17, original_event_id = ?18,
            original_instance_time = ?19, has_conflict = ?20, updated_at = ?21
        WHERE id = ?1
        "#,
    )
    .bind(&event.id)
    .bind(&event.uid)
    .bind(&event.calendar_id)
    .bind(&event.summary)
    .bind(&event.description)
    .bind(&event.location)
    .bind(event.start)
    .bind(event.end)
    .bind(event.all_day)
    .bind(&event.timezone)
    .bind(&event.rrule)
    .bind(instants_to_json(&event.exdates))
    .bind(instants_to_json(&event.rdates))
    .bind(event.sequence)
    .bind(event.sync_state)
    .bind(&event.remote_url)
    .bind(&event.etag)
    .bind(&event.original_event_id)
    .bind(event.original_instance_time)
    .bind(event.has_conflict)
    .bind(event.updated_at)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(DbError::not_found("Event", &event.id));
    }
    Ok(())
}

/// Hard delete; occurrences and exceptions cascade.
pub(crate) async fn delete(conn: &mut SqliteConnection, id: &str) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM events WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_exceptions(conn: &mut SqliteConnection, master_id: &str) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM events WHERE original_event_id = ?1")
        .bind(master_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Deletes exceptions replacing instances at or after `from`.
pub(crate) async fn delete_exceptions_from(
    conn: &mut SqliteConnection,
    master_id: &str,
    from: DateTime<Utc>,
) -> DbResult<u64> {
    let result = sqlx::query(
        "DELETE FROM events WHERE original_event_id = ?1 AND original_instance_time >= ?2",
    )
    .bind(master_id)
    .bind(from)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Moves exceptions along with their master and drops their remote identity.
pub(crate) async fn reassign_exceptions(
    conn: &mut SqliteConnection,
    master_id: &str,
    calendar_id: &str,
    state: SyncState,
) -> DbResult<u64> {
    let result = sqlx::query(
        "UPDATE events SET calendar_id = ?2, sync_state = ?3, remote_url = NULL, etag = NULL \
         WHERE original_event_id = ?1",
    )
    .bind(master_id)
    .bind(calendar_id)
    .bind(state)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Sets the sync state of every exception of a master.
pub(crate) async fn set_exceptions_state(
    conn: &mut SqliteConnection,
    master_id: &str,
    state: SyncState,
) -> DbResult<u64> {
    let result = sqlx::query("UPDATE events SET sync_state = ?2 WHERE original_event_id = ?1")
        .bind(master_id)
        .bind(state)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
