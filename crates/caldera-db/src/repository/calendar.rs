//! # Calendar Repository
//!
//! Local and remote calendar collections.
//!
//! Remote calendars are upserted by discovery, keyed by collection URL, so
//! re-running discovery never duplicates a calendar and never loses the
//! stored `ctag` / `sync_token`.

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use caldera_core::{to_second, Calendar, CalendarKind};

use crate::error::{DbError, DbResult};

const CALENDAR_COLUMNS: &str = "id, account_id, display_name, kind, remote_url, ctag, sync_token, \
                                color, created_at, updated_at";

/// Repository for calendar operations.
#[derive(Debug, Clone)]
pub struct CalendarRepository {
    pool: SqlitePool,
}

impl CalendarRepository {
    /// Creates a new CalendarRepository.
    pub fn new(pool: SqlitePool) -> Self {
        CalendarRepository { pool }
    }

    /// Creates a device-only calendar.
    pub async fn create_local(&self, display_name: &str) -> DbResult<Calendar> {
        let calendar = new_calendar(display_name, CalendarKind::Local, None, None);
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, &calendar).await?;
        info!(calendar_id = %calendar.id, "Created local calendar");
        Ok(calendar)
    }

    /// Creates a remote calendar for a known collection URL.
    pub async fn create_remote(
        &self,
        account_id: &str,
        display_name: &str,
        remote_url: &str,
    ) -> DbResult<Calendar> {
        let calendar = new_calendar(
            display_name,
            CalendarKind::Remote,
            Some(account_id.to_string()),
            Some(remote_url.to_string()),
        );
        let mut conn = self.pool.acquire().await?;
        insert(&mut conn, &calendar).await?;
        info!(calendar_id = %calendar.id, url = %remote_url, "Created remote calendar");
        Ok(calendar)
    }

    /// Inserts or refreshes a discovered remote calendar.
    ///
    /// Display name and color are refreshed; `ctag` and `sync_token` are left
    /// alone so the next delta sync still knows what it has seen.
    pub async fn upsert_remote(
        &self,
        account_id: &str,
        remote_url: &str,
        display_name: &str,
        color: Option<&str>,
    ) -> DbResult<Calendar> {
        let mut conn = self.pool.acquire().await?;

        if let Some(mut existing) = fetch_by_url(&mut conn, remote_url).await? {
            existing.display_name = display_name.to_string();
            existing.color = color.map(String::from);
            existing.account_id = Some(account_id.to_string());
            existing.updated_at = to_second(Utc::now());

            sqlx::query(
                "UPDATE calendars SET display_name = ?2, color = ?3, account_id = ?4, updated_at = ?5 \
                 WHERE id = ?1",
            )
            .bind(&existing.id)
            .bind(&existing.display_name)
            .bind(&existing.color)
            .bind(&existing.account_id)
            .bind(existing.updated_at)
            .execute(&mut *conn)
            .await?;

            debug!(calendar_id = %existing.id, "Refreshed remote calendar");
            return Ok(existing);
        }

        let mut calendar = new_calendar(
            display_name,
            CalendarKind::Remote,
            Some(account_id.to_string()),
            Some(remote_url.to_string()),
        );
        calendar.color = color.map(String::from);
        insert(&mut conn, &calendar).await?;
        info!(calendar_id = %calendar.id, url = %remote_url, "Discovered remote calendar");
        Ok(calendar)
    }

    /// Gets a calendar by ID.
    pub async fn get(&self, id: &str) -> DbResult<Option<Calendar>> {
        let mut conn = self.pool.acquire().await?;
        fetch(&mut conn, id).await
    }

    /// Gets a calendar by ID, failing with NotFound.
    pub async fn require(&self, id: &str) -> DbResult<Calendar> {
        self.get(id)
            .await?
            .ok_or_else(|| DbError::not_found("Calendar", id))
    }

    /// Lists all calendars ordered by name.
    pub async fn list(&self) -> DbResult<Vec<Calendar>> {
        let sql = format!("SELECT {} FROM calendars ORDER BY display_name ASC", CALENDAR_COLUMNS);
        let calendars = sqlx::query_as::<_, Calendar>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(calendars)
    }

    /// Lists remote calendars, optionally for one account.
    pub async fn list_remote(&self, account_id: Option<&str>) -> DbResult<Vec<Calendar>> {
        let sql = format!(
            "SELECT {} FROM calendars WHERE kind = 'remote' AND (?1 IS NULL OR account_id = ?1) \
             ORDER BY display_name ASC",
            CALENDAR_COLUMNS
        );
        let calendars = sqlx::query_as::<_, Calendar>(&sql)
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(calendars)
    }

    /// Records the collection state after a delta sync.
    pub async fn update_sync_state(
        &self,
        id: &str,
        ctag: Option<&str>,
        sync_token: Option<&str>,
    ) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE calendars SET ctag = ?2, sync_token = ?3, updated_at = ?4 WHERE id = ?1",
        )
        .bind(id)
        .bind(ctag)
        .bind(sync_token)
        .bind(to_second(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Calendar", id));
        }
        Ok(())
    }

    /// Forgets every stored sync token (forced full sync).
    pub async fn clear_sync_tokens(&self) -> DbResult<u64> {
        let result = sqlx::query("UPDATE calendars SET sync_token = NULL, ctag = NULL WHERE kind = 'remote'")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Deletes a calendar that holds no events.
    pub async fn delete(&self, id: &str) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE calendar_id = ?1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        if events > 0 {
            return Err(DbError::invalid_state(format!(
                "calendar {} still holds {} events",
                id, events
            )));
        }

        let result = sqlx::query("DELETE FROM calendars WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Calendar", id));
        }

        tx.commit().await?;
        Ok(())
    }
}

fn new_calendar(
    display_name: &str,
    kind: CalendarKind,
    account_id: Option<String>,
    remote_url: Option<String>,
) -> Calendar {
    let now = to_second(Utc::now());
    Calendar {
        id: Uuid::new_v4().to_string(),
        account_id,
        display_name: display_name.to_string(),
        kind,
        remote_url,
        ctag: None,
        sync_token: None,
        color: None,
        created_at: now,
        updated_at: now,
    }
}

// =============================================================================
// Connection-Level Queries
// =============================================================================
// Used inside Writer transactions (`&mut *tx`).

pub(crate) async fn fetch(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Calendar>> {
    let sql = format!("SELECT {} FROM calendars WHERE id = ?1", CALENDAR_COLUMNS);
    let calendar = sqlx::query_as::<_, Calendar>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(calendar)
}

pub(crate) async fn fetch_by_url(
    conn: &mut SqliteConnection,
    remote_url: &str,
) -> DbResult<Option<Calendar>> {
    let sql = format!("SELECT {} FROM calendars WHERE remote_url = ?1", CALENDAR_COLUMNS);
    let calendar = sqlx::query_as::<_, Calendar>(&sql)
        .bind(remote_url)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(calendar)
}

pub(crate) async fn insert(conn: &mut SqliteConnection, calendar: &Calendar) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO calendars (
            id, account_id, display_name, kind, remote_url,
            ctag, sync_token, color, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&calendar.id)
    .bind(&calendar.account_id)
    .bind(&calendar.display_name)
    .bind(calendar.kind)
    .bind(&calendar.remote_url)
    .bind(&calendar.ctag)
    .bind(&calendar.sync_token)
    .bind(&calendar.color)
    .bind(calendar.created_at)
    .bind(calendar.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_create_and_list() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.calendars();

        let local = repo.create_local("Personal").await.unwrap();
        let remote = repo
            .create_remote("acct-1", "Work", "https://dav.example.com/cal/work/")
            .await
            .unwrap();

        assert!(!local.is_remote());
        assert!(remote.is_remote());
        assert_eq!(repo.list().await.unwrap().len(), 2);
        assert_eq!(repo.list_remote(None).await.unwrap().len(), 1);
        assert_eq!(repo.list_remote(Some("acct-2")).await.unwrap().len(), 0);
        assert_eq!(repo.get(&local.id).await.unwrap(), Some(local));
    }

    #[tokio::test]
    async fn test_upsert_remote_keeps_sync_state() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.calendars();
        let url = "https://dav.example.com/cal/work/";

        let first = repo.upsert_remote("acct-1", url, "Work", None).await.unwrap();
        repo.update_sync_state(&first.id, Some("ctag-1"), Some("token-1"))
            .await
            .unwrap();

        let second = repo
            .upsert_remote("acct-1", url, "Work (renamed)", Some("#ff0000"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.display_name, "Work (renamed)");
        assert_eq!(second.sync_token.as_deref(), Some("token-1"));
        assert_eq!(repo.list().await.unwrap().len(), 1);

        assert_eq!(repo.clear_sync_tokens().await.unwrap(), 1);
        assert!(repo.require(&first.id).await.unwrap().sync_token.is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = db.calendars().delete("nope").await.unwrap_err();
        assert!(matches!(err, crate::DbError::NotFound { .. }));
    }
}
