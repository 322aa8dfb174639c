//! # Pending Operation Repository
//!
//! Durable queue of owed remote work, at most one operation per event.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Pending Operation Lifecycle                          │
//! │                                                                         │
//! │  Writer (same transaction as the event change)                         │
//! │       │  enqueue() ── coalesce with the queued op                      │
//! │       ▼                                                                 │
//! │  ┌─────────┐  mark_in_progress   ┌─────────────┐                        │
//! │  │ pending │ ──────────────────► │ in_progress │                        │
//! │  └─────────┘                     └──────┬──────┘                        │
//! │       ▲                                 │                               │
//! │       │  failure (retry_count < max)    │ success                       │
//! │       ├─────────────────────────────────┤ ──► deleted (revision match)  │
//! │       │                                 │                               │
//! │       │  retry_failed                   │ failure (retry_count = max)   │
//! │  ┌────┴───┐ ◄───────────────────────────┘                               │
//! │  │ failed │                                                             │
//! │  └────────┘                                                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every coalesce bumps `revision`. A worker that finishes an operation whose
//! revision moved on while it was in flight must not delete it.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use caldera_core::queue::{self, CoalesceOutcome, PlannedOperation, RetryDecision};
use caldera_core::{to_second, OperationStatus, PendingOperation};

use crate::error::DbResult;

const PENDING_COLUMNS: &str = "id, event_id, kind, target_url, target_calendar_id, retry_count, \
                               next_retry_at, last_error, status, revision, created_at, updated_at";

/// Repository for the pending operation queue.
#[derive(Debug, Clone)]
pub struct PendingOperationRepository {
    pool: SqlitePool,
}

impl PendingOperationRepository {
    /// Creates a new PendingOperationRepository.
    pub fn new(pool: SqlitePool) -> Self {
        PendingOperationRepository { pool }
    }

    /// Gets the operation queued for an event.
    pub async fn get_by_event(&self, event_id: &str) -> DbResult<Option<PendingOperation>> {
        let mut conn = self.pool.acquire().await?;
        get_by_event(&mut conn, event_id).await
    }

    /// Operations ready to run, oldest retry window first.
    ///
    /// Events flagged for manual conflict resolution are held back until
    /// the flag is cleared.
    ///
    /// ## Arguments
    /// * `ignore_backoff` - Expedited syncs run pending operations whose
    ///   retry window has not opened yet.
    pub async fn eligible(
        &self,
        now: DateTime<Utc>,
        limit: u32,
        ignore_backoff: bool,
    ) -> DbResult<Vec<PendingOperation>> {
        let sql = format!(
            "SELECT {} FROM pending_operations WHERE status = 'pending' \
             AND (?2 OR next_retry_at <= ?1) \
             AND event_id NOT IN (SELECT id FROM events WHERE has_conflict = 1) \
             ORDER BY next_retry_at ASC, created_at ASC LIMIT ?3",
            PENDING_COLUMNS
        );
        let ops = sqlx::query_as::<_, PendingOperation>(&sql)
            .bind(to_second(now))
            .bind(ignore_backoff)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(ops)
    }

    /// Claims an operation for a worker.
    ///
    /// ## Returns
    /// `false` if the operation is gone or no longer pending.
    pub async fn mark_in_progress(&self, id: &str, now: DateTime<Utc>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE pending_operations SET status = 'in_progress', updated_at = ?2 \
             WHERE id = ?1 AND status = 'pending'",
        )
        .bind(id)
        .bind(to_second(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Records a failed attempt and schedules the next one.
    ///
    /// ## Arguments
    /// * `not_before` - Server-requested earliest retry (`Retry-After`)
    ///
    /// ## Returns
    /// `None` when the operation was coalesced while in flight; it is put
    /// back to pending untouched so the newer content gets a fresh attempt.
    pub async fn mark_failed_attempt(
        &self,
        op: &PendingOperation,
        error: &str,
        now: DateTime<Utc>,
        max_attempts: i64,
        not_before: Option<DateTime<Utc>>,
    ) -> DbResult<Option<RetryDecision>> {
        let mut decision = queue::after_failure(op, now, max_attempts);
        if let Some(at) = not_before {
            decision.next_retry_at = decision.next_retry_at.max(to_second(at));
        }

        let result = sqlx::query(
            "UPDATE pending_operations SET status = ?3, retry_count = ?4, next_retry_at = ?5, \
             last_error = ?6, updated_at = ?7 WHERE id = ?1 AND revision = ?2",
        )
        .bind(&op.id)
        .bind(op.revision)
        .bind(decision.status)
        .bind(decision.retry_count)
        .bind(decision.next_retry_at)
        .bind(error)
        .bind(to_second(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(op_id = %op.id, "Operation changed while in flight; released");
            self.release(&op.id).await?;
            return Ok(None);
        }

        if decision.status == OperationStatus::Failed {
            warn!(
                op_id = %op.id,
                event_id = %op.event_id,
                attempts = decision.retry_count,
                error = %error,
                "Pending operation exhausted its retries"
            );
        }
        Ok(Some(decision))
    }

    /// Returns an in-flight operation to pending without counting a failure.
    pub async fn release(&self, id: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE pending_operations SET status = 'pending' \
             WHERE id = ?1 AND status = 'in_progress'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recovers operations left in flight by a crash.
    pub async fn reset_in_progress(&self) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE pending_operations SET status = 'pending' WHERE status = 'in_progress'",
        )
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            warn!(count = result.rows_affected(), "Recovered interrupted operations");
        }
        Ok(result.rows_affected())
    }

    /// Re-arms every failed operation for an immediate attempt.
    pub async fn retry_failed(&self, now: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE pending_operations SET status = 'pending', retry_count = 0, \
             next_retry_at = ?1, updated_at = ?1 WHERE status = 'failed'",
        )
        .bind(to_second(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Counts operations in a status.
    pub async fn count_by_status(&self, status: OperationStatus) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pending_operations WHERE status = ?1")
                .bind(status)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Operations that exhausted their retries.
    pub async fn failed(&self) -> DbResult<Vec<PendingOperation>> {
        let sql = format!(
            "SELECT {} FROM pending_operations WHERE status = 'failed' ORDER BY updated_at ASC",
            PENDING_COLUMNS
        );
        let ops = sqlx::query_as::<_, PendingOperation>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(ops)
    }

    /// Every queued operation.
    pub async fn list(&self) -> DbResult<Vec<PendingOperation>> {
        let sql = format!(
            "SELECT {} FROM pending_operations ORDER BY created_at ASC",
            PENDING_COLUMNS
        );
        let ops = sqlx::query_as::<_, PendingOperation>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(ops)
    }
}

// =============================================================================
// Connection-Level Queries
// =============================================================================

pub(crate) async fn get_by_event(
    conn: &mut SqliteConnection,
    event_id: &str,
) -> DbResult<Option<PendingOperation>> {
    let sql = format!(
        "SELECT {} FROM pending_operations WHERE event_id = ?1",
        PENDING_COLUMNS
    );
    let op = sqlx::query_as::<_, PendingOperation>(&sql)
        .bind(event_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(op)
}

/// Folds a planned operation into the queue.
///
/// ## Returns
/// The queued operation afterwards, or `None` if nothing is owed.
pub(crate) async fn enqueue(
    conn: &mut SqliteConnection,
    event_id: &str,
    planned: PlannedOperation,
    now: DateTime<Utc>,
) -> DbResult<Option<PendingOperation>> {
    let existing = get_by_event(conn, event_id).await?;
    let outcome = queue::coalesce(existing.as_ref(), planned);
    let now = to_second(now);

    match &outcome {
        CoalesceOutcome::Insert(planned) => {
            insert(conn, event_id, planned, now).await?;
        }
        CoalesceOutcome::Replace(planned) => {
            overwrite(conn, event_id, planned, now).await?;
        }
        CoalesceOutcome::Merge => {
            sqlx::query(
                "UPDATE pending_operations SET \
                     status = CASE status WHEN 'failed' THEN 'pending' ELSE status END, \
                     retry_count = CASE status WHEN 'failed' THEN 0 ELSE retry_count END, \
                     next_retry_at = CASE status WHEN 'failed' THEN ?2 ELSE next_retry_at END, \
                     revision = revision + 1, updated_at = ?2 \
                 WHERE event_id = ?1",
            )
            .bind(event_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        CoalesceOutcome::Cancel => {
            delete_for_event(conn, event_id).await?;
        }
        CoalesceOutcome::Unchanged => {}
    }

    debug!(event_id = %event_id, ?outcome, "Coalesced pending operation");
    get_by_event(conn, event_id).await
}

/// Replaces whatever is queued with `planned`, bypassing coalescing.
pub(crate) async fn supersede(
    conn: &mut SqliteConnection,
    event_id: &str,
    planned: PlannedOperation,
    now: DateTime<Utc>,
) -> DbResult<Option<PendingOperation>> {
    let now = to_second(now);
    if get_by_event(conn, event_id).await?.is_some() {
        overwrite(conn, event_id, &planned, now).await?;
    } else {
        insert(conn, event_id, &planned, now).await?;
    }
    get_by_event(conn, event_id).await
}

pub(crate) async fn delete_for_event(conn: &mut SqliteConnection, event_id: &str) -> DbResult<u64> {
    let result = sqlx::query("DELETE FROM pending_operations WHERE event_id = ?1")
        .bind(event_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Deletes the operation only if nothing was coalesced into it meanwhile.
pub(crate) async fn delete_if_revision(
    conn: &mut SqliteConnection,
    event_id: &str,
    revision: i64,
) -> DbResult<bool> {
    let result =
        sqlx::query("DELETE FROM pending_operations WHERE event_id = ?1 AND revision = ?2")
            .bind(event_id)
            .bind(revision)
            .execute(&mut *conn)
            .await?;
    Ok(result.rows_affected() == 1)
}

/// Puts an in-flight operation back to pending.
pub(crate) async fn release_for_event(conn: &mut SqliteConnection, event_id: &str) -> DbResult<()> {
    sqlx::query(
        "UPDATE pending_operations SET status = 'pending' \
         WHERE event_id = ?1 AND status = 'in_progress'",
    )
    .bind(event_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert(
    conn: &mut SqliteConnection,
    event_id: &str,
    planned: &PlannedOperation,
    now: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO pending_operations (
            id, event_id, kind, target_url, target_calendar_id,
            retry_count, next_retry_at, last_error, status, revision,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, NULL, 'pending', 1, ?6, ?6)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(event_id)
    .bind(planned.kind)
    .bind(&planned.target_url)
    .bind(&planned.target_calendar_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn overwrite(
    conn: &mut SqliteConnection,
    event_id: &str,
    planned: &PlannedOperation,
    now: DateTime<Utc>,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE pending_operations SET
            kind = ?2, target_url = ?3, target_calendar_id = ?4,
            status = 'pending', retry_count = 0, next_retry_at = ?5,
            last_error = NULL, revision = revision + 1, updated_at = ?5
        WHERE event_id = ?1
        "#,
    )
    .bind(event_id)
    .bind(planned.kind)
    .bind(&planned.target_url)
    .bind(&planned.target_calendar_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use caldera_core::OperationKind;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_coalesces_into_single_row() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        let op = enqueue(&mut conn, "evt-1", PlannedOperation::create(), t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.kind, OperationKind::Create);
        assert_eq!(op.revision, 1);

        let op = enqueue(&mut conn, "evt-1", PlannedOperation::update(), t0())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.kind, OperationKind::Create);
        assert_eq!(op.revision, 2);

        let op = enqueue(
            &mut conn,
            "evt-1",
            PlannedOperation::delete(None, None),
            t0(),
        )
        .await
        .unwrap();
        assert!(op.is_none());
        drop(conn);

        assert!(db.pending_operations().list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_if_revision_guards_lost_updates() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut conn = db.pool().acquire().await.unwrap();

        let op = enqueue(&mut conn, "evt-1", PlannedOperation::update(), t0())
            .await
            .unwrap()
            .unwrap();
        enqueue(&mut conn, "evt-1", PlannedOperation::update(), t0())
            .await
            .unwrap();

        assert!(!delete_if_revision(&mut conn, "evt-1", op.revision).await.unwrap());
        assert!(delete_if_revision(&mut conn, "evt-1", op.revision + 1).await.unwrap());
    }

    #[tokio::test]
    async fn test_failure_backoff_and_exhaustion() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.pending_operations();
        {
            let mut conn = db.pool().acquire().await.unwrap();
            enqueue(&mut conn, "evt-1", PlannedOperation::update(), t0())
                .await
                .unwrap();
        }

        let op = repo.eligible(t0(), 10, false).await.unwrap().remove(0);
        let claimed_at = t0() + Duration::minutes(1);
        assert!(repo.mark_in_progress(&op.id, claimed_at).await.unwrap());
        assert!(!repo.mark_in_progress(&op.id, claimed_at).await.unwrap());
        let claimed = repo.get_by_event("evt-1").await.unwrap().unwrap();
        assert_eq!(claimed.status, OperationStatus::InProgress);
        assert_eq!(claimed.updated_at, claimed_at);

        let decision = repo
            .mark_failed_attempt(&op, "HTTP 500", t0(), 2, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.retry_count, 1);
        assert_eq!(decision.status, OperationStatus::Pending);
        assert_eq!(decision.next_retry_at, t0() + Duration::seconds(30));

        assert!(repo.eligible(t0(), 10, false).await.unwrap().is_empty());
        assert_eq!(repo.eligible(t0(), 10, true).await.unwrap().len(), 1);

        let op = repo.get_by_event("evt-1").await.unwrap().unwrap();
        let decision = repo
            .mark_failed_attempt(&op, "HTTP 500", t0(), 2, None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.status, OperationStatus::Failed);
        assert_eq!(repo.failed().await.unwrap().len(), 1);

        assert_eq!(repo.retry_failed(t0()).await.unwrap(), 1);
        let op = repo.get_by_event("evt-1").await.unwrap().unwrap();
        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.retry_count, 0);
    }

    #[tokio::test]
    async fn test_retry_after_pushes_window_out() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.pending_operations();
        {
            let mut conn = db.pool().acquire().await.unwrap();
            enqueue(&mut conn, "evt-1", PlannedOperation::update(), t0())
                .await
                .unwrap();
        }
        let op = repo.get_by_event("evt-1").await.unwrap().unwrap();
        let decision = repo
            .mark_failed_attempt(&op, "HTTP 503", t0(), 10, Some(t0() + Duration::minutes(10)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decision.next_retry_at, t0() + Duration::minutes(10));
    }

    #[tokio::test]
    async fn test_failure_after_coalesce_releases() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.pending_operations();
        let mut conn = db.pool().acquire().await.unwrap();
        let op = enqueue(&mut conn, "evt-1", PlannedOperation::update(), t0())
            .await
            .unwrap()
            .unwrap();
        drop(conn);

        assert!(repo.mark_in_progress(&op.id, t0()).await.unwrap());
        {
            let mut conn = db.pool().acquire().await.unwrap();
            enqueue(&mut conn, "evt-1", PlannedOperation::update(), t0())
                .await
                .unwrap();
        }

        let decision = repo
            .mark_failed_attempt(&op, "timeout", t0(), 10, None)
            .await
            .unwrap();
        assert!(decision.is_none());
        let current = repo.get_by_event("evt-1").await.unwrap().unwrap();
        assert_eq!(current.status, OperationStatus::Pending);
        assert_eq!(current.retry_count, 0);
    }
}
