//! # Pending Queue Rules
//!
//! Pure rules for the pending-operation queue: coalescing, backoff and
//! eligibility. Persistence lives in `caldera-db`.
//!
//! ## Coalescing
//! At most one effective operation exists per event. A new operation for an
//! already-queued event folds into the existing one:
//!
//! ```text
//! ┌────────────┬──────────────────┬──────────────────────────────────────┐
//! │ existing   │ incoming         │ result                               │
//! ├────────────┼──────────────────┼──────────────────────────────────────┤
//! │ (none)     │ any              │ insert incoming                      │
//! │ Create     │ Update / Create  │ Create (merge)                       │
//! │ Create     │ Delete           │ nothing (cancel)                     │
//! │ Update     │ Update / Create  │ Update (merge, latest wins)          │
//! │ Update     │ Delete           │ Delete                               │
//! │ Delete     │ Create           │ Update (resource still on server)    │
//! │ Delete     │ Update / Delete  │ unchanged                            │
//! │ Move       │ Update / Create  │ Move (merge)                         │
//! │ Move       │ Delete           │ Delete of the move source            │
//! │ any        │ Move             │ Move (supersedes, never coalesces)   │
//! └────────────┴──────────────────┴──────────────────────────────────────┘
//! ```
//!
//! ## Backoff
//! `delay = 30s × 2^retry_count`, capped at 5 hours.

use chrono::{DateTime, Duration, Utc};

use crate::types::{OperationKind, OperationStatus, PendingOperation};

// =============================================================================
// Constants
// =============================================================================

/// Base retry delay.
pub const BASE_RETRY_DELAY_MS: i64 = 30_000;

/// Retry delay cap (5 hours).
pub const MAX_RETRY_DELAY_MS: i64 = 5 * 60 * 60 * 1000;

/// Attempts before an operation is marked Failed.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: i64 = 10;

// =============================================================================
// Backoff
// =============================================================================

/// Delay before retry number `retry_count + 1`.
///
/// Negative counts are treated as zero.
///
/// ## Example
/// ```rust
/// use caldera_core::queue::calculate_retry_delay;
/// use chrono::Duration;
///
/// assert_eq!(calculate_retry_delay(0), Duration::seconds(30));
/// assert_eq!(calculate_retry_delay(3), Duration::seconds(240));
/// assert_eq!(calculate_retry_delay(-4), calculate_retry_delay(0));
/// assert_eq!(calculate_retry_delay(50), Duration::hours(5));
/// ```
pub fn calculate_retry_delay(retry_count: i64) -> Duration {
    let k = retry_count.max(0);
    // 30s × 2^10 already exceeds the cap
    if k >= 20 {
        return Duration::milliseconds(MAX_RETRY_DELAY_MS);
    }
    let delay = BASE_RETRY_DELAY_MS.saturating_mul(1_i64 << k);
    Duration::milliseconds(delay.min(MAX_RETRY_DELAY_MS))
}

/// Next eligible time after a failed attempt.
pub fn next_retry_at(now: DateTime<Utc>, retry_count: i64) -> DateTime<Utc> {
    now + calculate_retry_delay(retry_count)
}

/// Returns true if the operation may run now.
pub fn is_eligible(op: &PendingOperation, now: DateTime<Utc>) -> bool {
    op.status == OperationStatus::Pending && now >= op.next_retry_at
}

/// Outcome of recording one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry_count: i64,
    pub status: OperationStatus,
    pub next_retry_at: DateTime<Utc>,
}

/// Computes the state after a failed attempt.
///
/// The delay uses the count before the increment; reaching `max_attempts`
/// marks the operation Failed.
pub fn after_failure(op: &PendingOperation, now: DateTime<Utc>, max_attempts: i64) -> RetryDecision {
    let retry_count = op.retry_count.max(0) + 1;
    let status = if retry_count >= max_attempts {
        OperationStatus::Failed
    } else {
        OperationStatus::Pending
    };
    RetryDecision {
        retry_count,
        status,
        next_retry_at: next_retry_at(now, op.retry_count),
    }
}

// =============================================================================
// Coalescing
// =============================================================================

/// Operation a Writer call wants queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOperation {
    pub kind: OperationKind,
    pub target_url: Option<String>,
    pub target_calendar_id: Option<String>,
}

impl PlannedOperation {
    pub fn create() -> Self {
        Self::of(OperationKind::Create)
    }

    pub fn update() -> Self {
        Self::of(OperationKind::Update)
    }

    pub fn delete(target_url: Option<String>, target_calendar_id: Option<String>) -> Self {
        Self {
            kind: OperationKind::Delete,
            target_url,
            target_calendar_id,
        }
    }

    /// Move away from `source_url` in `source_calendar_id`.
    pub fn move_from(source_url: Option<String>, source_calendar_id: Option<String>) -> Self {
        Self {
            kind: OperationKind::Move,
            target_url: source_url,
            target_calendar_id: source_calendar_id,
        }
    }

    fn of(kind: OperationKind) -> Self {
        Self {
            kind,
            target_url: None,
            target_calendar_id: None,
        }
    }
}

/// Result of folding a planned operation into the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoalesceOutcome {
    /// No operation was queued; insert this one.
    Insert(PlannedOperation),
    /// Overwrite the queued operation with this one.
    Replace(PlannedOperation),
    /// Keep the queued kind, refresh it (status, retries, revision).
    Merge,
    /// Remove the queued operation; nothing is owed.
    Cancel,
    /// Leave the queued operation untouched.
    Unchanged,
}

/// Folds `incoming` into the operation already queued for the event.
pub fn coalesce(existing: Option<&PendingOperation>, incoming: PlannedOperation) -> CoalesceOutcome {
    use OperationKind::*;

    let existing = match existing {
        Some(op) => op,
        None => return CoalesceOutcome::Insert(incoming),
    };

    match (existing.kind, incoming.kind) {
        (_, Move) => CoalesceOutcome::Replace(incoming),

        (Create, Update) | (Create, Create) => CoalesceOutcome::Merge,
        (Create, Delete) => CoalesceOutcome::Cancel,

        (Update, Update) | (Update, Create) => CoalesceOutcome::Merge,
        (Update, Delete) => CoalesceOutcome::Replace(incoming),

        (Delete, Create) => CoalesceOutcome::Replace(PlannedOperation::update()),
        (Delete, Update) | (Delete, Delete) => CoalesceOutcome::Unchanged,

        (Move, Update) | (Move, Create) => CoalesceOutcome::Merge,
        (Move, Delete) => CoalesceOutcome::Replace(PlannedOperation::delete(
            existing.target_url.clone().or(incoming.target_url),
            existing
                .target_calendar_id
                .clone()
                .or(incoming.target_calendar_id),
        )),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn op(kind: OperationKind) -> PendingOperation {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        PendingOperation {
            id: "op-1".into(),
            event_id: "evt-1".into(),
            kind,
            target_url: None,
            target_calendar_id: None,
            retry_count: 0,
            next_retry_at: now,
            last_error: None,
            status: OperationStatus::Pending,
            revision: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        assert_eq!(calculate_retry_delay(0), Duration::milliseconds(30_000));
        assert_eq!(calculate_retry_delay(1), Duration::milliseconds(60_000));
        assert_eq!(calculate_retry_delay(9), Duration::milliseconds(15_360_000));
        assert_eq!(calculate_retry_delay(10), Duration::hours(5));
        assert_eq!(calculate_retry_delay(i64::MAX), Duration::hours(5));
        assert_eq!(calculate_retry_delay(-1), calculate_retry_delay(0));
    }

    #[test]
    fn test_eligibility() {
        let mut pending = op(OperationKind::Update);
        let at = pending.next_retry_at;
        assert!(is_eligible(&pending, at));
        assert!(!is_eligible(&pending, at - Duration::seconds(1)));

        pending.status = OperationStatus::InProgress;
        assert!(!is_eligible(&pending, at));
        pending.status = OperationStatus::Failed;
        assert!(!is_eligible(&pending, at + Duration::days(1)));
    }

    #[test]
    fn test_after_failure_marks_failed_at_max() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut pending = op(OperationKind::Create);

        let decision = after_failure(&pending, now, 3);
        assert_eq!(decision.retry_count, 1);
        assert_eq!(decision.status, OperationStatus::Pending);
        assert_eq!(decision.next_retry_at, now + Duration::seconds(30));

        pending.retry_count = 2;
        let decision = after_failure(&pending, now, 3);
        assert_eq!(decision.retry_count, 3);
        assert_eq!(decision.status, OperationStatus::Failed);
    }

    #[test]
    fn test_coalesce_table() {
        use OperationKind::*;

        assert_eq!(
            coalesce(None, PlannedOperation::create()),
            CoalesceOutcome::Insert(PlannedOperation::create())
        );
        assert_eq!(coalesce(Some(&op(Create)), PlannedOperation::update()), CoalesceOutcome::Merge);
        assert_eq!(
            coalesce(Some(&op(Create)), PlannedOperation::delete(None, None)),
            CoalesceOutcome::Cancel
        );
        assert_eq!(coalesce(Some(&op(Update)), PlannedOperation::update()), CoalesceOutcome::Merge);
        assert_eq!(
            coalesce(Some(&op(Update)), PlannedOperation::delete(Some("/a.ics".into()), None)),
            CoalesceOutcome::Replace(PlannedOperation::delete(Some("/a.ics".into()), None))
        );
        assert_eq!(
            coalesce(Some(&op(Delete)), PlannedOperation::create()),
            CoalesceOutcome::Replace(PlannedOperation::update())
        );
        assert_eq!(
            coalesce(Some(&op(Delete)), PlannedOperation::update()),
            CoalesceOutcome::Unchanged
        );
    }

    #[test]
    fn test_move_supersedes_and_delete_targets_source() {
        use OperationKind::*;

        let planned = PlannedOperation::move_from(Some("/old/a.ics".into()), Some("cal-old".into()));
        assert_eq!(
            coalesce(Some(&op(Update)), planned.clone()),
            CoalesceOutcome::Replace(planned)
        );

        let mut queued_move = op(Move);
        queued_move.target_url = Some("/old/a.ics".into());
        queued_move.target_calendar_id = Some("cal-old".into());
        assert_eq!(coalesce(Some(&queued_move), PlannedOperation::update()), CoalesceOutcome::Merge);
        assert_eq!(
            coalesce(Some(&queued_move), PlannedOperation::delete(None, Some("cal-new".into()))),
            CoalesceOutcome::Replace(PlannedOperation::delete(
                Some("/old/a.ics".into()),
                Some("cal-old".into())
            ))
        );
    }
}
