//! # Writer
//!
//! The only code path that mutates events.
//!
//! ## Transaction Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    One Writer call                                      │
//! │                                                                         │
//! │  per-event lock (keyed by master id)                                   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                   SINGLE TRANSACTION                            │   │
//! │  │                                                                 │   │
//! │  │  1. events            INSERT / UPDATE / DELETE                  │   │
//! │  │  2. occurrences       regenerate or patch the affected rows     │   │
//! │  │  3. pending_operations  enqueue (coalesced) when remote         │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  COMMIT ← all three change or none does                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sync State Rules
//! - Local calendar: events are always `Synced`, nothing is queued.
//! - Remote calendar: a change demotes `Synced` to `PendingUpdate`;
//!   `PendingCreate` stays `PendingCreate` until the first upload.
//! - Exception edits are queued against the master: the server stores
//!   master and overrides as one resource.
//!
//! The sync engine uses the support operations at the bottom of this file
//! (`apply_remote`, `mark_synced`, ...) and goes through the same locks.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use caldera_core::queue::PlannedOperation;
use caldera_core::recurrence;
use caldera_core::validation::{validate_new_event, validate_patch, validate_span};
use caldera_core::{
    generate_uid, normalize_instants, to_second, Calendar, Clock, CoreError, Event, EventPatch,
    ExpansionWindow, NewEvent, OccurrenceEdit, OperationKind, RemoteComponent,
    RemoteEvent, SyncState, DEFAULT_HORIZON_DAYS,
};

use crate::error::{DbError, DbResult};
use crate::repository::{calendar, event, occurrence, pending};
use crate::schedule;

// =============================================================================
// Configuration
// =============================================================================

/// Writer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Days past `max(now, start)` to materialize.
    pub horizon_days: i64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            horizon_days: DEFAULT_HORIZON_DAYS,
        }
    }
}

// =============================================================================
// Per-Event Locks
// =============================================================================

/// Async mutex per master event id.
///
/// Entries nobody holds or waits on are pruned on the next acquire.
#[derive(Debug, Default)]
struct EventLocks {
    inner: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl EventLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|_, l| Arc::strong_count(l) > 1);
            map.entry(key.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

// =============================================================================
// Outcomes
// =============================================================================

/// Result of applying a server copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Local state now mirrors the server.
    Applied { event_id: String, created: bool },
    /// The server copy has the ETag we already hold.
    Unchanged(String),
    /// The local event has unpushed changes; nothing was written.
    Conflict(String),
    /// The resource holds no master component.
    Ignored,
}

/// Result of applying a server-side deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed(String),
    /// The local event has unpushed changes; nothing was written.
    Conflict(String),
    NotFound,
}

// =============================================================================
// Writer
// =============================================================================

/// Mutation engine.
///
/// Clones share the per-event locks.
///
/// ## Example
/// ```rust,ignore
/// let writer = db.writer(WriterConfig::default(), Arc::new(SystemClock));
/// let event = writer.create(NewEvent::new(&cal.id, "Standup", start, end)).await?;
/// let event = writer.update(&event.id, EventPatch::default().summary("Daily")).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Writer {
    pool: SqlitePool,
    config: WriterConfig,
    clock: Arc<dyn Clock>,
    locks: Arc<EventLocks>,
}

impl Writer {
    /// Creates a Writer over a pool.
    pub fn new(pool: SqlitePool, config: WriterConfig, clock: Arc<dyn Clock>) -> Self {
        Writer {
            pool,
            config,
            clock,
            locks: Arc::new(EventLocks::default()),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        to_second(self.clock.now())
    }

    /// Lock key of an event: its master's id.
    async fn lock_key(&self, event_id: &str) -> DbResult<String> {
        let mut conn = self.pool.acquire().await?;
        let found = event::fetch(&mut conn, event_id)
            .await?
            .ok_or_else(|| DbError::not_found("Event", event_id))?;
        Ok(found.original_event_id.unwrap_or(found.id))
    }

    async fn lock(&self, event_id: &str) -> DbResult<OwnedMutexGuard<()>> {
        let key = self.lock_key(event_id).await?;
        Ok(self.locks.acquire(&key).await)
    }

    // =========================================================================
    // Event Operations
    // =========================================================================

    /// Creates an event and its occurrences.
    ///
    /// ## Errors
    /// - `NotFound` if the calendar does not exist
    /// - `UniqueViolation` if the given UID already names a master
    /// - `Validation` / `InvalidState` for bad input or an unparseable RRULE
    pub async fn create(&self, draft: NewEvent) -> DbResult<Event> {
        validate_new_event(&draft)?;
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let cal = require_calendar(&mut tx, &draft.calendar_id).await?;

        let uid = match draft.uid {
            Some(uid) => {
                if event::fetch_master_by_uid(&mut tx, &uid).await?.is_some() {
                    return Err(DbError::duplicate("uid", uid));
                }
                uid
            }
            None => generate_uid(),
        };

        let created = Event {
            id: Uuid::new_v4().to_string(),
            uid,
            calendar_id: cal.id.clone(),
            summary: draft.summary,
            description: draft.description,
            location: draft.location,
            start: to_second(draft.start),
            end: to_second(draft.end),
            all_day: draft.all_day,
            timezone: draft.timezone,
            rrule: draft.rrule,
            exdates: normalize_instants(&draft.exdates),
            rdates: normalize_instants(&draft.rdates),
            sequence: 0,
            sync_state: if cal.is_remote() {
                SyncState::PendingCreate
            } else {
                SyncState::Synced
            },
            remote_url: None,
            etag: None,
            original_event_id: None,
            original_instance_time: None,
            has_conflict: false,
            created_at: now,
            updated_at: now,
        };
        check_expandable(&created)?;

        event::insert(&mut tx, &created).await?;
        schedule::regenerate(&mut tx, &created, now, self.config.horizon_days).await?;
        if cal.is_remote() {
            pending::enqueue(&mut tx, &created.id, PlannedOperation::create(), now).await?;
        }

        tx.commit().await?;
        info!(event_id = %created.id, calendar_id = %cal.id, "Created event");
        Ok(created)
    }

    /// Applies a partial update.
    ///
    /// The sequence is bumped only when timing or recurrence changed;
    /// occurrences are regenerated only then.
    pub async fn update(&self, event_id: &str, patch: EventPatch) -> DbResult<Event> {
        validate_patch(&patch)?;
        let _guard = self.lock(event_id).await?;
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let mut updated = require_live_event(&mut tx, event_id).await?;
        if updated.is_exception() && patch.sets_rrule() {
            return Err(DbError::invalid_state(
                "an exception event cannot carry a recurrence rule",
            ));
        }
        let cal = require_calendar(&mut tx, &updated.calendar_id).await?;

        let changed = patch.apply(&mut updated);
        validate_span(updated.start, updated.end)?;
        if changed {
            check_expandable(&updated)?;
            updated.sequence += 1;
        }
        updated.updated_at = now;
        if cal.is_remote() && updated.sync_state == SyncState::Synced {
            updated.sync_state = SyncState::PendingUpdate;
        }
        event::update(&mut tx, &updated).await?;

        if let Some(master_id) = updated.original_event_id.clone() {
            let mut master = require_event(&mut tx, &master_id).await?;
            // Unlinked exceptions wait for the next regeneration.
            let row = match updated.original_instance_time {
                Some(at) => occurrence::fetch_at(&mut tx, &master.id, at).await?,
                None => None,
            };
            if let Some(row) = row {
                schedule::link_exception(&mut tx, &master, &updated, row.cancelled).await?;
            }
            record_master_change(&mut tx, &mut master, &cal, now).await?;
        } else {
            let mut removed = 0;
            if !updated.is_recurring() {
                removed = event::delete_exceptions(&mut tx, &updated.id).await?;
            }
            if changed || removed > 0 {
                schedule::regenerate(&mut tx, &updated, now, self.config.horizon_days).await?;
            }
            if cal.is_remote() {
                pending::enqueue(&mut tx, &updated.id, PlannedOperation::update(), now).await?;
            }
        }

        tx.commit().await?;
        debug!(event_id = %updated.id, changed, sequence = updated.sequence, "Updated event");
        Ok(updated)
    }

    /// Deletes an event.
    ///
    /// ## Returns
    /// - `Some(event)` in `PendingDelete` while the server copy still exists
    /// - `None` when the row is gone (never uploaded, local calendar, or an
    ///   exception, which cancels its single occurrence on the master)
    pub async fn delete(&self, event_id: &str) -> DbResult<Option<Event>> {
        let _guard = self.lock(event_id).await?;
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let target = require_live_event(&mut tx, event_id).await?;

        let result = match (target.original_event_id.clone(), target.original_instance_time) {
            (Some(master_id), Some(instance)) => {
                let master = require_live_event(&mut tx, &master_id).await?;
                cancel_instance(&mut tx, master, instance, now).await?;
                None
            }
            _ => delete_in_tx(&mut tx, target, now).await?,
        };

        tx.commit().await?;
        info!(event_id = %event_id, soft = result.is_some(), "Deleted event");
        Ok(result)
    }

    /// Overrides one occurrence of a recurring master.
    ///
    /// Calling it again for the same instance updates the same exception.
    pub async fn edit_single_occurrence(
        &self,
        master_id: &str,
        instance: DateTime<Utc>,
        edit: OccurrenceEdit,
    ) -> DbResult<Event> {
        let _guard = self.lock(master_id).await?;
        let instance = to_second(instance);
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let mut master = require_recurring(&mut tx, master_id).await?;
        let cal = require_calendar(&mut tx, &master.calendar_id).await?;

        let row = occurrence::fetch_at(&mut tx, &master.id, instance).await?;
        let mut existing = match row.as_ref().and_then(|r| r.exception_event_id.clone()) {
            Some(id) => event::fetch(&mut tx, &id).await?,
            None => None,
        };
        if existing.is_none() {
            existing = event::fetch_exception_at(&mut tx, &master.id, instance).await?;
        }
        if existing.is_none()
            && row.is_none()
            && !recurrence::contains_instance(&master, instance).map_err(CoreError::from)?
        {
            return Err(DbError::invalid_state(format!(
                "{} is not an occurrence of event {}",
                instance, master.id
            )));
        }

        let state = if cal.is_remote() {
            SyncState::PendingUpdate
        } else {
            SyncState::Synced
        };
        let is_new = existing.is_none();
        let mut exception = existing.unwrap_or_else(|| Event {
            id: Uuid::new_v4().to_string(),
            uid: master.uid.clone(),
            calendar_id: master.calendar_id.clone(),
            summary: master.summary.clone(),
            description: master.description.clone(),
            location: master.location.clone(),
            start: instance,
            end: instance + master.duration(),
            all_day: master.all_day,
            timezone: master.timezone.clone(),
            rrule: None,
            exdates: Vec::new(),
            rdates: Vec::new(),
            sequence: master.sequence,
            sync_state: state,
            remote_url: None,
            etag: None,
            original_event_id: Some(master.id.clone()),
            original_instance_time: Some(instance),
            has_conflict: false,
            created_at: now,
            updated_at: now,
        });

        if let Some(summary) = edit.summary {
            exception.summary = summary;
        }
        if let Some(description) = edit.description {
            exception.description = non_empty(description);
        }
        if let Some(location) = edit.location {
            exception.location = non_empty(location);
        }
        if let Some(start) = edit.start {
            exception.start = to_second(start);
        }
        if let Some(end) = edit.end {
            exception.end = to_second(end);
        }
        validate_span(exception.start, exception.end)?;
        exception.sync_state = state;
        exception.updated_at = now;

        if is_new {
            event::insert(&mut tx, &exception).await?;
        } else {
            event::update(&mut tx, &exception).await?;
        }

        let produced = match row {
            Some(_) => true,
            None => recurrence::contains_instance(&master, instance).map_err(CoreError::from)?,
        };
        if produced {
            let cancelled = row.is_some_and(|r| r.cancelled);
            schedule::link_exception(&mut tx, &master, &exception, cancelled).await?;
        }
        occurrence::delete_owned_by_exceptions(&mut tx, &master.id).await?;
        record_master_change(&mut tx, &mut master, &cal, now).await?;

        tx.commit().await?;
        debug!(
            master_id = %master.id,
            exception_id = %exception.id,
            instance = %instance,
            created = is_new,
            "Edited single occurrence"
        );
        Ok(exception)
    }

    /// Cancels one occurrence of a recurring master via EXDATE.
    ///
    /// ## Returns
    /// The updated master.
    pub async fn delete_single_occurrence(
        &self,
        master_id: &str,
        instance: DateTime<Utc>,
    ) -> DbResult<Event> {
        let _guard = self.lock(master_id).await?;
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let master = require_recurring(&mut tx, master_id).await?;
        let master = cancel_instance(&mut tx, master, to_second(instance), now).await?;

        tx.commit().await?;
        debug!(master_id = %master.id, instance = %instance, "Deleted single occurrence");
        Ok(master)
    }

    /// Ends a series before `split` and starts a new series from there.
    ///
    /// ## Returns
    /// The new tail event (fresh id and UID).
    ///
    /// ## Errors
    /// `InvalidState` when `split` is at or before the first occurrence or
    /// no occurrence follows it.
    pub async fn split_series(&self, master_id: &str, split: DateTime<Utc>) -> DbResult<Event> {
        let _guard = self.lock(master_id).await?;
        let split = to_second(split);
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let mut master = require_recurring(&mut tx, master_id).await?;
        let cal = require_calendar(&mut tx, &master.calendar_id).await?;

        let first = recurrence::first_instance(&master).map_err(CoreError::from)?;
        if first.map_or(true, |f| split <= f) {
            return Err(DbError::invalid_state(
                "cannot split a series at or before its first occurrence",
            ));
        }
        let tail_start = recurrence::next_instance(&master, split)
            .map_err(CoreError::from)?
            .ok_or_else(|| DbError::invalid_state("no occurrence after the split point"))?;
        let remaining = recurrence::remaining_count(&master, tail_start).map_err(CoreError::from)?;
        if remaining == Some(0) {
            return Err(DbError::invalid_state("no occurrence after the split point"));
        }

        let original_rule = master.rrule.clone().unwrap_or_default();
        let tail_rule = recurrence::with_count(&original_rule, remaining).map_err(CoreError::from)?;

        let tail = Event {
            id: Uuid::new_v4().to_string(),
            uid: generate_uid(),
            calendar_id: master.calendar_id.clone(),
            summary: master.summary.clone(),
            description: master.description.clone(),
            location: master.location.clone(),
            start: tail_start,
            end: tail_start + master.duration(),
            all_day: master.all_day,
            timezone: master.timezone.clone(),
            rrule: Some(tail_rule),
            exdates: master.exdates.iter().copied().filter(|d| *d >= split).collect(),
            rdates: master.rdates.iter().copied().filter(|d| *d >= split).collect(),
            sequence: 0,
            sync_state: if cal.is_remote() {
                SyncState::PendingCreate
            } else {
                SyncState::Synced
            },
            remote_url: None,
            etag: None,
            original_event_id: None,
            original_instance_time: None,
            has_conflict: false,
            created_at: now,
            updated_at: now,
        };

        truncate_series(&mut tx, &mut master, &cal, split, now, self.config.horizon_days).await?;

        event::insert(&mut tx, &tail).await?;
        schedule::regenerate(&mut tx, &tail, now, self.config.horizon_days).await?;
        if cal.is_remote() {
            pending::enqueue(&mut tx, &tail.id, PlannedOperation::create(), now).await?;
        }

        tx.commit().await?;
        info!(master_id = %master.id, tail_id = %tail.id, split = %split, "Split series");
        Ok(tail)
    }

    /// Ends a series before `from`.
    ///
    /// Truncating at or before the first occurrence deletes the whole event
    /// (same result as [`Writer::delete`]).
    pub async fn delete_this_and_future(
        &self,
        master_id: &str,
        from: DateTime<Utc>,
    ) -> DbResult<Option<Event>> {
        let _guard = self.lock(master_id).await?;
        let from = to_second(from);
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let mut master = require_recurring(&mut tx, master_id).await?;

        let first = recurrence::first_instance(&master).map_err(CoreError::from)?;
        if first.map_or(true, |f| from <= f) {
            let result = delete_in_tx(&mut tx, master, now).await?;
            tx.commit().await?;
            info!(event_id = %master_id, "Deleted whole series");
            return Ok(result);
        }

        let cal = require_calendar(&mut tx, &master.calendar_id).await?;
        truncate_series(&mut tx, &mut master, &cal, from, now, self.config.horizon_days).await?;

        tx.commit().await?;
        info!(event_id = %master.id, from = %from, "Deleted this and future occurrences");
        Ok(Some(master))
    }

    /// Moves an event (with its exceptions) to another calendar.
    ///
    /// ## Queue Transitions
    /// ```text
    /// local  → local    nothing queued
    /// local  → remote   Create
    /// remote → local    Delete of the old resource (old URL, old calendar)
    /// remote → remote   Move (old URL, old calendar), or Create if never uploaded
    /// ```
    /// Whatever was queued before is superseded.
    pub async fn move_event_to_calendar(
        &self,
        event_id: &str,
        target_calendar_id: &str,
    ) -> DbResult<Event> {
        let _guard = self.lock(event_id).await?;
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let mut moved = require_live_event(&mut tx, event_id).await?;
        if moved.is_exception() {
            return Err(DbError::invalid_state(
                "an exception moves together with its master",
            ));
        }
        if moved.calendar_id == target_calendar_id {
            return Ok(moved);
        }

        let source = require_calendar(&mut tx, &moved.calendar_id).await?;
        let target = require_calendar(&mut tx, target_calendar_id).await?;
        let existing = pending::get_by_event(&mut tx, &moved.id).await?;

        let old_url = moved.remote_url.take();
        let old_calendar = moved.calendar_id.clone();
        moved.etag = None;
        moved.calendar_id = target.id.clone();
        moved.has_conflict = false;
        moved.updated_at = now;

        match (source.is_remote(), target.is_remote()) {
            (false, false) => {
                moved.sync_state = SyncState::Synced;
            }
            (false, true) => {
                let parked = existing.filter(|op| op.kind == OperationKind::Delete);
                let planned = match parked {
                    Some(op) if op.target_calendar_id.as_deref() == Some(target.id.as_str()) => {
                        moved.remote_url = op.target_url;
                        moved.sync_state = SyncState::PendingUpdate;
                        PlannedOperation::update()
                    }
                    Some(op) => {
                        moved.sync_state = SyncState::PendingUpdate;
                        PlannedOperation::move_from(op.target_url, op.target_calendar_id)
                    }
                    None => {
                        moved.sync_state = SyncState::PendingCreate;
                        PlannedOperation::create()
                    }
                };
                pending::supersede(&mut tx, &moved.id, planned, now).await?;
            }
            (true, false) => {
                moved.sync_state = SyncState::Synced;
                let never_uploaded = old_url.is_none()
                    && existing
                        .as_ref()
                        .map_or(true, |op| op.kind == OperationKind::Create);
                if never_uploaded {
                    pending::delete_for_event(&mut tx, &moved.id).await?;
                } else {
                    let planned = match existing {
                        Some(op) if op.kind == OperationKind::Move => {
                            PlannedOperation::delete(op.target_url, op.target_calendar_id)
                        }
                        _ => PlannedOperation::delete(old_url.clone(), Some(old_calendar.clone())),
                    };
                    pending::supersede(&mut tx, &moved.id, planned, now).await?;
                }
            }
            (true, true) => {
                let server_copy = match existing {
                    Some(op) if op.kind == OperationKind::Move => {
                        Some((op.target_url, op.target_calendar_id))
                    }
                    _ => old_url
                        .clone()
                        .map(|url| (Some(url), Some(old_calendar.clone()))),
                };
                let planned = match server_copy {
                    None => {
                        moved.sync_state = SyncState::PendingCreate;
                        PlannedOperation::create()
                    }
                    Some((url, cal)) if cal.as_deref() == Some(target.id.as_str()) => {
                        moved.remote_url = url;
                        moved.sync_state = SyncState::PendingUpdate;
                        PlannedOperation::update()
                    }
                    Some((url, cal)) => {
                        moved.sync_state = SyncState::PendingUpdate;
                        PlannedOperation::move_from(url, cal)
                    }
                };
                pending::supersede(&mut tx, &moved.id, planned, now).await?;
            }
        }

        event::update(&mut tx, &moved).await?;
        let exception_state = if target.is_remote() {
            SyncState::PendingUpdate
        } else {
            SyncState::Synced
        };
        event::reassign_exceptions(&mut tx, &moved.id, &target.id, exception_state).await?;
        occurrence::set_calendar(&mut tx, &moved.id, &target.id).await?;

        tx.commit().await?;
        info!(
            event_id = %moved.id,
            from = %old_calendar,
            to = %target.id,
            "Moved event to calendar"
        );
        Ok(moved)
    }

    // =========================================================================
    // Sync Support Operations
    // =========================================================================

    /// Mirrors a server copy into the local store.
    ///
    /// ## Arguments
    /// * `overwrite_local` - Replace local changes and drop the queued
    ///   operation (server-wins resolution). Without it, a local event with
    ///   unpushed changes is reported as [`ApplyOutcome::Conflict`].
    pub async fn apply_remote(
        &self,
        calendar_id: &str,
        remote: RemoteEvent,
        overwrite_local: bool,
    ) -> DbResult<ApplyOutcome> {
        let RemoteEvent {
            uid,
            href,
            etag,
            master,
            overrides,
        } = remote;
        let component = match master {
            Some(component) => component,
            None => {
                warn!(href = %href, "Server resource has no master component; ignored");
                return Ok(ApplyOutcome::Ignored);
            }
        };

        let key = {
            let mut conn = self.pool.acquire().await?;
            find_remote_target(&mut conn, &href, &uid)
                .await?
                .map(|e| e.id)
                .unwrap_or_else(|| format!("uid:{}", uid))
        };
        let _guard = self.locks.acquire(&key).await;
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let cal = require_calendar(&mut tx, calendar_id).await?;
        let existing = find_remote_target(&mut tx, &href, &uid).await?;

        if let Some(ref local) = existing {
            if !overwrite_local {
                if local.etag.is_some() && local.etag == etag && local.remote_url.as_deref() == Some(href.as_str()) {
                    return Ok(ApplyOutcome::Unchanged(local.id.clone()));
                }
                let queued = pending::get_by_event(&mut tx, &local.id).await?;
                if local.sync_state.has_local_changes() || queued.is_some() {
                    debug!(event_id = %local.id, href = %href, "Server change collides with local changes");
                    return Ok(ApplyOutcome::Conflict(local.id.clone()));
                }
            }
        }

        let created = existing.is_none();
        let (id, created_at) = match existing {
            Some(ref local) => (local.id.clone(), local.created_at),
            None => (Uuid::new_v4().to_string(), now),
        };

        let mut mirrored = event_from_component(id, uid, &cal.id, component, now);
        mirrored.remote_url = Some(href.clone());
        mirrored.etag = etag;
        mirrored.created_at = created_at;

        if created {
            event::insert(&mut tx, &mirrored).await?;
        } else {
            event::update(&mut tx, &mirrored).await?;
        }

        event::delete_exceptions(&mut tx, &mirrored.id).await?;
        if mirrored.is_recurring() {
            let mut seen = HashSet::new();
            for component in overrides {
                let instance = match component.recurrence_id {
                    Some(at) => to_second(at),
                    None => continue,
                };
                if !seen.insert(instance) {
                    continue;
                }
                let mut exception = event_from_component(
                    Uuid::new_v4().to_string(),
                    mirrored.uid.clone(),
                    &cal.id,
                    component,
                    now,
                );
                exception.rrule = None;
                exception.exdates.clear();
                exception.rdates.clear();
                exception.original_event_id = Some(mirrored.id.clone());
                exception.original_instance_time = Some(instance);
                event::insert(&mut tx, &exception).await?;
            }
        } else if !overrides.is_empty() {
            debug!(href = %href, "Overrides on a non-recurring resource ignored");
        }

        schedule::regenerate(&mut tx, &mirrored, now, self.config.horizon_days).await?;
        if overwrite_local {
            pending::delete_for_event(&mut tx, &mirrored.id).await?;
        }

        tx.commit().await?;
        debug!(event_id = %mirrored.id, href = %href, created, "Applied server copy");
        Ok(ApplyOutcome::Applied {
            event_id: mirrored.id,
            created,
        })
    }

    /// Records a successful upload.
    ///
    /// ## Returns
    /// `true` if the queued operation was cleared. `false` means a newer
    /// local change was coalesced while the upload was in flight; the
    /// operation stays queued (a Create becomes an Update).
    pub async fn mark_synced(
        &self,
        event_id: &str,
        remote_url: &str,
        etag: Option<String>,
        revision: i64,
    ) -> DbResult<bool> {
        let _guard = self.locks.acquire(event_id).await;
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let mut synced = match event::fetch(&mut tx, event_id).await? {
            Some(found) => found,
            None => {
                // Deleted locally while its first upload was in flight.
                pending::supersede(
                    &mut tx,
                    event_id,
                    PlannedOperation::delete(Some(remote_url.to_string()), None),
                    now,
                )
                .await?;
                tx.commit().await?;
                warn!(event_id = %event_id, url = %remote_url, "Uploaded event was deleted meanwhile");
                return Ok(false);
            }
        };

        synced.remote_url = Some(remote_url.to_string());
        synced.etag = etag;
        synced.has_conflict = false;

        let cleared = pending::delete_if_revision(&mut tx, &synced.id, revision).await?;
        if cleared {
            synced.sync_state = SyncState::Synced;
            event::set_exceptions_state(&mut tx, &synced.id, SyncState::Synced).await?;
        } else {
            if synced.sync_state != SyncState::PendingDelete {
                synced.sync_state = SyncState::PendingUpdate;
            }
            match pending::get_by_event(&mut tx, &synced.id).await? {
                Some(op) if op.kind == OperationKind::Create => {
                    pending::supersede(&mut tx, &synced.id, PlannedOperation::update(), now).await?;
                }
                Some(_) => pending::release_for_event(&mut tx, &synced.id).await?,
                None => {}
            }
        }
        event::update(&mut tx, &synced).await?;

        tx.commit().await?;
        debug!(event_id = %synced.id, cleared, "Marked event synced");
        Ok(cleared)
    }

    /// Completes a remote deletion.
    ///
    /// A `PendingDelete` event is removed for good; an event that only owed
    /// the deletion of an old resource (moved away) is kept.
    pub async fn finalize_remote_delete(&self, event_id: &str, revision: i64) -> DbResult<bool> {
        let _guard = self.locks.acquire(event_id).await;

        let mut tx = self.pool.begin().await?;
        let cleared = pending::delete_if_revision(&mut tx, event_id, revision).await?;
        if cleared {
            if let Some(found) = event::fetch(&mut tx, event_id).await? {
                if found.is_deleted() {
                    event::delete(&mut tx, &found.id).await?;
                }
            }
        } else {
            pending::release_for_event(&mut tx, event_id).await?;
        }

        tx.commit().await?;
        debug!(event_id = %event_id, cleared, "Finalized remote delete");
        Ok(cleared)
    }

    /// Applies a deletion made on the server.
    pub async fn remove_remote(&self, calendar_id: &str, remote_url: &str) -> DbResult<RemoveOutcome> {
        let key = {
            let mut conn = self.pool.acquire().await?;
            match event::fetch_by_remote_url(&mut conn, remote_url).await? {
                Some(found) => found.id,
                None => return Ok(RemoveOutcome::NotFound),
            }
        };
        let _guard = self.locks.acquire(&key).await;

        let mut tx = self.pool.begin().await?;
        let local = match event::fetch_by_remote_url(&mut tx, remote_url).await? {
            Some(found) if found.calendar_id == calendar_id => found,
            _ => return Ok(RemoveOutcome::NotFound),
        };
        let queued = pending::get_by_event(&mut tx, &local.id).await?;

        if local.is_deleted() {
            event::delete(&mut tx, &local.id).await?;
            pending::delete_for_event(&mut tx, &local.id).await?;
        } else if local.sync_state.has_local_changes() || queued.is_some() {
            return Ok(RemoveOutcome::Conflict(local.id));
        } else {
            event::delete(&mut tx, &local.id).await?;
        }

        tx.commit().await?;
        debug!(event_id = %local.id, url = %remote_url, "Applied server deletion");
        Ok(RemoveOutcome::Removed(local.id))
    }

    /// Sets or clears the manual-resolution flag.
    pub async fn mark_conflict(&self, event_id: &str, flag: bool) -> DbResult<Event> {
        let _guard = self.lock(event_id).await?;
        let mut tx = self.pool.begin().await?;
        let mut flagged = require_event(&mut tx, event_id).await?;
        flagged.has_conflict = flag;
        event::update(&mut tx, &flagged).await?;
        tx.commit().await?;
        if flag {
            warn!(event_id = %event_id, "Event marked for manual conflict resolution");
        }
        Ok(flagged)
    }

    /// Re-arms the local version to overwrite the server (local-wins).
    ///
    /// ## Arguments
    /// * `remote_url` / `etag` - Current server identity; `None` when the
    ///   server copy is gone and the event must be created again.
    pub async fn force_push(
        &self,
        event_id: &str,
        remote_url: Option<String>,
        etag: Option<String>,
    ) -> DbResult<Event> {
        let _guard = self.lock(event_id).await?;
        let now = self.now();

        let mut tx = self.pool.begin().await?;
        let mut pushed = require_event(&mut tx, event_id).await?;
        pushed.remote_url = remote_url;
        pushed.etag = etag;
        pushed.has_conflict = false;
        pushed.updated_at = now;

        let planned = if pushed.is_deleted() {
            if pushed.remote_url.is_none() {
                event::delete(&mut tx, &pushed.id).await?;
                pending::delete_for_event(&mut tx, &pushed.id).await?;
                tx.commit().await?;
                return Ok(pushed);
            }
            PlannedOperation::delete(pushed.remote_url.clone(), Some(pushed.calendar_id.clone()))
        } else if pushed.remote_url.is_none() {
            pushed.sync_state = SyncState::PendingCreate;
            PlannedOperation::create()
        } else {
            pushed.sync_state = SyncState::PendingUpdate;
            PlannedOperation::update()
        };

        event::update(&mut tx, &pushed).await?;
        pending::supersede(&mut tx, &pushed.id, planned, now).await?;

        tx.commit().await?;
        debug!(event_id = %pushed.id, state = ?pushed.sync_state, "Re-armed local version");
        Ok(pushed)
    }

    /// Drops a local event and its queued work (server-wins on a deletion).
    pub async fn discard_local(&self, event_id: &str) -> DbResult<()> {
        let _guard = self.lock(event_id).await?;
        let mut tx = self.pool.begin().await?;
        event::delete(&mut tx, event_id).await?;
        pending::delete_for_event(&mut tx, event_id).await?;
        tx.commit().await?;
        info!(event_id = %event_id, "Discarded local event");
        Ok(())
    }

    /// Regenerates the occurrences of every live master.
    ///
    /// Run periodically so the materialized horizon keeps moving with `now`.
    pub async fn refresh_horizon(&self) -> DbResult<usize> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM events WHERE original_event_id IS NULL AND rrule IS NOT NULL \
             AND sync_state != 'pending_delete'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut refreshed = 0;
        for id in ids {
            let _guard = self.locks.acquire(&id).await;
            let now = self.now();
            let mut tx = self.pool.begin().await?;
            if let Some(master) = event::fetch(&mut tx, &id).await? {
                let report =
                    schedule::regenerate(&mut tx, &master, now, self.config.horizon_days).await?;
                if !report.skipped {
                    refreshed += 1;
                }
            }
            tx.commit().await?;
        }
        Ok(refreshed)
    }
}

// =============================================================================
// Transaction Helpers
// =============================================================================

async fn require_calendar(conn: &mut SqliteConnection, id: &str) -> DbResult<Calendar> {
    calendar::fetch(conn, id)
        .await?
        .ok_or_else(|| DbError::not_found("Calendar", id))
}

async fn require_event(conn: &mut SqliteConnection, id: &str) -> DbResult<Event> {
    event::fetch(conn, id)
        .await?
        .ok_or_else(|| DbError::not_found("Event", id))
}

/// Soft-deleted events count as missing.
async fn require_live_event(conn: &mut SqliteConnection, id: &str) -> DbResult<Event> {
    let found = require_event(conn, id).await?;
    if found.is_deleted() {
        return Err(DbError::not_found("Event", id));
    }
    Ok(found)
}

async fn require_recurring(conn: &mut SqliteConnection, id: &str) -> DbResult<Event> {
    let found = require_live_event(conn, id).await?;
    if !found.is_recurring() {
        return Err(DbError::invalid_state(format!("event {} is not recurring", id)));
    }
    Ok(found)
}

async fn find_remote_target(
    conn: &mut SqliteConnection,
    href: &str,
    uid: &str,
) -> DbResult<Option<Event>> {
    match event::fetch_by_remote_url(conn, href).await? {
        Some(found) => Ok(Some(found)),
        None => event::fetch_master_by_uid(conn, uid).await,
    }
}

/// Rejects timezones and rules that cannot be expanded.
fn check_expandable(candidate: &Event) -> DbResult<()> {
    candidate.nominal_zone().map_err(CoreError::from)?;
    if candidate.is_recurring() {
        let first_day = ExpansionWindow::new(candidate.start, candidate.start + chrono::Duration::days(1));
        recurrence::expand(candidate, Some(&first_day)).map_err(CoreError::from)?;
    }
    Ok(())
}

/// Saves a master touched through one of its occurrences and queues an
/// Update for it.
async fn record_master_change(
    conn: &mut SqliteConnection,
    master: &mut Event,
    cal: &Calendar,
    now: DateTime<Utc>,
) -> DbResult<()> {
    master.updated_at = now;
    if cal.is_remote() && master.sync_state == SyncState::Synced {
        master.sync_state = SyncState::PendingUpdate;
    }
    event::update(conn, master).await?;
    if cal.is_remote() {
        pending::enqueue(conn, &master.id, PlannedOperation::update(), now).await?;
    }
    Ok(())
}

/// Adds an EXDATE and cancels the instance's row.
async fn cancel_instance(
    conn: &mut SqliteConnection,
    mut master: Event,
    instance: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DbResult<Event> {
    let cal = require_calendar(conn, &master.calendar_id).await?;

    let row = occurrence::fetch_at(conn, &master.id, instance).await?;
    let exception = event::fetch_exception_at(conn, &master.id, instance).await?;
    if row.is_none()
        && exception.is_none()
        && !recurrence::contains_instance(&master, instance).map_err(CoreError::from)?
    {
        return Err(DbError::invalid_state(format!(
            "{} is not an occurrence of event {}",
            instance, master.id
        )));
    }

    if !master.exdates.contains(&instance) {
        master.exdates.push(instance);
        master.exdates = normalize_instants(&master.exdates);
        master.sequence += 1;
    }
    if let Some(exception) = exception {
        event::delete(conn, &exception.id).await?;
    }
    occurrence::cancel_instance(conn, &master.id, instance).await?;
    record_master_change(conn, &mut master, &cal, now).await?;
    Ok(master)
}

/// Ends a master's rule before `at` and drops what follows.
async fn truncate_series(
    conn: &mut SqliteConnection,
    master: &mut Event,
    cal: &Calendar,
    at: DateTime<Utc>,
    now: DateTime<Utc>,
    horizon_days: i64,
) -> DbResult<()> {
    let rule = master.rrule.clone().unwrap_or_default();
    master.rrule = Some(recurrence::truncate_rule(&rule, at).map_err(CoreError::from)?);
    master.exdates.retain(|d| *d < at);
    master.rdates.retain(|d| *d < at);
    master.sequence += 1;

    event::delete_exceptions_from(conn, &master.id, at).await?;
    record_master_change(conn, master, cal, now).await?;
    schedule::regenerate(conn, master, now, horizon_days).await?;
    Ok(())
}

/// Removes an event: soft when the server holds a copy, hard otherwise.
async fn delete_in_tx(
    conn: &mut SqliteConnection,
    mut target: Event,
    now: DateTime<Utc>,
) -> DbResult<Option<Event>> {
    let cal = require_calendar(conn, &target.calendar_id).await?;
    let planned = PlannedOperation::delete(target.remote_url.clone(), Some(target.calendar_id.clone()));

    let on_server = cal.is_remote()
        && target.remote_url.is_some()
        && target.sync_state != SyncState::PendingCreate;

    if on_server {
        target.sync_state = SyncState::PendingDelete;
        target.has_conflict = false;
        target.updated_at = now;
        event::update(conn, &target).await?;
        occurrence::delete_for_event(conn, &target.id).await?;
        event::delete_exceptions(conn, &target.id).await?;
        pending::enqueue(conn, &target.id, planned, now).await?;
        return Ok(Some(target));
    }

    let queued = pending::get_by_event(conn, &target.id).await?;
    event::delete(conn, &target.id).await?;
    if queued.is_some() {
        pending::enqueue(conn, &target.id, planned, now).await?;
    }
    Ok(None)
}

fn event_from_component(
    id: String,
    uid: String,
    calendar_id: &str,
    component: RemoteComponent,
    now: DateTime<Utc>,
) -> Event {
    Event {
        id,
        uid,
        calendar_id: calendar_id.to_string(),
        summary: component.summary,
        description: component.description,
        location: component.location,
        start: to_second(component.start),
        end: to_second(component.end),
        all_day: component.all_day,
        timezone: component.timezone,
        rrule: component.rrule,
        exdates: normalize_instants(&component.exdates),
        rdates: normalize_instants(&component.rdates),
        sequence: component.sequence,
        sync_state: SyncState::Synced,
        remote_url: None,
        etag: None,
        original_event_id: None,
        original_instance_time: None,
        has_conflict: false,
        created_at: now,
        updated_at: now,
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use caldera_core::{MockClock, Occurrence};
    use chrono::{Duration, TimeZone};

    const WORK_URL: &str = "https://dav.example.com/cal/work/";

    fn t(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    struct Fixture {
        db: Database,
        writer: Writer,
        local: Calendar,
        remote: Calendar,
    }

    async fn fixture() -> Fixture {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let writer = db.writer(WriterConfig::default(), Arc::new(MockClock::new(t(1, 0))));
        let local = db.calendars().create_local("Personal").await.unwrap();
        let remote = db
            .calendars()
            .create_remote("acct-1", "Work", WORK_URL)
            .await
            .unwrap();
        Fixture {
            db,
            writer,
            local,
            remote,
        }
    }

    fn daily(calendar_id: &str, count: u32) -> NewEvent {
        NewEvent::new(calendar_id, "Standup", t(1, 9), t(1, 10))
            .rrule(format!("FREQ=DAILY;COUNT={}", count))
    }

    async fn visible(db: &Database) -> Vec<Occurrence> {
        db.occurrences()
            .in_range(t(1, 0), t(1, 0) + Duration::days(60), None)
            .await
            .unwrap()
    }

    async fn upload(f: &Fixture, event_id: &str) -> String {
        let op = f
            .db
            .pending_operations()
            .get_by_event(event_id)
            .await
            .unwrap()
            .unwrap();
        let url = format!("{}{}.ics", WORK_URL, event_id);
        assert!(f
            .writer
            .mark_synced(event_id, &url, Some("\"e1\"".to_string()), op.revision)
            .await
            .unwrap());
        url
    }

    fn component(summary: &str, start: DateTime<Utc>) -> RemoteComponent {
        RemoteComponent {
            summary: summary.to_string(),
            description: None,
            location: None,
            start,
            end: start + Duration::hours(1),
            all_day: false,
            timezone: None,
            rrule: None,
            exdates: Vec::new(),
            rdates: Vec::new(),
            sequence: 0,
            recurrence_id: None,
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn test_create_local_event_is_synced_without_queue() {
        let f = fixture().await;
        let created = f
            .writer
            .create(NewEvent::new(&f.local.id, "Lunch", t(2, 12), t(2, 13)))
            .await
            .unwrap();

        assert_eq!(created.sync_state, SyncState::Synced);
        assert_eq!(created.sequence, 0);
        assert!(f.db.pending_operations().list().await.unwrap().is_empty());
        assert_eq!(f.db.occurrences().count_for_event(&created.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_remote_event_queues_create() {
        let f = fixture().await;
        let created = f.writer.create(daily(&f.remote.id, 5)).await.unwrap();

        assert_eq!(created.sync_state, SyncState::PendingCreate);
        let op = f
            .db
            .pending_operations()
            .get_by_event(&created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.kind, OperationKind::Create);
        assert_eq!(visible(&f.db).await.len(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_uid_is_rejected() {
        let f = fixture().await;
        let draft = NewEvent::new(&f.local.id, "Lunch", t(2, 12), t(2, 13)).uid("fixed-uid");
        f.writer.create(draft.clone()).await.unwrap();

        let err = f.writer.create(draft).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }

    #[tokio::test]
    async fn test_only_timing_changes_bump_sequence() {
        let f = fixture().await;
        let created = f
            .writer
            .create(NewEvent::new(&f.local.id, "Lunch", t(2, 12), t(2, 13)))
            .await
            .unwrap();

        let renamed = f
            .writer
            .update(&created.id, EventPatch::default().summary("Team lunch"))
            .await
            .unwrap();
        assert_eq!(renamed.summary, "Team lunch");
        assert_eq!(renamed.sequence, 0);

        let moved = f
            .writer
            .update(&created.id, EventPatch::default().timing(t(3, 12), t(3, 13)))
            .await
            .unwrap();
        assert_eq!(moved.sequence, 1);

        let rows = visible(&f.db).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].start_at, t(3, 12));
    }

    #[tokio::test]
    async fn test_delete_never_uploaded_leaves_nothing() {
        let f = fixture().await;
        let created = f.writer.create(daily(&f.remote.id, 3)).await.unwrap();

        assert!(f.writer.delete(&created.id).await.unwrap().is_none());
        assert!(f.db.events().get(&created.id).await.unwrap().is_none());
        assert!(f.db.pending_operations().list().await.unwrap().is_empty());
        assert_eq!(f.db.occurrences().count_for_event(&created.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_uploaded_event_is_soft_until_confirmed() {
        let f = fixture().await;
        let created = f.writer.create(daily(&f.remote.id, 3)).await.unwrap();
        let url = upload(&f, &created.id).await;

        let deleted = f.writer.delete(&created.id).await.unwrap().unwrap();
        assert_eq!(deleted.sync_state, SyncState::PendingDelete);
        assert!(visible(&f.db).await.is_empty());

        let op = f
            .db
            .pending_operations()
            .get_by_event(&created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.kind, OperationKind::Delete);
        assert_eq!(op.target_url.as_deref(), Some(url.as_str()));

        assert!(f
            .writer
            .finalize_remote_delete(&created.id, op.revision)
            .await
            .unwrap());
        assert!(f.db.events().get(&created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_edit_single_occurrence_reuses_exception() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.remote.id, 5)).await.unwrap();

        let first = f
            .writer
            .edit_single_occurrence(&master.id, t(3, 9), OccurrenceEdit::default().summary("Moved"))
            .await
            .unwrap();
        let second = f
            .writer
            .edit_single_occurrence(
                &master.id,
                t(3, 9),
                OccurrenceEdit::default().timing(t(3, 14), t(3, 15)),
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.uid, master.uid);
        assert_eq!(second.summary, "Moved");
        assert_eq!(second.original_instance_time, Some(t(3, 9)));

        let rows = visible(&f.db).await;
        assert_eq!(rows.len(), 5);
        let linked: Vec<_> = rows
            .iter()
            .filter(|r| r.exception_event_id.as_deref() == Some(second.id.as_str()))
            .collect();
        assert_eq!(linked.len(), 1);
        assert_eq!(linked[0].instance_time, t(3, 9));
        assert_eq!(linked[0].start_at, t(3, 14));

        let ops = f.db.pending_operations();
        assert!(ops.get_by_event(&master.id).await.unwrap().is_some());
        assert!(ops.get_by_event(&second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_single_occurrence_hides_only_that_instance() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.local.id, 5)).await.unwrap();
        assert_eq!(visible(&f.db).await.len(), 5);

        let updated = f
            .writer
            .delete_single_occurrence(&master.id, t(3, 9))
            .await
            .unwrap();

        assert_eq!(updated.exdates, vec![t(3, 9)]);
        assert_eq!(updated.sequence, 1);
        let rows = visible(&f.db).await;
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.instance_time != t(3, 9)));
    }

    #[tokio::test]
    async fn test_deleting_exception_cancels_its_instance() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.local.id, 5)).await.unwrap();
        let exception = f
            .writer
            .edit_single_occurrence(&master.id, t(2, 9), OccurrenceEdit::default().summary("Late"))
            .await
            .unwrap();

        assert!(f.writer.delete(&exception.id).await.unwrap().is_none());
        assert!(f.db.events().get(&exception.id).await.unwrap().is_none());
        let master = f.db.events().get(&master.id).await.unwrap().unwrap();
        assert_eq!(master.exdates, vec![t(2, 9)]);
        assert_eq!(visible(&f.db).await.len(), 4);
    }

    #[tokio::test]
    async fn test_refresh_keeps_exception_links() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.local.id, 5)).await.unwrap();
        let exception = f
            .writer
            .edit_single_occurrence(
                &master.id,
                t(2, 9),
                OccurrenceEdit::default().timing(t(2, 14), t(2, 15)),
            )
            .await
            .unwrap();

        assert_eq!(f.writer.refresh_horizon().await.unwrap(), 1);

        let rows = visible(&f.db).await;
        assert_eq!(rows.len(), 5);
        let row = rows.iter().find(|r| r.instance_time == t(2, 9)).unwrap();
        assert_eq!(row.exception_event_id.as_deref(), Some(exception.id.as_str()));
        assert_eq!(row.start_at, t(2, 14));
    }

    #[tokio::test]
    async fn test_metadata_edit_keeps_links_and_cancellations() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.local.id, 5)).await.unwrap();
        let exception = f
            .writer
            .edit_single_occurrence(
                &master.id,
                t(2, 9),
                OccurrenceEdit::default().timing(t(2, 14), t(2, 15)),
            )
            .await
            .unwrap();
        f.writer
            .delete_single_occurrence(&master.id, t(4, 9))
            .await
            .unwrap();

        f.writer
            .update(&master.id, EventPatch::default().summary("Daily sync"))
            .await
            .unwrap();
        assert_eq!(f.writer.refresh_horizon().await.unwrap(), 1);

        let rows = f.db.occurrences().for_event(&master.id).await.unwrap();
        assert_eq!(rows.len(), 5);
        let linked = rows.iter().find(|r| r.instance_time == t(2, 9)).unwrap();
        assert_eq!(linked.exception_event_id.as_deref(), Some(exception.id.as_str()));
        assert_eq!(linked.start_at, t(2, 14));
        assert!(!linked.cancelled);
        let cancelled = rows.iter().find(|r| r.instance_time == t(4, 9)).unwrap();
        assert!(cancelled.cancelled);
        assert_eq!(visible(&f.db).await.len(), 4);
    }

    #[tokio::test]
    async fn test_regeneration_is_idempotent() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.local.id, 5)).await.unwrap();
        f.writer
            .edit_single_occurrence(&master.id, t(3, 9), OccurrenceEdit::default().summary("Demo"))
            .await
            .unwrap();
        f.writer
            .delete_single_occurrence(&master.id, t(5, 9))
            .await
            .unwrap();

        f.writer.refresh_horizon().await.unwrap();
        let first = f.db.occurrences().for_event(&master.id).await.unwrap();
        f.writer.refresh_horizon().await.unwrap();
        let second = f.db.occurrences().for_event(&master.id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_override_on_excluded_instance_keeps_single_row() {
        let f = fixture().await;
        let mut series = component("Standup", t(1, 9));
        series.rrule = Some("FREQ=DAILY;COUNT=5".to_string());
        series.exdates = vec![t(3, 9)];
        let mut moved = component("Standup (moved)", t(3, 15));
        moved.recurrence_id = Some(t(3, 9));

        let remote = RemoteEvent {
            uid: "series-1".to_string(),
            href: format!("{}series-1.ics", WORK_URL),
            etag: Some("\"1\"".to_string()),
            master: Some(series),
            overrides: vec![moved],
        };
        let id = match f.writer.apply_remote(&f.remote.id, remote, false).await.unwrap() {
            ApplyOutcome::Applied { event_id, .. } => event_id,
            other => panic!("unexpected {:?}", other),
        };

        let rows = f.db.occurrences().for_event(&id).await.unwrap();
        assert_eq!(rows.len(), 5);
        let at: Vec<_> = rows.iter().filter(|r| r.instance_time == t(3, 9)).collect();
        assert_eq!(at.len(), 1);
        assert!(at[0].exception_event_id.is_some());
        assert!(at[0].cancelled);
        assert_eq!(visible(&f.db).await.len(), 4);

        let duplicates: Vec<(String, i64)> = sqlx::query_as(
            "SELECT event_id, COUNT(*) FROM occurrences WHERE cancelled = 0 \
             GROUP BY event_id, instance_time HAVING COUNT(*) > 1",
        )
        .fetch_all(f.db.pool())
        .await
        .unwrap();
        assert!(duplicates.is_empty());
        let owned_by_exceptions: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM occurrences o JOIN events e ON e.id = o.event_id \
             WHERE e.original_event_id IS NOT NULL",
        )
        .fetch_one(f.db.pool())
        .await
        .unwrap();
        assert_eq!(owned_by_exceptions, 0);
    }

    #[tokio::test]
    async fn test_master_time_change_leaves_stale_exception_unlinked() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.local.id, 5)).await.unwrap();
        let exception = f
            .writer
            .edit_single_occurrence(
                &master.id,
                t(3, 9),
                OccurrenceEdit::default().timing(t(3, 14), t(3, 15)),
            )
            .await
            .unwrap();

        f.writer
            .update(&master.id, EventPatch::default().timing(t(1, 11), t(1, 12)))
            .await
            .unwrap();
        // Editing the stale override must not bring its row back.
        f.writer
            .update(&exception.id, EventPatch::default().summary("Still kept"))
            .await
            .unwrap();

        let rows = visible(&f.db).await;
        assert_eq!(rows.len(), 5);
        let day3: Vec<_> = rows
            .iter()
            .filter(|r| r.start_at >= t(3, 0) && r.start_at < t(4, 0))
            .collect();
        assert_eq!(day3.len(), 1);
        assert_eq!(day3[0].start_at, t(3, 11));
        assert!(day3[0].exception_event_id.is_none());
        assert!(f.db.events().get(&exception.id).await.unwrap().is_some());

        // Back on the old time, the override applies again.
        f.writer
            .update(&master.id, EventPatch::default().timing(t(1, 9), t(1, 10)))
            .await
            .unwrap();
        let rows = visible(&f.db).await;
        assert_eq!(rows.len(), 5);
        let row = rows.iter().find(|r| r.instance_time == t(3, 9)).unwrap();
        assert_eq!(row.exception_event_id.as_deref(), Some(exception.id.as_str()));
        assert_eq!(row.start_at, t(3, 14));
    }

    #[tokio::test]
    async fn test_split_series_creates_tail_with_remaining_count() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.local.id, 10)).await.unwrap();

        let tail = f.writer.split_series(&master.id, t(4, 9)).await.unwrap();

        assert_ne!(tail.uid, master.uid);
        assert_eq!(tail.start, t(4, 9));
        assert_eq!(tail.rrule.as_deref(), Some("FREQ=DAILY;COUNT=7"));

        let occurrences = f.db.occurrences();
        assert_eq!(occurrences.count_for_event(&master.id).await.unwrap(), 3);
        assert_eq!(occurrences.count_for_event(&tail.id).await.unwrap(), 7);
        assert_eq!(visible(&f.db).await.len(), 10);

        let master = f.db.events().get(&master.id).await.unwrap().unwrap();
        assert_eq!(master.sequence, 1);
    }

    #[tokio::test]
    async fn test_split_at_first_occurrence_is_invalid() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.local.id, 10)).await.unwrap();

        let err = f.writer.split_series(&master.id, t(1, 9)).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_delete_this_and_future() {
        let f = fixture().await;
        let master = f.writer.create(daily(&f.local.id, 5)).await.unwrap();

        let truncated = f
            .writer
            .delete_this_and_future(&master.id, t(3, 9))
            .await
            .unwrap()
            .unwrap();
        assert!(truncated.rrule.unwrap().contains("UNTIL="));
        assert_eq!(visible(&f.db).await.len(), 2);

        let gone = f
            .writer
            .delete_this_and_future(&master.id, t(1, 9))
            .await
            .unwrap();
        assert!(gone.is_none());
        assert!(f.db.events().get(&master.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_remote_to_local_queues_delete_of_source() {
        let f = fixture().await;
        let created = f.writer.create(daily(&f.remote.id, 3)).await.unwrap();
        let url = upload(&f, &created.id).await;

        let moved = f
            .writer
            .move_event_to_calendar(&created.id, &f.local.id)
            .await
            .unwrap();
        assert_eq!(moved.calendar_id, f.local.id);
        assert_eq!(moved.sync_state, SyncState::Synced);
        assert!(moved.remote_url.is_none());

        let op = f
            .db
            .pending_operations()
            .get_by_event(&created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.kind, OperationKind::Delete);
        assert_eq!(op.target_url.as_deref(), Some(url.as_str()));
        assert_eq!(op.target_calendar_id.as_deref(), Some(f.remote.id.as_str()));

        let rows = visible(&f.db).await;
        assert!(rows.iter().all(|r| r.calendar_id == f.local.id));
    }

    #[tokio::test]
    async fn test_move_local_to_remote_queues_create() {
        let f = fixture().await;
        let created = f.writer.create(daily(&f.local.id, 3)).await.unwrap();

        let moved = f
            .writer
            .move_event_to_calendar(&created.id, &f.remote.id)
            .await
            .unwrap();
        assert_eq!(moved.sync_state, SyncState::PendingCreate);

        let op = f
            .db
            .pending_operations()
            .get_by_event(&created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.kind, OperationKind::Create);
    }

    #[tokio::test]
    async fn test_edit_occurrence_of_single_event_is_invalid() {
        let f = fixture().await;
        let single = f
            .writer
            .create(NewEvent::new(&f.local.id, "Lunch", t(2, 12), t(2, 13)))
            .await
            .unwrap();

        let err = f
            .writer
            .edit_single_occurrence(&single.id, t(2, 12), OccurrenceEdit::default().summary("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_apply_remote_detects_conflict_then_overwrites() {
        let f = fixture().await;
        let local = f
            .writer
            .create(NewEvent::new(&f.remote.id, "Local title", t(2, 12), t(2, 13)))
            .await
            .unwrap();

        let remote = RemoteEvent {
            uid: local.uid.clone(),
            href: format!("{}server.ics", WORK_URL),
            etag: Some("\"s1\"".to_string()),
            master: Some(component("Server title", t(2, 15))),
            overrides: Vec::new(),
        };

        let outcome = f
            .writer
            .apply_remote(&f.remote.id, remote.clone(), false)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Conflict(local.id.clone()));

        let outcome = f.writer.apply_remote(&f.remote.id, remote, true).await.unwrap();
        assert_eq!(
            outcome,
            ApplyOutcome::Applied {
                event_id: local.id.clone(),
                created: false
            }
        );

        let stored = f.db.events().get(&local.id).await.unwrap().unwrap();
        assert_eq!(stored.summary, "Server title");
        assert_eq!(stored.sync_state, SyncState::Synced);
        assert_eq!(stored.etag.as_deref(), Some("\"s1\""));
        assert!(f.db.pending_operations().list().await.unwrap().is_empty());
        assert_eq!(visible(&f.db).await[0].start_at, t(2, 15));
    }

    #[tokio::test]
    async fn test_apply_remote_unchanged_etag_is_skipped() {
        let f = fixture().await;
        let remote = RemoteEvent {
            uid: "server-uid".to_string(),
            href: format!("{}server.ics", WORK_URL),
            etag: Some("\"s1\"".to_string()),
            master: Some(component("Server title", t(2, 15))),
            overrides: Vec::new(),
        };

        let outcome = f
            .writer
            .apply_remote(&f.remote.id, remote.clone(), false)
            .await
            .unwrap();
        let event_id = match outcome {
            ApplyOutcome::Applied { event_id, created } => {
                assert!(created);
                event_id
            }
            other => panic!("unexpected outcome: {:?}", other),
        };

        let outcome = f.writer.apply_remote(&f.remote.id, remote, false).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Unchanged(event_id));
    }

    #[tokio::test]
    async fn test_mark_synced_keeps_newer_local_change() {
        let f = fixture().await;
        let created = f
            .writer
            .create(NewEvent::new(&f.remote.id, "Lunch", t(2, 12), t(2, 13)))
            .await
            .unwrap();
        let in_flight = f
            .db
            .pending_operations()
            .get_by_event(&created.id)
            .await
            .unwrap()
            .unwrap();

        f.writer
            .update(&created.id, EventPatch::default().summary("Renamed"))
            .await
            .unwrap();

        let url = format!("{}lunch.ics", WORK_URL);
        let cleared = f
            .writer
            .mark_synced(&created.id, &url, Some("\"e1\"".to_string()), in_flight.revision)
            .await
            .unwrap();
        assert!(!cleared);

        let stored = f.db.events().get(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.sync_state, SyncState::PendingUpdate);
        assert_eq!(stored.remote_url.as_deref(), Some(url.as_str()));

        let op = f
            .db
            .pending_operations()
            .get_by_event(&created.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.kind, OperationKind::Update);
    }

    #[tokio::test]
    async fn test_remove_remote_respects_local_changes() {
        let f = fixture().await;
        let created = f.writer.create(daily(&f.remote.id, 3)).await.unwrap();
        let url = upload(&f, &created.id).await;

        f.writer
            .update(&created.id, EventPatch::default().summary("Edited offline"))
            .await
            .unwrap();
        let outcome = f.writer.remove_remote(&f.remote.id, &url).await.unwrap();
        assert_eq!(outcome, RemoveOutcome::Conflict(created.id.clone()));

        f.writer.discard_local(&created.id).await.unwrap();
        let outcome = f.writer.remove_remote(&f.remote.id, &url).await.unwrap();
        assert_eq!(outcome, RemoveOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_concurrent_updates_serialize() {
        let f = fixture().await;
        let created = f
            .writer
            .create(NewEvent::new(&f.local.id, "Lunch", t(2, 12), t(2, 13)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let writer = f.writer.clone();
            let id = created.id.clone();
            handles.push(tokio::spawn(async move {
                let start = t(2, 12) + Duration::minutes(i + 1);
                writer
                    .update(&id, EventPatch::default().timing(start, start + Duration::hours(1)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let stored = f.db.events().get(&created.id).await.unwrap().unwrap();
        assert_eq!(stored.sequence, 8);
        assert_eq!(f.db.occurrences().count_for_event(&created.id).await.unwrap(), 1);
    }
}
