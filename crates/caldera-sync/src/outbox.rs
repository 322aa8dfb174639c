//! # Outbox Processor
//!
//! Drains the `pending_operations` table into CalDAV requests.
//!
//! ## Pass Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Outbox Processor Pass                                │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  pending_operations Table                       │   │
//! │  │                                                                 │   │
//! │  │  event_id | kind   | target_url   | retry | status  | revision │   │
//! │  │  ─────────┼────────┼──────────────┼───────┼─────────┼──────────│   │
//! │  │  evt-1    │ create │ NULL         │ 0     │ pending │ 1        │   │
//! │  │  evt-2    │ delete │ /cal/a/2.ics │ 2     │ pending │ 3        │   │
//! │  │  evt-3    │ move   │ /cal/a/3.ics │ 0     │ pending │ 1        │   │
//! │  └────────────────────────────┬────────────────────────────────────┘   │
//! │                               │                                         │
//! │  0. Recover: in_progress → pending (crash or cancelled pass)           │
//! │  1. Select:  eligible(now, batch, expedited)                           │
//! │  2. Claim:   mark_in_progress (one row per event ⇒ single-flight)      │
//! │  3. Run:     buffer_unordered(workers)                                 │
//! │                 Create  PUT If-None-Match: *                            │
//! │                 Update  PUT If-Match: etag                              │
//! │                 Delete  DELETE If-Match: etag (404 counts as done)     │
//! │                 Move    PUT new resource, DELETE old one (even on 412) │
//! │  4. Settle:  2xx      → mark_synced / finalize_remote_delete           │
//! │              412/409  → Reconciler                                     │
//! │              401      → stop the pass, surface to the user             │
//! │              403      → failed attempt, like any refused write          │
//! │              other    → mark_failed_attempt (backoff, Retry-After)     │
//! │                                                                         │
//! │  Cancellation is checked before each operation, never mid-request.    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use caldera_core::{
    Calendar, Clock, ConflictOutcome, Event, OperationKind, OperationStatus, PendingOperation,
};
use caldera_db::{Database, Writer};

use crate::agent::SyncEventEmitter;
use crate::client::{CalDavClient, ClientRegistry, Precondition};
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncResult};
use crate::ical;
use crate::reconcile::Reconciler;

// =============================================================================
// Reports
// =============================================================================

/// Result of one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The server accepted the change.
    Pushed,
    /// The server had diverged; the resolver decided.
    Conflict(ConflictOutcome),
    /// Failed; scheduled for another attempt.
    Retrying,
    /// Failed for the last time.
    Failed,
    /// Not run (claimed elsewhere, stale, or cancelled).
    Skipped,
}

/// Tally of one outbox pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub conflicts: usize,
    pub retrying: usize,
    pub failed: usize,
    pub skipped: usize,
    /// The pass stopped early because its token was cancelled.
    pub cancelled: bool,
}

impl PushReport {
    fn record(&mut self, step: &Step) {
        match step {
            Step::Pushed => self.pushed += 1,
            Step::Conflict(_) => self.conflicts += 1,
            Step::Retrying => self.retrying += 1,
            Step::Failed => self.failed += 1,
            Step::Skipped => self.skipped += 1,
        }
    }
}

// =============================================================================
// Outbox Processor
// =============================================================================

/// Executes queued operations against the server.
pub struct OutboxProcessor {
    db: Arc<Database>,
    writer: Writer,
    clients: Arc<ClientRegistry>,
    reconciler: Reconciler,
    settings: SyncSettings,
    emitter: Arc<dyn SyncEventEmitter>,
    clock: Arc<dyn Clock>,
}

impl OutboxProcessor {
    pub fn new(
        db: Arc<Database>,
        writer: Writer,
        clients: Arc<ClientRegistry>,
        settings: SyncSettings,
        emitter: Arc<dyn SyncEventEmitter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let reconciler = Reconciler::new(
            db.clone(),
            writer.clone(),
            settings.conflict_strategy,
            emitter.clone(),
        );
        OutboxProcessor {
            db,
            writer,
            clients,
            reconciler,
            settings,
            emitter,
            clock,
        }
    }

    /// Runs every eligible operation once.
    ///
    /// ## Arguments
    /// * `expedited` - Ignore backoff windows of pending operations
    /// * `cancel` - Stops the pass between operations
    ///
    /// ## Errors
    /// `AuthFailure` when the server rejected the credentials; the pass
    /// stops and the affected operation stays pending.
    pub async fn run_pass(
        &self,
        expedited: bool,
        cancel: &CancellationToken,
    ) -> SyncResult<PushReport> {
        let ops = self.db.pending_operations();
        let recovered = ops.reset_in_progress().await?;
        if recovered > 0 {
            info!(count = recovered, "Recovered interrupted operations");
        }

        let stop = cancel.child_token();
        let workers = self.settings.workers.max(1);
        let mut report = PushReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        let mut auth_failure: Option<String> = None;

        loop {
            if stop.is_cancelled() {
                break;
            }

            let now = self.clock.now();
            let batch: Vec<PendingOperation> = ops
                .eligible(now, self.settings.batch_size, expedited)
                .await?
                .into_iter()
                .filter(|op| seen.insert(op.id.clone()))
                .collect();
            if batch.is_empty() {
                break;
            }
            debug!(count = batch.len(), expedited, "Processing outbox batch");

            let results: Vec<SyncResult<Step>> = stream::iter(batch)
                .map(|op| self.process(op, &stop))
                .buffer_unordered(workers)
                .collect()
                .await;

            for result in results {
                match result {
                    Ok(step) => report.record(&step),
                    Err(SyncError::AuthFailure(message)) => auth_failure = Some(message),
                    Err(err) => {
                        error!(?err, "Outbox operation aborted");
                        report.skipped += 1;
                    }
                }
            }
        }

        if stop.is_cancelled() {
            ops.reset_in_progress().await?;
            report.cancelled = cancel.is_cancelled();
        }

        if let Some(message) = auth_failure {
            self.emitter.emit_error(&message, false);
            return Err(SyncError::AuthFailure(message));
        }

        let pending = ops.count_by_status(OperationStatus::Pending).await?;
        self.emitter.emit_progress(pending, report.pushed as i64);
        info!(
            pushed = report.pushed,
            conflicts = report.conflicts,
            retrying = report.retrying,
            failed = report.failed,
            cancelled = report.cancelled,
            "Outbox pass complete"
        );
        Ok(report)
    }

    /// Claims and runs one operation.
    async fn process(&self, op: PendingOperation, stop: &CancellationToken) -> SyncResult<Step> {
        if stop.is_cancelled() {
            return Ok(Step::Skipped);
        }
        let ops = self.db.pending_operations();
        if !ops.mark_in_progress(&op.id, self.clock.now()).await? {
            return Ok(Step::Skipped);
        }

        debug!(op_id = %op.id, event_id = %op.event_id, kind = %op.kind, "Running operation");
        match self.execute(&op).await {
            Ok(step) => Ok(step),
            Err(SyncError::AuthFailure(message)) => {
                stop.cancel();
                ops.release(&op.id).await?;
                Err(SyncError::AuthFailure(message))
            }
            Err(err) => self.record_failure(&op, &err).await,
        }
    }

    async fn record_failure(&self, op: &PendingOperation, err: &SyncError) -> SyncResult<Step> {
        let now = self.clock.now();
        let not_before = err
            .retry_after()
            .and_then(|wait| chrono::Duration::from_std(wait).ok())
            .map(|wait| now + wait);

        let decision = self
            .db
            .pending_operations()
            .mark_failed_attempt(op, &err.to_string(), now, self.settings.max_retries, not_before)
            .await?;

        match decision {
            Some(decision) if decision.status == OperationStatus::Failed => {
                let exhausted = SyncError::MaxRetriesExceeded {
                    id: op.id.clone(),
                    last_error: err.to_string(),
                };
                self.emitter.emit_error(&exhausted.to_string(), false);
                Ok(Step::Failed)
            }
            Some(decision) => {
                warn!(
                    op_id = %op.id,
                    event_id = %op.event_id,
                    attempt = decision.retry_count,
                    next_retry_at = %decision.next_retry_at,
                    error = %err,
                    "Operation failed; will retry"
                );
                Ok(Step::Retrying)
            }
            None => Ok(Step::Retrying),
        }
    }

    async fn execute(&self, op: &PendingOperation) -> SyncResult<Step> {
        let event = self.db.events().get(&op.event_id).await?;
        match (op.kind, event) {
            (OperationKind::Delete, event) => self.delete(op, event).await,
            (_, Some(event)) if !event.is_deleted() => match op.kind {
                OperationKind::Move => self.move_event(op, event).await,
                _ => self.push(op, event).await,
            },
            _ => {
                // The event went away after the operation was queued.
                self.writer
                    .finalize_remote_delete(&op.event_id, op.revision)
                    .await?;
                Ok(Step::Skipped)
            }
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Create or Update.
    async fn push(&self, op: &PendingOperation, event: Event) -> SyncResult<Step> {
        let calendar = self.db.calendars().require(&event.calendar_id).await?;
        let client = self.clients.for_calendar(&calendar)?;
        let body = self.render(&event).await?;

        let (url, precondition) = match (op.kind, event.remote_url.clone()) {
            (OperationKind::Update, Some(url)) => {
                let precondition = match event.etag.clone() {
                    Some(etag) => Precondition::Match(etag),
                    None => current_precondition(client, &url).await?,
                };
                (url, precondition)
            }
            (_, Some(url)) => (url, Precondition::Create),
            (_, None) => (resource_url(&calendar, &event)?, Precondition::Create),
        };

        match client.put(&url, body, precondition).await {
            Ok(etag) => {
                self.writer
                    .mark_synced(&event.id, &url, etag, op.revision)
                    .await?;
                Ok(Step::Pushed)
            }
            Err(SyncError::Conflict { .. }) => self.resolve(op, &calendar, client, &event.id, &url).await,
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, op: &PendingOperation, event: Option<Event>) -> SyncResult<Step> {
        let url = match op
            .target_url
            .clone()
            .or_else(|| event.as_ref().and_then(|e| e.remote_url.clone()))
        {
            Some(url) => url,
            None => {
                self.writer
                    .finalize_remote_delete(&op.event_id, op.revision)
                    .await?;
                return Ok(Step::Pushed);
            }
        };

        let calendar_id = op
            .target_calendar_id
            .clone()
            .or_else(|| event.as_ref().map(|e| e.calendar_id.clone()));
        let calendar = self.calendar_for(calendar_id.as_deref(), &url).await?;
        let client = self.clients.for_calendar(&calendar)?;

        // A resource left behind by a move has no ETag we know of.
        let etag = event
            .as_ref()
            .filter(|e| e.remote_url.as_deref() == Some(url.as_str()))
            .and_then(|e| e.etag.clone());

        match client.delete(&url, etag.as_deref()).await {
            Ok(()) | Err(SyncError::NotFound(_)) => {
                self.writer
                    .finalize_remote_delete(&op.event_id, op.revision)
                    .await?;
                Ok(Step::Pushed)
            }
            Err(SyncError::Conflict { .. }) if etag.is_some() => {
                self.resolve(op, &calendar, client, &op.event_id, &url).await
            }
            Err(err) => Err(err),
        }
    }

    /// PUT into the target collection, then DELETE the source resource.
    async fn move_event(&self, op: &PendingOperation, event: Event) -> SyncResult<Step> {
        let target = self.db.calendars().require(&event.calendar_id).await?;
        let client = self.clients.for_calendar(&target)?;
        let url = match event.remote_url.clone() {
            Some(url) => url,
            None => resource_url(&target, &event)?,
        };
        // A retry may find its own earlier PUT in place.
        let precondition = if op.retry_count == 0 {
            Precondition::Create
        } else {
            Precondition::Unconditional
        };
        let body = self.render(&event).await?;

        let etag = match client.put(&url, body, precondition).await {
            Ok(etag) => etag,
            Err(SyncError::Conflict { .. }) => {
                // The target already holds a copy, so the source goes whatever the resolver decides.
                self.delete_move_source(op, client).await?;
                return self.resolve(op, &target, client, &event.id, &url).await;
            }
            Err(err) => return Err(err),
        };

        self.delete_move_source(op, client).await?;
        self.writer
            .mark_synced(&event.id, &url, etag, op.revision)
            .await?;
        Ok(Step::Pushed)
    }

    /// Removes the resource a move left behind in the source collection.
    async fn delete_move_source(&self, op: &PendingOperation, fallback: &CalDavClient) -> SyncResult<()> {
        let source_url = match op.target_url.as_deref() {
            Some(url) => url,
            None => return Ok(()),
        };
        let source_client = match self
            .calendar_for(op.target_calendar_id.as_deref(), source_url)
            .await
        {
            Ok(source) => self.clients.for_calendar(&source)?,
            Err(_) => fallback,
        };
        match source_client.delete(source_url, None).await {
            Ok(()) | Err(SyncError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Fetches the server copy and hands the collision to the resolver.
    async fn resolve(
        &self,
        op: &PendingOperation,
        calendar: &Calendar,
        client: &CalDavClient,
        event_id: &str,
        url: &str,
    ) -> SyncResult<Step> {
        let remote = match client.get(url).await {
            Ok(fetched) => Some(ical::parse_resource(
                &fetched.body,
                &fetched.url,
                fetched.etag.as_deref(),
            )?),
            Err(SyncError::NotFound(_)) => None,
            Err(err) => return Err(err),
        };

        let outcome = self.reconciler.settle(event_id, &calendar.id, remote).await?;
        // Manual and failed resolutions leave the row claimed.
        self.db.pending_operations().release(&op.id).await?;
        Ok(Step::Conflict(outcome))
    }

    async fn render(&self, master: &Event) -> SyncResult<String> {
        let exceptions = self.db.events().exceptions(&master.id).await?;
        Ok(ical::render_event(master, &exceptions))
    }

    /// Calendar by id, or the remote calendar whose collection holds `url`.
    async fn calendar_for(&self, calendar_id: Option<&str>, url: &str) -> SyncResult<Calendar> {
        if let Some(id) = calendar_id {
            if let Some(found) = self.db.calendars().get(id).await? {
                return Ok(found);
            }
        }
        self.db
            .calendars()
            .list_remote(None)
            .await?
            .into_iter()
            .find(|c| c.remote_url.as_deref().is_some_and(|base| url.starts_with(base)))
            .ok_or_else(|| SyncError::Internal(format!("no calendar holds {}", url)))
    }
}

/// Precondition for an Update whose ETag was never learned.
async fn current_precondition(client: &CalDavClient, url: &str) -> SyncResult<Precondition> {
    match client.get(url).await {
        Ok(fetched) => Ok(fetched
            .etag
            .map(Precondition::Match)
            .unwrap_or(Precondition::Unconditional)),
        Err(SyncError::NotFound(_)) => Ok(Precondition::Create),
        Err(err) => Err(err),
    }
}

/// New resource URL for an event inside a collection.
pub fn resource_url(calendar: &Calendar, event: &Event) -> SyncResult<String> {
    let collection = calendar.remote_url.as_deref().ok_or_else(|| {
        SyncError::InvalidConfig(format!("calendar {} has no collection URL", calendar.id))
    })?;
    let mut base = Url::parse(collection)?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join(&ical::resource_name(&event.uid))?.to_string())
}

// =============================================================================
// Unit Tests
// =============================================================================
