//! # Inbound Puller
//!
//! Brings server-side changes into the local store.
//!
//! ## Pull Flow (per remote calendar)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Inbound Pull                                         │
//! │                                                                         │
//! │  1. PROPFIND Depth 0 ── getctag unchanged? ──► skip (Normal only)      │
//! │                                                                         │
//! │  2. REPORT sync-collection(stored token)                               │
//! │        └─ token rejected / unsupported → calendar-query listing        │
//! │           (full member list, removals diffed against local rows)      │
//! │                                                                         │
//! │  3. Changed hrefs whose ETag differs from the local copy               │
//! │        └─ REPORT calendar-multiget in batches                          │
//! │        └─ parse iCalendar → apply_remote                               │
//! │              Applied / Unchanged / Ignored                             │
//! │              Conflict ──► Reconciler                                   │
//! │                                                                         │
//! │  4. Removed hrefs → remove_remote                                      │
//! │              Conflict ──► Reconciler (server copy gone)                │
//! │                                                                         │
//! │  5. Store ctag + new sync token (only when the pull completed)        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Corrupt Input
//! A resource that fails to parse is skipped and counted; the local copy
//! is left untouched and the sync token is still advanced only if every
//! other step succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use caldera_core::Calendar;
use caldera_db::{ApplyOutcome, Database, RemoveOutcome, Writer};

use crate::client::{CalDavClient, ClientRegistry, DeltaListing};
use crate::error::{SyncError, SyncResult};
use crate::ical;
use crate::reconcile::Reconciler;

// =============================================================================
// Reports
// =============================================================================

/// How much of a calendar to re-read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullMode {
    /// Skip calendars whose ctag is unchanged; use the stored sync token.
    Normal,
    /// Ignore ctag and token; list every member.
    Full,
}

/// Tally of one calendar pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    pub applied: usize,
    pub removed: usize,
    pub conflicts: usize,
    /// Resources whose body could not be parsed.
    pub corrupt: usize,
    /// Calendar skipped because its ctag was unchanged.
    pub unchanged: bool,
    pub cancelled: bool,
}

impl PullReport {
    pub fn merge(&mut self, other: &PullReport) {
        self.applied += other.applied;
        self.removed += other.removed;
        self.conflicts += other.conflicts;
        self.corrupt += other.corrupt;
        self.cancelled |= other.cancelled;
    }
}

// =============================================================================
// Inbound Puller
// =============================================================================

/// Pulls server changes for remote calendars.
pub struct InboundPuller {
    db: Arc<Database>,
    writer: Writer,
    clients: Arc<ClientRegistry>,
    reconciler: Reconciler,
    batch_size: usize,
}

impl InboundPuller {
    pub fn new(
        db: Arc<Database>,
        writer: Writer,
        clients: Arc<ClientRegistry>,
        reconciler: Reconciler,
        batch_size: usize,
    ) -> Self {
        InboundPuller {
            db,
            writer,
            clients,
            reconciler,
            batch_size: batch_size.max(1),
        }
    }

    /// Discovers an account's calendars and records them.
    ///
    /// ## Returns
    /// The remote calendars of the account after the refresh.
    pub async fn refresh_calendars(&self, account_id: &str) -> SyncResult<Vec<Calendar>> {
        let client = self.clients.get(account_id).ok_or_else(|| {
            SyncError::InvalidConfig(format!("account '{}' is not configured", account_id))
        })?;

        let calendars = self.db.calendars();
        for found in client.discover().await? {
            calendars
                .upsert_remote(account_id, &found.url, &found.display_name, found.color.as_deref())
                .await?;
        }
        Ok(calendars.list_remote(Some(account_id)).await?)
    }

    /// Pulls every remote calendar of every configured account.
    pub async fn pull_all(&self, mode: PullMode, cancel: &CancellationToken) -> SyncResult<PullReport> {
        let mut total = PullReport::default();
        for account_id in self.clients.account_ids() {
            let mut calendars = self.db.calendars().list_remote(Some(&account_id)).await?;
            if calendars.is_empty() || mode == PullMode::Full {
                calendars = self.refresh_calendars(&account_id).await?;
            }

            for calendar in calendars {
                if cancel.is_cancelled() {
                    total.cancelled = true;
                    return Ok(total);
                }
                let report = self.pull_calendar(&calendar, mode, cancel).await?;
                total.merge(&report);
            }
        }
        Ok(total)
    }

    /// Pulls one calendar.
    pub async fn pull_calendar(
        &self,
        calendar: &Calendar,
        mode: PullMode,
        cancel: &CancellationToken,
    ) -> SyncResult<PullReport> {
        let client = self.clients.for_calendar(calendar)?;
        let collection = calendar.remote_url.clone().ok_or_else(|| {
            SyncError::InvalidConfig(format!("calendar {} has no collection URL", calendar.id))
        })?;
        let mut report = PullReport::default();

        let (ctag, _) = client.collection_state(&collection).await?;
        if mode == PullMode::Normal && ctag.is_some() && ctag == calendar.ctag {
            debug!(calendar_id = %calendar.id, "Collection unchanged");
            report.unchanged = true;
            return Ok(report);
        }

        let token = match mode {
            PullMode::Normal => calendar.sync_token.as_deref(),
            PullMode::Full => None,
        };
        let listing = client.delta(&collection, token).await?;

        // url → (event id, etag) of what we already mirror.
        let known: HashMap<String, (String, Option<String>)> = self
            .db
            .events()
            .remote_identities(&calendar.id)
            .await?
            .into_iter()
            .map(|(id, url, etag)| (url, (id, etag)))
            .collect();

        let wanted: Vec<String> = listing
            .changed
            .iter()
            .filter(|r| match known.get(&r.url) {
                Some((_, local_etag)) => r.etag.is_none() || *local_etag != r.etag,
                None => true,
            })
            .map(|r| r.url.clone())
            .collect();

        for chunk in wanted.chunks(self.batch_size) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(report);
            }
            self.apply_batch(client, calendar, &collection, chunk, &mut report)
                .await?;
        }

        for url in removed_urls(&listing, &known) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                return Ok(report);
            }
            match self.writer.remove_remote(&calendar.id, &url).await? {
                RemoveOutcome::Removed(_) => report.removed += 1,
                RemoveOutcome::Conflict(event_id) => {
                    self.reconciler.settle(&event_id, &calendar.id, None).await?;
                    report.conflicts += 1;
                }
                RemoveOutcome::NotFound => {}
            }
        }

        self.db
            .calendars()
            .update_sync_state(&calendar.id, ctag.as_deref(), listing.sync_token.as_deref())
            .await?;

        info!(
            calendar_id = %calendar.id,
            applied = report.applied,
            removed = report.removed,
            conflicts = report.conflicts,
            corrupt = report.corrupt,
            full = listing.full,
            "Pulled calendar"
        );
        Ok(report)
    }

    async fn apply_batch(
        &self,
        client: &CalDavClient,
        calendar: &Calendar,
        collection: &str,
        urls: &[String],
        report: &mut PullReport,
    ) -> SyncResult<()> {
        for fetched in client.multiget(collection, urls).await? {
            let remote = match ical::parse_resource(&fetched.body, &fetched.url, fetched.etag.as_deref()) {
                Ok(remote) => remote,
                Err(err) => {
                    warn!(url = %fetched.url, ?err, "Skipping unparseable resource");
                    report.corrupt += 1;
                    continue;
                }
            };

            match self.writer.apply_remote(&calendar.id, remote.clone(), false).await? {
                ApplyOutcome::Applied { .. } => report.applied += 1,
                ApplyOutcome::Conflict(event_id) => {
                    self.reconciler
                        .settle(&event_id, &calendar.id, Some(remote))
                        .await?;
                    report.conflicts += 1;
                }
                ApplyOutcome::Unchanged(_) | ApplyOutcome::Ignored => {}
            }
        }
        Ok(())
    }
}

/// Server-side deletions: reported ones, or for a full listing, every
/// mirrored URL the server no longer lists.
fn removed_urls(
    listing: &DeltaListing,
    known: &HashMap<String, (String, Option<String>)>,
) -> Vec<String> {
    if !listing.full {
        return listing.removed.clone();
    }
    let listed: HashSet<&str> = listing.changed.iter().map(|r| r.url.as_str()).collect();
    let mut gone: Vec<String> = known
        .keys()
        .filter(|url| !listed.contains(url.as_str()))
        .cloned()
        .collect();
    gone.sort();
    gone
}

// =============================================================================
// Unit Tests
// =============================================================================
