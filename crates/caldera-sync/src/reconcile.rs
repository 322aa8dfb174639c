//! # Conflict Application
//!
//! Turns a [`ConflictOutcome`] into Writer calls.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  push 412/409 ─┐                                                        │
//! │                ├──► Reconciler::settle(event, server copy?)             │
//! │  pull collision┘          │                                             │
//! │                           ▼                                             │
//! │                conflict::resolve(local, remote, strategy)               │
//! │                           │                                             │
//! │   ServerVersionKept ──────► apply_remote(overwrite)                     │
//! │   LocalVersionPushed ─────► force_push(server url, server etag)         │
//! │   LocalDeleted ───────────► force_push (delete wins) / discard_local    │
//! │   MarkedForManual ────────► mark_conflict(true), queue held back        │
//! │   EventNotFound / Error ──► emit_error                                  │
//! │                                                                         │
//! │  Every outcome reaches the emitter.                                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tracing::{info, warn};

use caldera_core::conflict;
use caldera_core::{ConflictOutcome, ConflictStrategy, RemoteEvent};
use caldera_db::{Database, Writer};

use crate::agent::SyncEventEmitter;
use crate::error::SyncResult;

/// Applies conflict decisions for one strategy.
#[derive(Clone)]
pub struct Reconciler {
    db: Arc<Database>,
    writer: Writer,
    strategy: ConflictStrategy,
    emitter: Arc<dyn SyncEventEmitter>,
}

impl Reconciler {
    pub fn new(
        db: Arc<Database>,
        writer: Writer,
        strategy: ConflictStrategy,
        emitter: Arc<dyn SyncEventEmitter>,
    ) -> Self {
        Reconciler {
            db,
            writer,
            strategy,
            emitter,
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Settles a collision between a local event and the server copy.
    ///
    /// ## Arguments
    /// * `event_id` - Local event (an exception resolves through its master)
    /// * `calendar_id` - Calendar the server copy lives in
    /// * `remote` - Current server copy, `None` if the server no longer has it
    ///
    /// ## Returns
    /// The outcome that was applied. Failure outcomes are returned, not
    /// raised; they have already been reported to the emitter.
    pub async fn settle(
        &self,
        event_id: &str,
        calendar_id: &str,
        remote: Option<RemoteEvent>,
    ) -> SyncResult<ConflictOutcome> {
        let events = self.db.events();
        let mut local = events.get(event_id).await?;
        if let Some(master_id) = local.as_ref().and_then(|e| e.original_event_id.clone()) {
            local = events.get(&master_id).await?;
        }

        let version = remote.as_ref().map(RemoteEvent::version);
        let outcome = conflict::resolve(local.as_ref(), version.as_ref(), self.strategy);

        let local = match local {
            Some(event) if outcome.is_forward_progress() => event,
            _ => {
                let message = match &outcome {
                    ConflictOutcome::Error(message) => message.clone(),
                    _ => format!("event {} vanished during conflict resolution", event_id),
                };
                warn!(event_id = %event_id, %message, "Conflict could not be resolved");
                self.emitter.emit_conflict(event_id, &outcome);
                self.emitter.emit_error(&message, false);
                return Ok(outcome);
            }
        };

        match (&outcome, remote) {
            (ConflictOutcome::ServerVersionKept, Some(server)) => {
                self.writer.apply_remote(calendar_id, server, true).await?;
            }
            (ConflictOutcome::ServerVersionKept, None) => {
                self.writer.discard_local(&local.id).await?;
            }
            (ConflictOutcome::LocalVersionPushed, server) => {
                let (url, etag) = identity(server);
                self.writer.force_push(&local.id, url, etag).await?;
            }
            (ConflictOutcome::LocalDeleted, Some(server)) if local.is_deleted() => {
                // Our delete wins; retarget it at the server's current version.
                let (url, etag) = identity(Some(server));
                self.writer.force_push(&local.id, url, etag).await?;
            }
            (ConflictOutcome::LocalDeleted, _) => {
                self.writer.discard_local(&local.id).await?;
            }
            (ConflictOutcome::MarkedForManualResolution, _) => {
                self.writer.mark_conflict(&local.id, true).await?;
            }
            (ConflictOutcome::EventNotFound, _) | (ConflictOutcome::Error(_), _) => {}
        }

        info!(
            event_id = %local.id,
            strategy = %self.strategy,
            outcome = ?outcome,
            "Resolved sync conflict"
        );
        self.emitter.emit_conflict(&local.id, &outcome);
        Ok(outcome)
    }
}

fn identity(remote: Option<RemoteEvent>) -> (Option<String>, Option<String>) {
    match remote {
        Some(server) => (Some(server.href), server.etag),
        None => (None, None),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use caldera_core::{EventPatch, MockClock, OperationKind, RemoteComponent, SyncState};
    use caldera_db::{ApplyOutcome, DbConfig, WriterConfig};

    use super::*;
    use crate::agent::testing::RecordingEmitter;

    const WORK_URL: &str = "https://dav.example.com/cal/work/";

    struct Fixture {
        db: Arc<Database>,
        writer: Writer,
        calendar_id: String,
        emitter: Arc<RecordingEmitter>,
    }

    async fn fixture() -> Fixture {
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let clock = Arc::new(MockClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
        let writer = db.writer(WriterConfig::default(), clock);
        let calendar = db
            .calendars()
            .create_remote("acct", "Work", WORK_URL)
            .await
            .unwrap();
        Fixture {
            db,
            writer,
            calendar_id: calendar.id,
            emitter: Arc::new(RecordingEmitter::default()),
        }
    }

    fn reconciler(f: &Fixture, strategy: ConflictStrategy) -> Reconciler {
        Reconciler::new(f.db.clone(), f.writer.clone(), strategy, f.emitter.clone())
    }

    fn server_copy(uid: &str, summary: &str, etag: &str) -> RemoteEvent {
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        RemoteEvent {
            uid: uid.to_string(),
            href: format!("{}{}.ics", WORK_URL, uid),
            etag: Some(etag.to_string()),
            master: Some(RemoteComponent {
                summary: summary.to_string(),
                description: None,
                location: None,
                start,
                end: start + Duration::hours(1),
                all_day: false,
                timezone: None,
                rrule: None,
                exdates: vec![],
                rdates: vec![],
                sequence: 0,
                recurrence_id: None,
                last_modified: Some(start),
            }),
            overrides: vec![],
        }
    }

    /// A synced event with an unpushed local edit.
    async fn edited_event(f: &Fixture) -> String {
        let applied = f
            .writer
            .apply_remote(&f.calendar_id, server_copy("u1", "Original", "\"1\""), false)
            .await
            .unwrap();
        let id = match applied {
            ApplyOutcome::Applied { event_id, .. } => event_id,
            other => panic!("unexpected {:?}", other),
        };
        f.writer
            .update(&id, EventPatch::default().summary("Local edit"))
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn test_server_wins_overwrites_and_clears_queue() {
        let f = fixture().await;
        let id = edited_event(&f).await;

        let outcome = reconciler(&f, ConflictStrategy::ServerWins)
            .settle(&id, &f.calendar_id, Some(server_copy("u1", "Server edit", "\"2\"")))
            .await
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::ServerVersionKept);
        let event = f.db.events().get(&id).await.unwrap().unwrap();
        assert_eq!(event.summary, "Server edit");
        assert_eq!(event.sync_state, SyncState::Synced);
        assert!(f.db.pending_operations().get_by_event(&id).await.unwrap().is_none());
        assert_eq!(f.emitter.conflicts().len(), 1);
    }

    #[tokio::test]
    async fn test_local_wins_rearms_push_with_server_etag() {
        let f = fixture().await;
        let id = edited_event(&f).await;

        let outcome = reconciler(&f, ConflictStrategy::LocalWins)
            .settle(&id, &f.calendar_id, Some(server_copy("u1", "Server edit", "\"2\"")))
            .await
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::LocalVersionPushed);
        let event = f.db.events().get(&id).await.unwrap().unwrap();
        assert_eq!(event.summary, "Local edit");
        assert_eq!(event.etag.as_deref(), Some("\"2\""));
        let op = f.db.pending_operations().get_by_event(&id).await.unwrap().unwrap();
        assert_eq!(op.kind, OperationKind::Update);
    }

    #[tokio::test]
    async fn test_manual_flags_event_and_holds_queue() {
        let f = fixture().await;
        let id = edited_event(&f).await;

        let outcome = reconciler(&f, ConflictStrategy::Manual)
            .settle(&id, &f.calendar_id, Some(server_copy("u1", "Server edit", "\"2\"")))
            .await
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::MarkedForManualResolution);
        assert!(f.db.events().get(&id).await.unwrap().unwrap().has_conflict);
        let eligible = f
            .db
            .pending_operations()
            .eligible(Utc::now() + Duration::days(1), 10, true)
            .await
            .unwrap();
        assert!(eligible.is_empty());
    }

    #[tokio::test]
    async fn test_server_deletion_discards_local_under_server_wins() {
        let f = fixture().await;
        let id = edited_event(&f).await;

        let outcome = reconciler(&f, ConflictStrategy::ServerWins)
            .settle(&id, &f.calendar_id, None)
            .await
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::LocalDeleted);
        assert!(f.db.events().get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_event_is_surfaced() {
        let f = fixture().await;

        let outcome = reconciler(&f, ConflictStrategy::ServerWins)
            .settle("nope", &f.calendar_id, None)
            .await
            .unwrap();

        assert_eq!(outcome, ConflictOutcome::EventNotFound);
        assert!(outcome.is_failure());
        assert_eq!(f.emitter.errors().len(), 1);
    }
}
