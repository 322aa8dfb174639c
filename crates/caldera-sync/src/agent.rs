//! # Sync Agent
//!
//! Main orchestrator for the sync engine. Consumes explicit sync requests
//! and runs push/pull passes against every configured account.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        SyncAgent Architecture                           │
//! │                                                                         │
//! │  SyncAgentHandle ──► mpsc<Command> ──┐        interval tick (auto mode) │
//! │                                      ▼              │                   │
//! │  ┌──────────────────────────────────────────────────┴───────────────┐  │
//! │  │                         SyncAgent                                │  │
//! │  │                                                                  │  │
//! │  │  • One pass at a time                                            │  │
//! │  │  • Cancellation stops a pass between operations                  │  │
//! │  │  • Keeps SyncStatus current and reports to the emitter           │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │              ┌────────────────┴───────────────┐                         │
//! │              ▼                                ▼                         │
//! │  ┌────────────────────────┐      ┌────────────────────────────┐        │
//! │  │   OutboxProcessor      │      │   InboundPuller            │        │
//! │  │                        │      │                            │        │
//! │  │ Pushes queued local    │      │ Delta-pulls server         │        │
//! │  │ changes                │      │ changes                    │        │
//! │  └────────────────────────┘      └────────────────────────────┘        │
//! │                                                                         │
//! │  REQUESTS:                                                              │
//! │  ─────────                                                              │
//! │  Normal     - push the queue, then pull calendars whose ctag moved      │
//! │  Expedited  - push the queue only, ignoring backoff windows             │
//! │  ForcedFull - drop sync tokens, rediscover, push, re-list everything    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use caldera_core::{Clock, ConflictOutcome, OperationStatus, SystemClock};
use caldera_db::{Database, Writer, WriterConfig};

use crate::client::ClientRegistry;
use crate::config::{SyncConfig, SyncMode};
use crate::error::{SyncError, SyncResult};
use crate::inbound::{InboundPuller, PullMode, PullReport};
use crate::outbox::{OutboxProcessor, PushReport};
use crate::reconcile::Reconciler;

/// Queued requests beyond this are rejected by `trigger`.
const REQUEST_BUFFER: usize = 16;

// =============================================================================
// Sync Status
// =============================================================================

/// Current sync status for external queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// A pass is running.
    pub is_syncing: bool,

    /// Last completed pass (RFC 3339).
    pub last_sync: Option<String>,

    /// Last error message (if any).
    pub last_error: Option<String>,

    /// Operations waiting to be pushed.
    pub pending_count: i64,

    /// Operations that exhausted their retries.
    pub failed_count: i64,

    /// Events parked for manual conflict resolution.
    pub conflict_count: i64,

    /// Sync mode.
    pub mode: SyncMode,
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus {
            is_syncing: false,
            last_sync: None,
            last_error: None,
            pending_count: 0,
            failed_count: 0,
            conflict_count: 0,
            mode: SyncMode::Auto,
        }
    }
}

// =============================================================================
// Event Emitter Trait
// =============================================================================

/// Receives sync notifications (implemented by the embedding UI).
pub trait SyncEventEmitter: Send + Sync {
    /// Emits a sync status change event.
    fn emit_status(&self, status: &SyncStatus);

    /// Emits a sync progress event.
    fn emit_progress(&self, pending: i64, synced: i64);

    /// Emits a sync error event.
    fn emit_error(&self, message: &str, retryable: bool);

    /// Emits the outcome of a conflict between a local and a server copy.
    fn emit_conflict(&self, event_id: &str, outcome: &ConflictOutcome);
}

/// Emitter that drops every notification.
pub struct NoOpEmitter;

impl SyncEventEmitter for NoOpEmitter {
    fn emit_status(&self, _status: &SyncStatus) {}
    fn emit_progress(&self, _pending: i64, _synced: i64) {}
    fn emit_error(&self, _message: &str, _retryable: bool) {}
    fn emit_conflict(&self, _event_id: &str, _outcome: &ConflictOutcome) {}
}

// =============================================================================
// Requests
// =============================================================================

/// What an external scheduler asks the agent to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRequest {
    /// Push the queue, then pull changed calendars.
    Normal,
    /// Push the queue only, skipping backoff windows.
    Expedited,
    /// Forget sync tokens, rediscover calendars and re-list everything.
    ForcedFull,
}

impl std::fmt::Display for SyncRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncRequest::Normal => write!(f, "normal"),
            SyncRequest::Expedited => write!(f, "expedited"),
            SyncRequest::ForcedFull => write!(f, "forced_full"),
        }
    }
}

/// Result of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassSummary {
    pub request: SyncRequest,
    pub push: PushReport,
    pub pull: PullReport,
    /// The pass did not run (offline mode).
    pub skipped: bool,
}

impl PassSummary {
    fn new(request: SyncRequest) -> Self {
        PassSummary {
            request,
            push: PushReport::default(),
            pull: PullReport::default(),
            skipped: false,
        }
    }
}

struct Command {
    request: SyncRequest,
    reply: Option<oneshot::Sender<SyncResult<PassSummary>>>,
}

// =============================================================================
// Sync Agent
// =============================================================================

/// Main sync agent that orchestrates all sync operations.
pub struct SyncAgent {
    /// Sync configuration.
    config: Arc<SyncConfig>,

    /// Database connection.
    db: Arc<Database>,

    /// Writer shared with the processors.
    writer: Writer,

    outbox: OutboxProcessor,

    inbound: InboundPuller,

    /// Current sync status.
    status: Arc<RwLock<SyncStatus>>,

    /// Event emitter for frontend notifications.
    emitter: Arc<dyn SyncEventEmitter>,

    clock: Arc<dyn Clock>,
}

impl SyncAgent {
    /// Creates a sync agent with the system clock and no emitter.
    pub fn new(config: SyncConfig, db: Arc<Database>) -> SyncResult<Self> {
        SyncAgentBuilder::new(config).with_database(db).build()
    }

    /// Returns the current sync status.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Runs a single pass in the caller's task.
    ///
    /// Only one pass runs at a time: a call made while another pass of this
    /// agent is in flight fails with `PassInProgress`. Two agents must not
    /// share one database, since each pass starts by reclaiming in-progress
    /// operations.
    ///
    /// ## Arguments
    /// * `request` - Kind of pass
    /// * `cancel` - Stops the pass between operations; the queue stays
    ///   resumable and sync tokens are only advanced for finished calendars
    pub async fn run_once(
        &self,
        request: SyncRequest,
        cancel: &CancellationToken,
    ) -> SyncResult<PassSummary> {
        if !self.config.is_sync_enabled() {
            debug!(%request, "Sync is disabled (mode: offline)");
            let mut summary = PassSummary::new(request);
            summary.skipped = true;
            return Ok(summary);
        }

        if !self.begin().await {
            debug!(%request, "Sync pass already running");
            return Err(SyncError::PassInProgress);
        }
        info!(%request, "Starting sync pass");

        let result = self.pass(request, cancel).await;
        let status = self.finish(result.as_ref().err()).await;
        self.emitter.emit_status(&status);

        if let Ok(ref summary) = result {
            info!(
                %request,
                pushed = summary.push.pushed,
                pulled = summary.pull.applied,
                removed = summary.pull.removed,
                conflicts = summary.push.conflicts + summary.pull.conflicts,
                cancelled = summary.push.cancelled || summary.pull.cancelled,
                "Sync pass complete"
            );
        }
        result
    }

    async fn pass(&self, request: SyncRequest, cancel: &CancellationToken) -> SyncResult<PassSummary> {
        let mut summary = PassSummary::new(request);

        if request == SyncRequest::ForcedFull {
            let cleared = self.db.calendars().clear_sync_tokens().await?;
            info!(calendars = cleared, "Cleared sync tokens");
        }

        summary.push = match self
            .outbox
            .run_pass(request == SyncRequest::Expedited, cancel)
            .await
        {
            Ok(report) => report,
            Err(err) => {
                // The processor has already reported credential failures.
                if !matches!(err, SyncError::AuthFailure(_)) {
                    self.emitter.emit_error(&err.to_string(), err.is_retryable());
                }
                return Err(err);
            }
        };

        if request != SyncRequest::Expedited && !summary.push.cancelled {
            let mode = match request {
                SyncRequest::ForcedFull => PullMode::Full,
                _ => PullMode::Normal,
            };
            summary.pull = match self.inbound.pull_all(mode, cancel).await {
                Ok(report) => report,
                Err(err) => {
                    self.emitter.emit_error(&err.to_string(), err.is_retryable());
                    return Err(err);
                }
            };
        }

        let extended = self.writer.refresh_horizon().await?;
        if extended > 0 {
            debug!(events = extended, "Extended materialization horizon");
        }
        Ok(summary)
    }

    /// Claims the syncing flag.
    async fn begin(&self) -> bool {
        let status = {
            let mut s = self.status.write().await;
            if s.is_syncing {
                return false;
            }
            s.is_syncing = true;
            s.clone()
        };
        self.emitter.emit_status(&status);
        true
    }

    async fn set_syncing(&self, syncing: bool) {
        let status = {
            let mut s = self.status.write().await;
            s.is_syncing = syncing;
            s.clone()
        };
        self.emitter.emit_status(&status);
    }

    /// Refreshes counters after a pass.
    async fn finish(&self, error: Option<&SyncError>) -> SyncStatus {
        let ops = self.db.pending_operations();
        let pending = ops.count_by_status(OperationStatus::Pending).await;
        let failed = ops.count_by_status(OperationStatus::Failed).await;
        let conflicts = self.db.events().list_conflicts().await.map(|c| c.len() as i64);

        let mut s = self.status.write().await;
        s.is_syncing = false;
        match (pending, failed, conflicts) {
            (Ok(pending), Ok(failed), Ok(conflicts)) => {
                s.pending_count = pending;
                s.failed_count = failed;
                s.conflict_count = conflicts;
            }
            _ => warn!("Failed to refresh sync counters"),
        }
        match error {
            Some(err) => {
                error!(?err, "Sync pass failed");
                s.last_error = Some(err.to_string());
            }
            None => {
                s.last_sync = Some(self.clock.now().to_rfc3339_opts(SecondsFormat::Secs, true));
                s.last_error = None;
            }
        }
        s.clone()
    }

    /// Spawns the agent's loop.
    ///
    /// In auto mode a normal pass runs at start and then on every poll
    /// interval; in every mode requests sent through the handle run in
    /// arrival order.
    pub fn start(self) -> SyncResult<SyncAgentHandle> {
        self.config.validate()?;

        info!(
            device_id = %self.config.device_id(),
            mode = %self.config.mode(),
            accounts = self.config.accounts.len(),
            "Starting sync agent"
        );

        let (tx, rx) = mpsc::channel(REQUEST_BUFFER);
        let cancel = CancellationToken::new();
        let status = self.status.clone();
        let task = tokio::spawn(self.run(rx, cancel.clone()));

        Ok(SyncAgentHandle {
            tx,
            cancel,
            status,
            task: Mutex::new(Some(task)),
        })
    }

    async fn run(self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let polls = self.config.mode().polls();
        let period = self.config.sync.poll_interval().max(std::time::Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                command = rx.recv() => {
                    let Some(command) = command else { break };
                    let result = self.run_once(command.request, &cancel).await;
                    match command.reply {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => {
                            if let Err(err) = result {
                                warn!(request = %command.request, ?err, "Requested sync pass failed");
                            }
                        }
                    }
                }

                _ = ticker.tick(), if polls => {
                    if let Err(err) = self.run_once(SyncRequest::Normal, &cancel).await {
                        warn!(?err, "Scheduled sync pass failed");
                    }
                }
            }
        }

        self.set_syncing(false).await;
        info!("Sync agent stopped");
    }
}

// =============================================================================
// Agent Handle (for external control)
// =============================================================================

/// Handle for controlling a running SyncAgent from outside.
pub struct SyncAgentHandle {
    tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    status: Arc<RwLock<SyncStatus>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncAgentHandle {
    /// Gets the current sync status.
    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Queues a pass without waiting for it.
    ///
    /// ## Errors
    /// `ChannelError` when the request buffer is full, `ShuttingDown`
    /// once the agent has stopped.
    pub fn trigger(&self, request: SyncRequest) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        self.tx
            .try_send(Command {
                request,
                reply: None,
            })
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => {
                    SyncError::ChannelError("sync request buffer full".into())
                }
                mpsc::error::TrySendError::Closed(_) => SyncError::ShuttingDown,
            })
    }

    /// Runs a pass and waits for its summary.
    pub async fn sync(&self, request: SyncRequest) -> SyncResult<PassSummary> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command {
                request,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SyncError::ShuttingDown)?;
        response.await.map_err(|_| SyncError::ShuttingDown)?
    }

    /// Signals the agent to stop and waits for the running pass to wind
    /// down. In-flight operations return to the queue.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(err) = task.await {
                error!(?err, "Sync agent task panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for creating SyncAgent with options.
pub struct SyncAgentBuilder {
    config: SyncConfig,
    db: Option<Arc<Database>>,
    emitter: Option<Arc<dyn SyncEventEmitter>>,
    clock: Option<Arc<dyn Clock>>,
    clients: Option<ClientRegistry>,
}

impl SyncAgentBuilder {
    /// Creates a new builder with the given config.
    pub fn new(config: SyncConfig) -> Self {
        SyncAgentBuilder {
            config,
            db: None,
            emitter: None,
            clock: None,
            clients: None,
        }
    }

    /// Sets the database connection.
    pub fn with_database(mut self, db: Arc<Database>) -> Self {
        self.db = Some(db);
        self
    }

    /// Sets the event emitter.
    pub fn with_emitter(mut self, emitter: Arc<dyn SyncEventEmitter>) -> Self {
        self.emitter = Some(emitter);
        self
    }

    /// Sets the clock (defaults to the system clock).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Uses prebuilt clients instead of building them from the accounts.
    pub fn with_clients(mut self, clients: ClientRegistry) -> Self {
        self.clients = Some(clients);
        self
    }

    /// Builds the SyncAgent.
    pub fn build(self) -> SyncResult<SyncAgent> {
        let db = self
            .db
            .ok_or_else(|| SyncError::InvalidConfig("Database required".into()))?;
        self.config.validate()?;

        let emitter = self.emitter.unwrap_or_else(|| Arc::new(NoOpEmitter));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let clients = Arc::new(match self.clients {
            Some(clients) => clients,
            None => ClientRegistry::from_config(&self.config)?,
        });

        let settings = self.config.sync.clone();
        let writer = db.writer(
            WriterConfig {
                horizon_days: settings.horizon_days,
            },
            clock.clone(),
        );
        let outbox = OutboxProcessor::new(
            db.clone(),
            writer.clone(),
            clients.clone(),
            settings.clone(),
            emitter.clone(),
            clock.clone(),
        );
        let reconciler = Reconciler::new(
            db.clone(),
            writer.clone(),
            settings.conflict_strategy,
            emitter.clone(),
        );
        let inbound = InboundPuller::new(
            db.clone(),
            writer.clone(),
            clients,
            reconciler,
            settings.batch_size as usize,
        );

        let status = SyncStatus {
            mode: self.config.sync.mode,
            ..Default::default()
        };

        Ok(SyncAgent {
            config: Arc::new(self.config),
            db,
            writer,
            outbox,
            inbound,
            status: Arc::new(RwLock::new(status)),
            emitter,
            clock,
        })
    }
}

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Emitter that keeps everything it receives.
    #[derive(Default)]
    pub struct RecordingEmitter {
        statuses: Mutex<Vec<SyncStatus>>,
        progress: Mutex<Vec<(i64, i64)>>,
        errors: Mutex<Vec<(String, bool)>>,
        conflicts: Mutex<Vec<(String, ConflictOutcome)>>,
    }

    impl RecordingEmitter {
        pub fn statuses(&self) -> Vec<SyncStatus> {
            self.statuses.lock().unwrap().clone()
        }

        pub fn progress(&self) -> Vec<(i64, i64)> {
            self.progress.lock().unwrap().clone()
        }

        pub fn errors(&self) -> Vec<(String, bool)> {
            self.errors.lock().unwrap().clone()
        }

        pub fn conflicts(&self) -> Vec<(String, ConflictOutcome)> {
            self.conflicts.lock().unwrap().clone()
        }
    }

    impl SyncEventEmitter for RecordingEmitter {
        fn emit_status(&self, status: &SyncStatus) {
            self.statuses.lock().unwrap().push(status.clone());
        }

        fn emit_progress(&self, pending: i64, synced: i64) {
            self.progress.lock().unwrap().push((pending, synced));
        }

        fn emit_error(&self, message: &str, retryable: bool) {
            self.errors.lock().unwrap().push((message.to_string(), retryable));
        }

        fn emit_conflict(&self, event_id: &str, outcome: &ConflictOutcome) {
            self.conflicts
                .lock()
                .unwrap()
                .push((event_id.to_string(), outcome.clone()));
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use chrono::{Duration, TimeZone, Utc};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use caldera_core::{MockClock, NewEvent, SyncState};
    use caldera_db::DbConfig;

    use super::testing::RecordingEmitter;
    use super::*;
    use crate::client::{CalDavClient, ClientSettings};

    struct Fixture {
        server: MockServer,
        db: Arc<Database>,
        clock: Arc<MockClock>,
        emitter: Arc<RecordingEmitter>,
        calendar_id: String,
    }

    async fn fixture() -> Fixture {
        let server = MockServer::start().await;
        let db = Arc::new(Database::new(DbConfig::in_memory()).await.unwrap());
        let clock = Arc::new(MockClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
        let calendar = db
            .calendars()
            .create_remote("acct", "Work", &format!("{}/cal/work/", server.uri()))
            .await
            .unwrap();
        Fixture {
            server,
            db,
            clock,
            emitter: Arc::new(RecordingEmitter::default()),
            calendar_id: calendar.id,
        }
    }

    fn config(mode: SyncMode) -> SyncConfig {
        let mut config = SyncConfig::new();
        config.sync.mode = mode;
        config
    }

    fn agent(f: &Fixture, config: SyncConfig, with_account: bool) -> SyncAgent {
        let mut clients = ClientRegistry::new();
        if with_account {
            let settings = ClientSettings {
                request_timeout: StdDuration::from_secs(5),
                rate_limit_retries: 0,
                ..ClientSettings::default()
            };
            clients.insert(
                "acct",
                CalDavClient::with_credentials(&f.server.uri(), "alice", "secret", settings).unwrap(),
            );
        }
        SyncAgentBuilder::new(config)
            .with_database(f.db.clone())
            .with_emitter(f.emitter.clone())
            .with_clock(f.clock.clone())
            .with_clients(clients)
            .build()
            .unwrap()
    }

    async fn queue_create(f: &Fixture, uid: &str) -> String {
        let writer = f.db.writer(WriterConfig::default(), f.clock.clone());
        let start = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        writer
            .create(NewEvent::new(&f.calendar_id, "Standup", start, start + Duration::minutes(15)).uid(uid))
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_sync_status_default() {
        let status = SyncStatus::default();
        assert!(!status.is_syncing);
        assert_eq!(status.pending_count, 0);
        assert!(status.last_sync.is_none());
    }

    #[test]
    fn test_builder_requires_database() {
        let result = SyncAgentBuilder::new(SyncConfig::new()).build();
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_expedited_pass_pushes_without_pulling() {
        let f = fixture().await;
        Mock::given(method("PUT"))
            .and(path("/cal/work/standup-1.ics"))
            .respond_with(ResponseTemplate::new(201).insert_header("ETag", "\"s1\""))
            .expect(1)
            .mount(&f.server)
            .await;
        let id = queue_create(&f, "standup-1").await;

        let agent = agent(&f, config(SyncMode::Manual), true);
        let summary = agent
            .run_once(SyncRequest::Expedited, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.push.pushed, 1);
        assert_eq!(summary.pull, PullReport::default());
        let requests = f.server.received_requests().await.unwrap();
        assert!(requests.iter().all(|r| r.method.as_str() == "PUT"));

        let event = f.db.events().get(&id).await.unwrap().unwrap();
        assert_eq!(event.sync_state, SyncState::Synced);
        assert_eq!(event.etag.as_deref(), Some("\"s1\""));

        let status = agent.status().await;
        assert!(!status.is_syncing);
        assert_eq!(status.pending_count, 0);
        assert_eq!(status.last_sync.as_deref(), Some("2026-03-01T09:00:00Z"));
    }

    #[tokio::test]
    async fn test_overlapping_pass_is_refused() {
        let f = fixture().await;
        queue_create(&f, "overlap-1").await;

        let agent = agent(&f, config(SyncMode::Manual), true);
        agent.status.write().await.is_syncing = true;

        let result = agent
            .run_once(SyncRequest::Expedited, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SyncError::PassInProgress)));
        assert!(f.server.received_requests().await.unwrap().is_empty());
        let op = f.db.pending_operations().list().await.unwrap().remove(0);
        assert_eq!(op.status, OperationStatus::Pending);
        assert!(agent.status().await.is_syncing);
    }

    #[tokio::test]
    async fn test_offline_mode_skips_passes() {
        let f = fixture().await;
        queue_create(&f, "offline-1").await;

        let agent = agent(&f, config(SyncMode::Offline), true);
        let summary = agent
            .run_once(SyncRequest::Normal, &CancellationToken::new())
            .await
            .unwrap();

        assert!(summary.skipped);
        assert!(f.server.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_forced_full_discards_sync_tokens() {
        let f = fixture().await;
        f.db
            .calendars()
            .update_sync_state(&f.calendar_id, Some("c1"), Some("t1"))
            .await
            .unwrap();

        let agent = agent(&f, config(SyncMode::Manual), false);
        agent
            .run_once(SyncRequest::ForcedFull, &CancellationToken::new())
            .await
            .unwrap();

        let calendar = f.db.calendars().require(&f.calendar_id).await.unwrap();
        assert!(calendar.sync_token.is_none());
        assert!(calendar.ctag.is_none());
    }

    #[tokio::test]
    async fn test_push_failure_is_recorded_in_status() {
        let f = fixture().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&f.server)
            .await;
        queue_create(&f, "denied-1").await;

        let agent = agent(&f, config(SyncMode::Manual), true);
        let result = agent
            .run_once(SyncRequest::Normal, &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SyncError::AuthFailure(_))));
        let status = agent.status().await;
        assert!(status.last_error.is_some());
        assert_eq!(status.pending_count, 1);
        // Reported once, by the processor.
        assert_eq!(f.emitter.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_handle_runs_requests_and_shuts_down() {
        let f = fixture().await;
        let handle = agent(&f, config(SyncMode::Manual), false).start().unwrap();

        let summary = handle.sync(SyncRequest::Normal).await.unwrap();
        assert_eq!(summary.request, SyncRequest::Normal);
        assert!(handle.status().await.last_sync.is_some());
        assert!(f.emitter.statuses().len() >= 2);

        handle.shutdown().await;
        assert!(!handle.is_running());
        assert!(matches!(
            handle.trigger(SyncRequest::Expedited),
            Err(SyncError::ShuttingDown)
        ));
        assert!(matches!(
            handle.sync(SyncRequest::Normal).await,
            Err(SyncError::ShuttingDown)
        ));
    }
}
