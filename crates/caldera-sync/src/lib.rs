//! # caldera-sync: CalDAV Sync Engine for Caldera
//!
//! This crate provides the synchronization layer for Caldera, keeping the
//! local store usable offline and reconciling it with CalDAV servers in
//! the background.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Agent Architecture                          │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                      SyncAgent (Main Orchestrator)               │  │
//! │  │                                                                  │  │
//! │  │  Spawned as a Tokio task by the embedding app                   │  │
//! │  │  Runs one pass per SyncRequest (or per poll tick in auto mode)   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ OutboxProcessor│  │  CalDavClient  │  │  InboundPuller         │    │
//! │  │                │  │                │  │                        │    │
//! │  │ Reads pending  │  │ Discovery,     │  │ ctag check, sync-      │    │
//! │  │ operations     │─►│ delta sync,    │◄─│ collection, multiget,  │    │
//! │  │ Bounded worker │  │ PUT / DELETE,  │  │ apply_remote           │    │
//! │  │ pool           │  │ Digest auth    │  │                        │    │
//! │  └───────┬────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │          │                                           │                  │
//! │          └──────────────► Reconciler ◄───────────────┘                  │
//! │                     (412/409 or pull collision)                         │
//! │                                                                         │
//! │  STATUS EVENTS (to the embedding UI):                                   │
//! │  • emit_status   - pass started/finished, counters                      │
//! │  • emit_progress - pending vs pushed                                    │
//! │  • emit_error    - auth failures, exhausted retries, pass errors        │
//! │  • emit_conflict - every conflict outcome                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//! - [`agent`] - Main `SyncAgent` orchestrator and its handle
//! - [`client`] - CalDAV HTTP client and per-account registry
//! - [`config`] - Sync configuration (mode, accounts, retry knobs)
//! - [`digest`] - HTTP Digest challenge responder
//! - [`error`] - Sync error types
//! - [`ical`] - iCalendar parsing and rendering
//! - [`inbound`] - Delta pull of server changes
//! - [`outbox`] - Pending operation processor
//! - [`protocol`] - WebDAV/CalDAV XML bodies and multistatus parsing
//! - [`reconcile`] - Applies conflict decisions
//!
//! ## Usage
//!
//! ```rust,ignore
//! use caldera_sync::{SyncAgent, SyncConfig, SyncRequest};
//! use caldera_db::Database;
//!
//! // Create sync configuration
//! let config = SyncConfig::load_or_default(None);
//!
//! // Create and start sync agent
//! let handle = SyncAgent::new(config, database)?.start()?;
//!
//! // Ask for a pass after a local edit
//! handle.trigger(SyncRequest::Expedited)?;
//!
//! // Query sync status
//! let status = handle.status().await;
//! println!("Pending: {}", status.pending_count);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod agent;
pub mod client;
pub mod config;
pub mod digest;
pub mod error;
pub mod ical;
pub mod inbound;
pub mod outbox;
pub mod protocol;
pub mod reconcile;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{
    NoOpEmitter, PassSummary, SyncAgent, SyncAgentBuilder, SyncAgentHandle, SyncEventEmitter,
    SyncRequest, SyncStatus,
};
pub use client::{CalDavClient, ClientRegistry, ClientSettings, DiscoveredCalendar, Precondition};
pub use config::{AccountConfig, DeviceConfig, SyncConfig, SyncMode, SyncSettings};
pub use error::{SyncError, SyncResult};
pub use inbound::{InboundPuller, PullMode, PullReport};
pub use outbox::{OutboxProcessor, PushReport};
pub use reconcile::Reconciler;
