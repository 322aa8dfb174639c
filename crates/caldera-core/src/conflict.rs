//! # Conflict Resolver
//!
//! Pure decision function over (local, remote, strategy).
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ local Event  │   │ RemoteVersion │   │  Strategy    │
//! └──────┬───────┘   └───────┬───────┘   └──────┬───────┘
//!        └──────────────┬────┴──────────────────┘
//!                       ▼
//!                  resolve(..)
//!                       │
//!        ┌──────────────┼──────────────────────────┐
//!        ▼              ▼                          ▼
//!   forward progress                          failure
//!   ServerVersionKept                         EventNotFound
//!   LocalVersionPushed                        Error(message)
//!   LocalDeleted
//!   MarkedForManualResolution
//! ```
//!
//! The resolver only decides. Applying the outcome (fetching the server
//! copy, re-queueing the push, flagging the event) is the caller's job.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::{Event, SyncState};

// =============================================================================
// Strategy
// =============================================================================

/// How divergent local and remote copies are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// The server copy always wins.
    #[default]
    ServerWins,
    /// The local copy is pushed over the server copy.
    LocalWins,
    /// The most recently modified copy wins.
    NewestWins,
    /// Flag the event and apply nothing.
    Manual,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictStrategy::ServerWins => "server_wins",
            ConflictStrategy::LocalWins => "local_wins",
            ConflictStrategy::NewestWins => "newest_wins",
            ConflictStrategy::Manual => "manual",
        };
        f.write_str(name)
    }
}

impl FromStr for ConflictStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "server_wins" | "server" => Ok(ConflictStrategy::ServerWins),
            "local_wins" | "local" => Ok(ConflictStrategy::LocalWins),
            "newest_wins" | "newest" => Ok(ConflictStrategy::NewestWins),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(format!("unknown conflict strategy '{}'", other)),
        }
    }
}

// =============================================================================
// Inputs and Outcomes
// =============================================================================

/// What is known about the server copy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RemoteVersion {
    pub etag: Option<String>,
    /// `LAST-MODIFIED` of the server copy.
    pub last_modified: Option<DateTime<Utc>>,
    pub sequence: Option<i64>,
}

/// Closed set of resolution outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(tag = "outcome", content = "message", rename_all = "snake_case")]
pub enum ConflictOutcome {
    /// Local changes are discarded in favor of the server copy.
    ServerVersionKept,
    /// The local copy is pushed, overwriting the server.
    LocalVersionPushed,
    /// The local copy is removed.
    LocalDeleted,
    /// The event is flagged; nothing is applied.
    MarkedForManualResolution,
    /// The local event no longer exists.
    EventNotFound,
    /// The conflict could not be decided.
    Error(String),
}

impl ConflictOutcome {
    /// Returns true for outcomes that move sync forward.
    pub fn is_forward_progress(&self) -> bool {
        matches!(
            self,
            ConflictOutcome::ServerVersionKept
                | ConflictOutcome::LocalVersionPushed
                | ConflictOutcome::LocalDeleted
                | ConflictOutcome::MarkedForManualResolution
        )
    }

    /// Returns true for outcomes that must be surfaced to the user.
    pub fn is_failure(&self) -> bool {
        !self.is_forward_progress()
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Decides how a conflict is settled.
///
/// ## Arguments
/// * `local` - Local master event, `None` if it vanished
/// * `remote` - Server copy, `None` if the server no longer has it
/// * `strategy` - Configured strategy
///
/// NewestWins compares `local.updated_at` with `remote.last_modified`. A tie,
/// or a server copy without a timestamp, keeps the server version.
pub fn resolve(
    local: Option<&Event>,
    remote: Option<&RemoteVersion>,
    strategy: ConflictStrategy,
) -> ConflictOutcome {
    let local = match local {
        Some(event) => event,
        None => return ConflictOutcome::EventNotFound,
    };

    if local.is_exception() {
        return ConflictOutcome::Error(format!(
            "event {} is an exception; resolve its master {}",
            local.id,
            local.original_event_id.as_deref().unwrap_or_default()
        ));
    }

    if strategy == ConflictStrategy::Manual {
        return ConflictOutcome::MarkedForManualResolution;
    }

    let remote = match remote {
        Some(r) => r,
        None => return resolve_missing_remote(local, strategy),
    };

    // A local delete that wins is still a local delete.
    let local_wins = if local.sync_state == SyncState::PendingDelete {
        ConflictOutcome::LocalDeleted
    } else {
        ConflictOutcome::LocalVersionPushed
    };

    match strategy {
        ConflictStrategy::ServerWins => ConflictOutcome::ServerVersionKept,
        ConflictStrategy::LocalWins => local_wins,
        ConflictStrategy::NewestWins => match remote.last_modified {
            Some(remote_modified) if local.updated_at > remote_modified => local_wins,
            _ => ConflictOutcome::ServerVersionKept,
        },
        ConflictStrategy::Manual => ConflictOutcome::MarkedForManualResolution,
    }
}

fn resolve_missing_remote(local: &Event, strategy: ConflictStrategy) -> ConflictOutcome {
    if local.sync_state == SyncState::PendingDelete {
        return ConflictOutcome::LocalDeleted;
    }
    match strategy {
        ConflictStrategy::ServerWins => ConflictOutcome::LocalDeleted,
        ConflictStrategy::LocalWins => ConflictOutcome::LocalVersionPushed,
        ConflictStrategy::NewestWins if local.sync_state.has_local_changes() => {
            ConflictOutcome::LocalVersionPushed
        }
        ConflictStrategy::NewestWins => ConflictOutcome::LocalDeleted,
        ConflictStrategy::Manual => ConflictOutcome::MarkedForManualResolution,
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn local(state: SyncState, updated_at: DateTime<Utc>) -> Event {
        Event {
            id: "evt-1".into(),
            uid: "uid-1".into(),
            calendar_id: "cal-1".into(),
            summary: "Local".into(),
            description: None,
            location: None,
            start: updated_at,
            end: updated_at + Duration::hours(1),
            all_day: false,
            timezone: None,
            rrule: None,
            exdates: vec![],
            rdates: vec![],
            sequence: 1,
            sync_state: state,
            remote_url: Some("/cal/a.ics".into()),
            etag: Some("\"1\"".into()),
            original_event_id: None,
            original_instance_time: None,
            has_conflict: false,
            created_at: updated_at,
            updated_at,
        }
    }

    fn remote(last_modified: Option<DateTime<Utc>>) -> RemoteVersion {
        RemoteVersion {
            etag: Some("\"2\"".into()),
            last_modified,
            sequence: Some(2),
        }
    }

    #[test]
    fn test_missing_local_is_not_found() {
        let outcome = resolve(None, Some(&remote(None)), ConflictStrategy::LocalWins);
        assert_eq!(outcome, ConflictOutcome::EventNotFound);
        assert!(outcome.is_failure());
    }

    #[test]
    fn test_fixed_strategies() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ev = local(SyncState::PendingUpdate, t);
        let r = remote(Some(t));

        assert_eq!(resolve(Some(&ev), Some(&r), ConflictStrategy::ServerWins), ConflictOutcome::ServerVersionKept);
        assert_eq!(resolve(Some(&ev), Some(&r), ConflictStrategy::LocalWins), ConflictOutcome::LocalVersionPushed);
        assert_eq!(
            resolve(Some(&ev), Some(&r), ConflictStrategy::Manual),
            ConflictOutcome::MarkedForManualResolution
        );
    }

    #[test]
    fn test_newest_wins_compares_timestamps() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ev = local(SyncState::PendingUpdate, t);

        let older = remote(Some(t - Duration::minutes(5)));
        let newer = remote(Some(t + Duration::minutes(5)));
        let same = remote(Some(t));

        assert_eq!(resolve(Some(&ev), Some(&older), ConflictStrategy::NewestWins), ConflictOutcome::LocalVersionPushed);
        assert_eq!(resolve(Some(&ev), Some(&newer), ConflictStrategy::NewestWins), ConflictOutcome::ServerVersionKept);
        assert_eq!(resolve(Some(&ev), Some(&same), ConflictStrategy::NewestWins), ConflictOutcome::ServerVersionKept);
        assert_eq!(
            resolve(Some(&ev), Some(&remote(None)), ConflictStrategy::NewestWins),
            ConflictOutcome::ServerVersionKept
        );
    }

    #[test]
    fn test_remote_gone() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let changed = local(SyncState::PendingUpdate, t);
        let clean = local(SyncState::Synced, t);
        let deleted = local(SyncState::PendingDelete, t);

        assert_eq!(resolve(Some(&changed), None, ConflictStrategy::ServerWins), ConflictOutcome::LocalDeleted);
        assert_eq!(resolve(Some(&changed), None, ConflictStrategy::NewestWins), ConflictOutcome::LocalVersionPushed);
        assert_eq!(resolve(Some(&clean), None, ConflictStrategy::NewestWins), ConflictOutcome::LocalDeleted);
        assert_eq!(resolve(Some(&deleted), None, ConflictStrategy::LocalWins), ConflictOutcome::LocalDeleted);
    }

    #[test]
    fn test_local_delete_against_changed_server() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let deleted = local(SyncState::PendingDelete, t);
        let r = remote(Some(t - Duration::minutes(1)));

        assert_eq!(resolve(Some(&deleted), Some(&r), ConflictStrategy::LocalWins), ConflictOutcome::LocalDeleted);
        assert_eq!(resolve(Some(&deleted), Some(&r), ConflictStrategy::NewestWins), ConflictOutcome::LocalDeleted);
        assert_eq!(resolve(Some(&deleted), Some(&r), ConflictStrategy::ServerWins), ConflictOutcome::ServerVersionKept);
    }

    #[test]
    fn test_exception_is_error() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut ev = local(SyncState::PendingUpdate, t);
        ev.original_event_id = Some("master".into());

        let outcome = resolve(Some(&ev), Some(&remote(None)), ConflictStrategy::ServerWins);
        assert!(matches!(outcome, ConflictOutcome::Error(_)));
        assert!(outcome.is_failure());
    }

    #[test]
    fn test_strategy_parse_roundtrip() {
        for s in [
            ConflictStrategy::ServerWins,
            ConflictStrategy::LocalWins,
            ConflictStrategy::NewestWins,
            ConflictStrategy::Manual,
        ] {
            assert_eq!(s.to_string().parse::<ConflictStrategy>().unwrap(), s);
        }
        assert_eq!("newest-wins".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::NewestWins);
        assert!("coin_flip".parse::<ConflictStrategy>().is_err());
    }
}
