//! # Clock
//!
//! Time source abstraction.
//!
//! Everything that compares against "now" (retry eligibility, the
//! materialization horizon, `updated_at` stamps) takes a [`Clock`] so tests
//! can pin and advance time without sleeping.
//!
//! ```text
//! ┌──────────────┐      ┌──────────────┐
//! │ SystemClock  │      │  MockClock   │
//! │ Utc::now()   │      │ Arc<Mutex<>> │
//! └──────┬───────┘      └──────┬───────┘
//!        └─────────┬───────────┘
//!                  ▼
//!          Arc<dyn Clock> shared by Writer + queue processor
//! ```

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::types::to_second;

/// Source of the current instant.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current instant, truncated to whole seconds.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        to_second(Utc::now())
    }
}

/// Manually driven clock for tests.
///
/// Clones share the same instant.
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(to_second(start))),
        }
    }

    /// Jumps to an absolute instant.
    pub fn set(&self, instant: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard = to_second(instant);
    }

    /// Moves time forward.
    pub fn advance(&self, by: Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_mock_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = MockClock::new(start);
        let shared = clock.clone();

        clock.advance(Duration::seconds(90));
        assert_eq!(shared.now(), start + Duration::seconds(90));

        clock.set(start);
        assert_eq!(shared.now(), start);
    }

    #[test]
    fn test_system_clock_has_no_subsecond_part() {
        assert_eq!(SystemClock.now().timestamp_subsec_nanos(), 0);
    }
}
