//! Wall-clock access. Admission control reads the local time of day through a
//! [`Clock`] so tests can drive the overnight window with a simulated clock.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Local, Utc};
use parking_lot::Mutex;

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// `at` shifted forward by a fractional number of minutes, saturating at `at`
/// when the offset cannot be represented.
#[must_use]
pub fn add_minutes(at: DateTime<FixedOffset>, minutes: f64) -> DateTime<FixedOffset> {
    #[allow(clippy::cast_possible_truncation)]
    let millis = (minutes.max(0.0) * 60_000.0).round() as i64;
    ChronoDuration::try_milliseconds(millis)
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(at)
}

/// Source of the current local time.
pub trait Clock: Send + Sync {
    /// Current time with the local UTC offset attached.
    fn now(&self) -> DateTime<FixedOffset>;

    /// Current time in UTC, used for persisted timestamps.
    fn now_utc(&self) -> DateTime<Utc> {
        self.now().with_timezone(&Utc)
    }
}

/// Clock backed by the operating system's local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }
}

/// Settable clock for tests and dry runs.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<FixedOffset>>>,
}

impl ManualClock {
    /// Start the clock at the given instant.
    #[must_use]
    pub fn new(start: DateTime<FixedOffset>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Start the clock at `hour:00` UTC on an arbitrary fixed date.
    ///
    /// Hours above 23 are clamped.
    #[must_use]
    pub fn at_hour(hour: u32) -> Self {
        let base = DateTime::parse_from_rfc3339("2026-01-15T00:00:00+00:00")
            .unwrap_or_else(|_| Utc::now().fixed_offset());
        Self::new(base + ChronoDuration::hours(i64::from(hour.min(23))))
    }

    /// Jump to an absolute instant.
    pub fn set(&self, at: DateTime<FixedOffset>) {
        *self.current.lock() = at;
    }

    /// Move the clock forward.
    pub fn advance(&self, by: ChronoDuration) {
        let mut current = self.current.lock();
        *current = *current + by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.current.lock()
    }
}
