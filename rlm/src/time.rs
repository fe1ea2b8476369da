use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

pub type Timestamp = DateTime<Utc>;

/// Source of wall-clock time for lease arithmetic.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock pinned to a starting instant that only moves when told to.
///
/// Used to drive TTL expiry deterministically ("t=5", "t=31").
#[derive(Debug)]
pub struct ManualClock {
    epoch: Timestamp,
    offset_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(epoch: Timestamp) -> Self {
        Self {
            epoch,
            offset_ms: AtomicI64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.offset_ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    /// Moves the clock to `epoch + minutes`.
    pub fn set_minutes(&self, minutes: i64) {
        self.offset_ms
            .store(Duration::minutes(minutes).num_milliseconds(), Ordering::SeqCst);
    }

    pub fn epoch(&self) -> Timestamp {
        self.epoch
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.epoch + Duration::milliseconds(self.offset_ms.load(Ordering::SeqCst))
    }
}

/// Millisecond encoding used by persistent stores.
pub(crate) fn to_millis(ts: Timestamp) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Timestamp {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}
