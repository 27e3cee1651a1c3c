use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock reading taken once, advanced by monotonic elapsed time.
///
/// Later system clock adjustments do not move it, so elapsed-time bounds
/// measured against it are immune to clock jumps.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    anchor_wall: DateTime<Utc>,
    anchor: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> DateTime<Utc> {
        self.anchor_wall + crate::config::to_chrono(self.anchor.elapsed())
    }
}

/// Settable clock for tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    #[test]
    fn manual_clock_advances_shared_handle() {
        let start = Utc.timestamp_millis_opt(1_700_000_000_000).single().expect("ts");
        let clock = ManualClock::new(start);
        let handle = clock.clone();
        handle.advance(Duration::seconds(20));
        assert_eq!(clock.now(), start + Duration::seconds(20));
        clock.set(start);
        assert_eq!(handle.now(), start);
    }

    #[tokio::test]
    async fn monotonic_clock_never_goes_backwards() {
        let clock = MonotonicClock::new();
        let first = clock.now();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(clock.now() >= first);
    }
}
