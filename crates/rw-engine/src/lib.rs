//! Polling and reconciliation engine for long-running search runs and the
//! per-row audits triggered inside them.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod audit;
pub mod clock;
pub mod config;
pub mod poller;
pub mod watcher;

pub use audit::{
    AuditAttempt, AuditBook, AuditCompletion, AuditEvent, AuditState, AuditStatus, AuditTracker,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::EngineConfig;
pub use poller::{
    FetchTicket, PollDecision, PollPhase, PollSession, RowObserver, RunPoller, RunView,
};
pub use watcher::{RunWatcher, WatchError};

// Critical sections never panic mid-update, so a poisoned guard is still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
