use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::lock;
use crate::poller::RowObserver;
use chrono::{DateTime, Utc};
use rw_core::{AuditFailure, ResultRow, RunSource, TriggerOutcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditState {
    Idle,
    Loading,
    Error,
}

impl AuditState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditState::Idle => "idle",
            AuditState::Loading => "loading",
            AuditState::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditAttempt {
    pub attempt: u64,
    pub started_at: DateTime<Utc>,
    pub failure: Option<AuditFailure>,
}

impl AuditAttempt {
    pub fn state(&self) -> AuditState {
        if self.failure.is_some() {
            AuditState::Error
        } else {
            AuditState::Loading
        }
    }
}

/// Lookup result for one row; rows with no recorded attempt are idle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditStatus {
    pub state: AuditState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<AuditFailure>,
}

impl AuditStatus {
    pub fn idle() -> Self {
        Self {
            state: AuditState::Idle,
            started_at: None,
            failure: None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.failure.as_ref().map(AuditFailure::message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuditCompletion {
    pub started_at: DateTime<Utc>,
    pub first_data_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent {
    Started {
        row_id: String,
        attempt: u64,
        at: DateTime<Utc>,
    },
    Completed {
        row_id: String,
        attempt: u64,
        completion: AuditCompletion,
    },
    Failed {
        row_id: String,
        attempt: u64,
        failure: AuditFailure,
        at: DateTime<Utc>,
    },
}

impl AuditEvent {
    pub fn row_id(&self) -> &str {
        match self {
            AuditEvent::Started { row_id, .. }
            | AuditEvent::Completed { row_id, .. }
            | AuditEvent::Failed { row_id, .. } => row_id,
        }
    }
}

/// Per-row audit attempts for one run. Pure: callers supply `now`.
///
/// At most one attempt per row is loading at any time; absence of an entry
/// means idle.
#[derive(Debug, Clone)]
pub struct AuditBook {
    timeout: chrono::Duration,
    attempts: BTreeMap<String, AuditAttempt>,
    completions: BTreeMap<String, AuditCompletion>,
    next_attempt: u64,
}

impl AuditBook {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            timeout: config.audit_timeout_chrono(),
            attempts: BTreeMap::new(),
            completions: BTreeMap::new(),
            next_attempt: 0,
        }
    }

    /// Record a new loading attempt. `None` when one is already in flight.
    /// An errored row is cleared and starts over.
    pub fn begin(&mut self, row_id: &str, now: DateTime<Utc>) -> Option<u64> {
        if self
            .attempts
            .get(row_id)
            .is_some_and(|attempt| attempt.failure.is_none())
        {
            return None;
        }
        self.next_attempt += 1;
        self.attempts.insert(
            row_id.to_string(),
            AuditAttempt {
                attempt: self.next_attempt,
                started_at: now,
                failure: None,
            },
        );
        Some(self.next_attempt)
    }

    /// The trigger call for `attempt` failed. Ignored if that attempt is no
    /// longer the loading one.
    pub fn reject(
        &mut self,
        row_id: &str,
        attempt: u64,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Option<AuditEvent> {
        let entry = self.attempts.get_mut(row_id)?;
        if entry.attempt != attempt || entry.failure.is_some() {
            return None;
        }
        let failure = AuditFailure::Server(message.into());
        entry.failure = Some(failure.clone());
        Some(AuditEvent::Failed {
            row_id: row_id.to_string(),
            attempt,
            failure,
            at: now,
        })
    }

    /// Reconcile loading attempts against a fresh row snapshot.
    pub fn observe(&mut self, rows: &[ResultRow], now: DateTime<Utc>) -> Vec<AuditEvent> {
        let arrived: Vec<String> = self
            .attempts
            .iter()
            .filter(|(_, attempt)| attempt.failure.is_none())
            .filter(|(row_id, _)| {
                rows.iter()
                    .any(|row| &row.id == *row_id && row.has_audit_data())
            })
            .map(|(row_id, _)| row_id.clone())
            .collect();

        let mut events = Vec::new();
        for row_id in arrived {
            if let Some(attempt) = self.attempts.remove(&row_id) {
                let completion = AuditCompletion {
                    started_at: attempt.started_at,
                    first_data_at: now,
                };
                self.completions.insert(row_id.clone(), completion);
                events.push(AuditEvent::Completed {
                    row_id,
                    attempt: attempt.attempt,
                    completion,
                });
            }
        }
        events.extend(self.sweep(now));
        events
    }

    /// Time out loading attempts older than the bound. An attempt times out
    /// at most once.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<AuditEvent> {
        let mut events = Vec::new();
        for (row_id, attempt) in self.attempts.iter_mut() {
            if attempt.failure.is_some() || now - attempt.started_at <= self.timeout {
                continue;
            }
            attempt.failure = Some(AuditFailure::Timeout);
            events.push(AuditEvent::Failed {
                row_id: row_id.clone(),
                attempt: attempt.attempt,
                failure: AuditFailure::Timeout,
                at: now,
            });
        }
        events
    }

    pub fn status(&self, row_id: &str) -> AuditStatus {
        match self.attempts.get(row_id) {
            Some(attempt) => AuditStatus {
                state: attempt.state(),
                started_at: Some(attempt.started_at),
                failure: attempt.failure.clone(),
            },
            None => AuditStatus::idle(),
        }
    }

    pub fn attempt(&self, row_id: &str) -> Option<&AuditAttempt> {
        self.attempts.get(row_id)
    }

    pub fn completion(&self, row_id: &str) -> Option<AuditCompletion> {
        self.completions.get(row_id).copied()
    }

    pub fn in_flight(&self) -> usize {
        self.attempts
            .values()
            .filter(|attempt| attempt.failure.is_none())
            .count()
    }
}

/// Async owner of an [`AuditBook`] for one run: issues trigger calls and
/// runs the background timeout sweep. Cheap to clone.
#[derive(Clone)]
pub struct AuditTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    run_id: String,
    book: Mutex<AuditBook>,
    source: Arc<dyn RunSource>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<AuditEvent>,
    sweep_interval: Duration,
    sweeper_started: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

impl AuditTracker {
    pub fn new(
        run_id: impl Into<String>,
        config: &EngineConfig,
        source: Arc<dyn RunSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackerInner {
                run_id: run_id.into(),
                book: Mutex::new(AuditBook::new(config)),
                source,
                clock,
                events,
                sweep_interval: config.audit_sweep_interval,
                sweeper_started: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self, row_id: &str) -> AuditStatus {
        lock(&self.inner.book).status(row_id)
    }

    pub fn completion(&self, row_id: &str) -> Option<AuditCompletion> {
        lock(&self.inner.book).completion(row_id)
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.inner.book).in_flight()
    }

    /// Start an audit for `row_id`, or retry one that errored.
    ///
    /// The row stays loading after an accepted call; completion is detected
    /// from later row snapshots.
    pub async fn trigger(&self, row_id: &str) -> TriggerOutcome {
        let inner = &self.inner;
        let (attempt, started_at) = {
            let mut book = lock(&inner.book);
            let now = inner.clock.now();
            match book.begin(row_id, now) {
                Some(attempt) => (attempt, now),
                None => {
                    debug!(event = "audit_duplicate", run_id = %inner.run_id, row_id);
                    return TriggerOutcome::DuplicateSuppressed;
                }
            }
        };
        info!(event = "audit_started", run_id = %inner.run_id, row_id, attempt);
        inner.emit(AuditEvent::Started {
            row_id: row_id.to_string(),
            attempt,
            at: started_at,
        });

        if let Err(err) = inner.source.trigger_audit(&inner.run_id, row_id).await {
            warn!(event = "audit_trigger_failed", run_id = %inner.run_id, row_id, error = %err);
            let event = {
                let mut book = lock(&inner.book);
                let now = inner.clock.now();
                book.reject(row_id, attempt, err.user_message(), now)
            };
            if let Some(event) = event {
                inner.emit(event);
            }
        }
        TriggerOutcome::Started
    }

    /// Run the timeout check now.
    pub fn sweep(&self) {
        self.inner.sweep();
    }

    /// Spawn the periodic timeout sweep. Independent of any poller, so
    /// in-flight audits still time out after polling settles. Idempotent.
    pub fn start_sweeper(&self) {
        if self.inner.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let period = self.inner.sweep_interval;
        let weak = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => return,
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.sweep();
            }
        });
    }

    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
    }
}

impl TrackerInner {
    fn sweep(&self) {
        let events = {
            let mut book = lock(&self.book);
            let now = self.clock.now();
            book.sweep(now)
        };
        for event in events {
            self.emit(event);
        }
    }

    fn emit(&self, event: AuditEvent) {
        match &event {
            AuditEvent::Completed { row_id, completion, .. } => {
                info!(
                    event = "audit_completed",
                    run_id = %self.run_id,
                    row_id = %row_id,
                    first_data_at = %completion.first_data_at
                );
            }
            AuditEvent::Failed { row_id, failure, .. } if failure.is_timeout() => {
                warn!(event = "audit_timeout", run_id = %self.run_id, row_id = %row_id);
            }
            _ => {}
        }
        let _ = self.events.send(event);
    }
}

impl RowObserver for AuditTracker {
    fn observe_rows(&self, rows: &[ResultRow]) {
        let events = {
            let mut book = lock(&self.inner.book);
            let now = self.inner.clock.now();
            book.observe(rows, now)
        };
        for event in events {
            self.inner.emit(event);
        }
    }
}
