use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::lock;
use chrono::{DateTime, Utc};
use rw_core::{merge_rows, merge_run, FetchError, ResultRow, RowView, Run, RunSource};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollPhase {
    Idle,
    Fetching,
    Waiting,
    /// Gave up watching; the job itself may still be running server-side.
    Stalled,
    Done,
    Failed(FetchError),
}

impl PollPhase {
    /// No further fetches will be scheduled for this session.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            PollPhase::Stalled | PollPhase::Done | PollPhase::Failed(_)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PollPhase::Idle => "idle",
            PollPhase::Fetching => "fetching",
            PollPhase::Waiting => "waiting",
            PollPhase::Stalled => "stalled",
            PollPhase::Done => "done",
            PollPhase::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    FetchAfter(Duration),
    Done,
    Stalled,
    Failed,
    /// Response belonged to a superseded request and was dropped.
    Discarded,
}

/// What presentational callers see after every reconciled tick.
#[derive(Debug, Clone, PartialEq)]
pub struct RunView {
    pub run_id: String,
    pub run: Option<Run>,
    pub rows: Vec<ResultRow>,
    pub stalled: bool,
    pub phase: PollPhase,
    pub polls: u64,
    pub last_polled_at: Option<DateTime<Utc>>,
}

impl RunView {
    pub fn error(&self) -> Option<&FetchError> {
        match &self.phase {
            PollPhase::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Polling state for one run id. Pure: callers supply `now`.
#[derive(Debug, Clone)]
pub struct PollSession {
    run_id: String,
    poll_interval: Duration,
    stall_after: chrono::Duration,
    generation: u64,
    last_issued: u64,
    phase: PollPhase,
    started_processing_at: Option<DateTime<Utc>>,
    run: Option<Run>,
    rows: Vec<ResultRow>,
    polls: u64,
    last_polled_at: Option<DateTime<Utc>>,
}

impl PollSession {
    pub fn new(run_id: impl Into<String>, config: &EngineConfig) -> Self {
        Self {
            run_id: run_id.into(),
            poll_interval: config.poll_interval,
            stall_after: config.stall_after_chrono(),
            generation: 0,
            last_issued: 0,
            phase: PollPhase::Idle,
            started_processing_at: None,
            run: None,
            rows: Vec::new(),
            polls: 0,
            last_polled_at: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn phase(&self) -> &PollPhase {
        &self.phase
    }

    pub fn started_processing_at(&self) -> Option<DateTime<Utc>> {
        self.started_processing_at
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Issue the next fetch. `None` once the session has settled or while a
    /// fetch is already outstanding.
    pub fn begin_fetch(&mut self) -> Option<FetchTicket> {
        if self.phase.is_settled() || self.phase == PollPhase::Fetching {
            return None;
        }
        self.last_issued += 1;
        self.phase = PollPhase::Fetching;
        Some(FetchTicket {
            generation: self.generation,
            seq: self.last_issued,
        })
    }

    fn is_current(&self, ticket: FetchTicket) -> bool {
        ticket.generation == self.generation && ticket.seq == self.last_issued
    }

    pub fn apply_snapshot(
        &mut self,
        ticket: FetchTicket,
        run: Run,
        rows: Vec<ResultRow>,
        now: DateTime<Utc>,
    ) -> PollDecision {
        if !self.is_current(ticket) || self.phase != PollPhase::Fetching {
            return PollDecision::Discarded;
        }
        if run.id != self.run_id {
            return PollDecision::Discarded;
        }

        let merged_run = merge_run(self.run.as_ref(), &run);
        self.rows = merge_rows(&self.rows, &rows);
        self.polls += 1;
        self.last_polled_at = Some(now);
        let status = merged_run.status;
        self.run = Some(merged_run);

        if status.is_terminal() {
            self.phase = PollPhase::Done;
            return PollDecision::Done;
        }

        let started = *self.started_processing_at.get_or_insert(now);
        if now - started > self.stall_after {
            self.phase = PollPhase::Stalled;
            return PollDecision::Stalled;
        }

        self.phase = PollPhase::Waiting;
        PollDecision::FetchAfter(self.poll_interval)
    }

    pub fn apply_failure(&mut self, ticket: FetchTicket, err: FetchError) -> PollDecision {
        if !self.is_current(ticket) || self.phase != PollPhase::Fetching {
            return PollDecision::Discarded;
        }
        self.phase = PollPhase::Failed(err);
        PollDecision::Failed
    }

    /// Abandon any outstanding fetch; its response will be discarded.
    pub fn invalidate(&mut self) {
        self.generation += 1;
        if self.phase == PollPhase::Fetching {
            self.phase = PollPhase::Idle;
        }
    }

    /// Start a fresh watch of the same run. Held rows and their local view
    /// survive; outstanding tickets are invalidated.
    pub fn restart(&mut self) {
        self.invalidate();
        self.phase = PollPhase::Idle;
        self.started_processing_at = None;
    }

    /// Generation to hand back to [`PollSession::apply_refresh`]; `None`
    /// unless polling ended as `Done` or `Stalled`.
    pub fn refresh_generation(&self) -> Option<u64> {
        matches!(self.phase, PollPhase::Done | PollPhase::Stalled).then_some(self.generation)
    }

    /// Merge a one-off snapshot taken after polling settled. Polling is not
    /// resumed. A stalled session whose run turned out terminal becomes
    /// `Done`. Returns false when the session moved on in the meantime.
    pub fn apply_refresh(
        &mut self,
        generation: u64,
        run: Run,
        rows: Vec<ResultRow>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.refresh_generation() != Some(generation) || run.id != self.run_id {
            return false;
        }
        let merged_run = merge_run(self.run.as_ref(), &run);
        self.rows = merge_rows(&self.rows, &rows);
        self.polls += 1;
        self.last_polled_at = Some(now);
        if merged_run.status.is_terminal() {
            self.phase = PollPhase::Done;
        }
        self.run = Some(merged_run);
        true
    }

    /// Edit the local view of one held row. Returns false for unknown ids.
    pub fn update_view(&mut self, row_id: &str, edit: impl FnOnce(&mut RowView)) -> bool {
        match self.rows.iter_mut().find(|row| row.id == row_id) {
            Some(row) => {
                edit(&mut row.view);
                true
            }
            None => false,
        }
    }

    pub fn view(&self) -> RunView {
        RunView {
            run_id: self.run_id.clone(),
            run: self.run.clone(),
            rows: self.rows.clone(),
            stalled: self.phase == PollPhase::Stalled,
            phase: self.phase.clone(),
            polls: self.polls,
            last_polled_at: self.last_polled_at,
        }
    }
}

/// Receives every reconciled row snapshot, in the order the poller applied
/// them.
pub trait RowObserver: Send + Sync {
    fn observe_rows(&self, rows: &[ResultRow]);
}

/// Async driver around a [`PollSession`]. Dropping it cancels polling.
pub struct RunPoller {
    session: Arc<Mutex<PollSession>>,
    view_tx: watch::Sender<RunView>,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    source: Arc<dyn RunSource>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn RowObserver>>,
}

impl RunPoller {
    pub fn new(
        run_id: impl Into<String>,
        config: &EngineConfig,
        source: Arc<dyn RunSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let session = PollSession::new(run_id, config);
        let (view_tx, _) = watch::channel(session.view());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            session: Arc::new(Mutex::new(session)),
            view_tx,
            shutdown_tx,
            handle: None,
            source,
            clock,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RowObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn run_id(&self) -> String {
        lock(&self.session).run_id().to_string()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunView> {
        self.view_tx.subscribe()
    }

    pub fn current(&self) -> RunView {
        self.view_tx.borrow().clone()
    }

    /// Begin polling; the first fetch is issued immediately.
    pub fn start(&mut self) {
        if self.handle.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = shutdown_tx;
        let task = PollTask {
            session: self.session.clone(),
            view_tx: self.view_tx.clone(),
            source: self.source.clone(),
            clock: self.clock.clone(),
            observers: self.observers.clone(),
        };
        self.handle = Some(tokio::spawn(task.run(shutdown_rx)));
    }

    /// Cancel the running loop (if any) and poll again from scratch.
    pub fn restart(&mut self) {
        self.stop();
        {
            let mut session = lock(&self.session);
            session.restart();
            self.view_tx.send_replace(session.view());
        }
        self.start();
    }

    /// Cancel any scheduled or in-flight fetch. No state update is delivered
    /// after this returns.
    pub fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        lock(&self.session).invalidate();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Fetch one snapshot after polling settled without resuming the loop.
    /// `Ok(false)` while polling is still active, after a failure, or when
    /// the session moved on before the snapshot arrived.
    pub async fn refresh(&self) -> Result<bool, FetchError> {
        let (generation, run_id) = {
            let session = lock(&self.session);
            match session.refresh_generation() {
                Some(generation) => (generation, session.run_id().to_string()),
                None => return Ok(false),
            }
        };
        let (run, rows) = fetch_snapshot(self.source.as_ref(), &run_id).await?;
        let now = self.clock.now();

        let mut session = lock(&self.session);
        if !session.apply_refresh(generation, run, rows, now) {
            debug!(event = "refresh_discarded", run_id = %run_id);
            return Ok(false);
        }
        self.view_tx.send_replace(session.view());
        notify_observers(&self.observers, session.rows());
        debug!(event = "refresh_applied", run_id = %run_id);
        Ok(true)
    }

    pub fn update_view(&self, row_id: &str, edit: impl FnOnce(&mut RowView)) -> bool {
        let mut session = lock(&self.session);
        let changed = session.update_view(row_id, edit);
        if changed {
            self.view_tx.send_replace(session.view());
        }
        changed
    }

    /// Wait until polling settles and return the final view.
    pub async fn settled(&self) -> RunView {
        let mut rx = self.view_tx.subscribe();
        loop {
            {
                let view = rx.borrow_and_update();
                if view.phase.is_settled() {
                    return view.clone();
                }
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }
}

impl Drop for RunPoller {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct PollTask {
    session: Arc<Mutex<PollSession>>,
    view_tx: watch::Sender<RunView>,
    source: Arc<dyn RunSource>,
    clock: Arc<dyn Clock>,
    observers: Vec<Arc<dyn RowObserver>>,
}

impl PollTask {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let (ticket, run_id) = {
                let mut session = lock(&self.session);
                let Some(ticket) = session.begin_fetch() else {
                    return;
                };
                self.view_tx.send_replace(session.view());
                (ticket, session.run_id().to_string())
            };

            let fetched = tokio::select! {
                result = fetch_snapshot(self.source.as_ref(), &run_id) => result,
                _ = shutdown.changed() => return,
            };
            if *shutdown.borrow() {
                return;
            }

            let now = self.clock.now();
            let decision = {
                let mut session = lock(&self.session);
                let decision = match fetched {
                    Ok((run, rows)) => session.apply_snapshot(ticket, run, rows, now),
                    Err(err) => {
                        warn!(event = "poll_failed", run_id = %run_id, error = %err);
                        session.apply_failure(ticket, err)
                    }
                };
                if decision == PollDecision::Discarded {
                    debug!(event = "poll_discarded", run_id = %run_id);
                    return;
                }
                self.view_tx.send_replace(session.view());
                // Still under the session lock: stop() cannot slip in between
                // the ticket check and the observers seeing this tick.
                if decision != PollDecision::Failed {
                    notify_observers(&self.observers, session.rows());
                }
                decision
            };

            match decision {
                PollDecision::FetchAfter(delay) => {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => return,
                    }
                }
                PollDecision::Done => {
                    info!(event = "poll_done", run_id = %run_id);
                    return;
                }
                PollDecision::Stalled => {
                    warn!(event = "poll_stalled", run_id = %run_id);
                    return;
                }
                PollDecision::Failed | PollDecision::Discarded => return,
            }
        }
    }
}

fn notify_observers(observers: &[Arc<dyn RowObserver>], rows: &[ResultRow]) {
    for observer in observers {
        observer.observe_rows(rows);
    }
}

async fn fetch_snapshot(
    source: &dyn RunSource,
    run_id: &str,
) -> Result<(Run, Vec<ResultRow>), FetchError> {
    let run = source.get_run(run_id).await?;
    let rows = source.get_result_rows(run_id).await?;
    Ok((run, rows))
}
