use crate::audit::{AuditCompletion, AuditEvent, AuditState, AuditStatus, AuditTracker};
use crate::clock::{Clock, MonotonicClock};
use crate::config::EngineConfig;
use crate::poller::{RunPoller, RunView};
use rw_core::{FetchError, Run, RunFilter, RunSource, TriggerOutcome};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("no run is being watched")]
    NoActiveRun,
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

struct ActiveRun {
    poller: RunPoller,
    tracker: AuditTracker,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.poller.stop();
        self.tracker.shutdown();
    }
}

/// Entry point for presentational callers: watches one run at a time and
/// tracks the audits triggered on its rows.
pub struct RunWatcher {
    config: EngineConfig,
    source: Arc<dyn RunSource>,
    clock: Arc<dyn Clock>,
    active: Option<ActiveRun>,
}

impl RunWatcher {
    pub fn new(config: EngineConfig, source: Arc<dyn RunSource>) -> Self {
        Self::with_clock(config, source, Arc::new(MonotonicClock::new()))
    }

    pub fn with_clock(
        config: EngineConfig,
        source: Arc<dyn RunSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            source,
            clock,
            active: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn watched_run_id(&self) -> Option<String> {
        self.active.as_ref().map(|active| active.poller.run_id())
    }

    /// Watch `run_id`, replacing any previously watched run. Pending and
    /// in-flight fetches for the previous run are cancelled and can no longer
    /// update state.
    pub fn watch_run(&mut self, run_id: &str) -> watch::Receiver<RunView> {
        if let Some(active) = &self.active {
            if active.poller.run_id() == run_id {
                return active.poller.subscribe();
            }
        }
        if let Some(previous) = self.active.take() {
            info!(event = "watch_switch", from = %previous.poller.run_id(), to = %run_id);
        }

        let tracker = AuditTracker::new(
            run_id,
            &self.config,
            self.source.clone(),
            self.clock.clone(),
        );
        let mut poller = RunPoller::new(
            run_id,
            &self.config,
            self.source.clone(),
            self.clock.clone(),
        )
        .with_observer(Arc::new(tracker.clone()));
        poller.start();
        tracker.start_sweeper();

        let rx = poller.subscribe();
        self.active = Some(ActiveRun { poller, tracker });
        rx
    }

    /// Stop watching. Audits in flight are abandoned with the run.
    pub fn unwatch(&mut self) {
        if let Some(active) = self.active.take() {
            info!(event = "watch_stop", run_id = %active.poller.run_id());
        }
    }

    /// Poll the watched run again after it stalled or a fetch failed.
    pub fn restart(&mut self) -> Result<(), WatchError> {
        let active = self.active.as_mut().ok_or(WatchError::NoActiveRun)?;
        info!(event = "watch_restart", run_id = %active.poller.run_id());
        active.poller.restart();
        Ok(())
    }

    pub fn current(&self) -> Option<RunView> {
        self.active.as_ref().map(|active| active.poller.current())
    }

    pub fn subscribe(&self) -> Option<watch::Receiver<RunView>> {
        self.active.as_ref().map(|active| active.poller.subscribe())
    }

    /// Resolves once polling of the watched run has settled.
    pub async fn settled(&self) -> Result<RunView, WatchError> {
        let active = self.active.as_ref().ok_or(WatchError::NoActiveRun)?;
        Ok(active.poller.settled().await)
    }

    pub fn audit_state(&self, row_id: &str) -> AuditStatus {
        self.active
            .as_ref()
            .map(|active| active.tracker.status(row_id))
            .unwrap_or_else(AuditStatus::idle)
    }

    pub fn audit_completion(&self, row_id: &str) -> Option<AuditCompletion> {
        self.active
            .as_ref()
            .and_then(|active| active.tracker.completion(row_id))
    }

    pub fn audit_events(&self) -> Option<broadcast::Receiver<AuditEvent>> {
        self.active.as_ref().map(|active| active.tracker.subscribe())
    }

    /// Fetch one snapshot of a run whose polling has settled. Observers see
    /// the new rows; polling itself stays stopped.
    pub async fn refresh(&self) -> Result<bool, WatchError> {
        let active = self.active.as_ref().ok_or(WatchError::NoActiveRun)?;
        Ok(active.poller.refresh().await?)
    }

    /// Trigger an audit for a row of the watched run. Duplicate triggers while
    /// one is in flight are suppressed. Once the call is accepted the run is
    /// refetched, so audits on a settled run still see their data arrive.
    pub async fn trigger_audit(&self, row_id: &str) -> Result<TriggerOutcome, WatchError> {
        let active = self.active.as_ref().ok_or(WatchError::NoActiveRun)?;
        let outcome = active.tracker.trigger(row_id).await;
        if outcome == TriggerOutcome::Started
            && active.tracker.status(row_id).state == AuditState::Loading
        {
            if let Err(err) = active.poller.refresh().await {
                warn!(
                    event = "audit_refresh_failed",
                    run_id = %active.poller.run_id(),
                    row_id = %row_id,
                    error = %err
                );
            }
        }
        Ok(outcome)
    }

    pub fn toggle_expanded(&self, row_id: &str) -> bool {
        self.active.as_ref().is_some_and(|active| {
            active
                .poller
                .update_view(row_id, |view| view.expanded = !view.expanded)
        })
    }

    pub fn set_selected(&self, row_id: &str, selected: bool) -> bool {
        self.active.as_ref().is_some_and(|active| {
            active
                .poller
                .update_view(row_id, |view| view.selected = selected)
        })
    }

    /// Runs available for watching, newest first.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, WatchError> {
        let runs = self.source.list_runs(filter).await?;
        Ok(filter.apply(runs))
    }
}
