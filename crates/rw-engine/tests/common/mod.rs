#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rw_core::{FetchError, ResultRow, Run, RunFilter, RunSource, RunStatus};
use rw_engine::ManualClock;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

pub fn ts(offset_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_708_995_600_000 + offset_ms)
        .single()
        .expect("valid timestamp")
}

pub fn run(id: &str, status: RunStatus, count: u64) -> Run {
    Run {
        id: id.to_string(),
        query: "dentist moscow".to_string(),
        provider: "serpapi".to_string(),
        status,
        result_count: count,
        num_results: Some(50),
        created_at: ts(0),
        updated_at: None,
        config: None,
    }
}

pub fn row(id: &str, position: u32, audited: bool) -> ResultRow {
    let extra = if audited {
        json!({"audit": {"robots": true, "sitemap": false}})
    } else {
        json!({})
    };
    serde_json::from_value(json!({
        "id": id,
        "position": position,
        "title": format!("site {id}"),
        "url": format!("https://{id}.example/"),
        "domain": format!("{id}.example"),
        "extra_data": extra
    }))
    .expect("row")
}

pub fn rows(count: usize) -> Vec<ResultRow> {
    (1..=count)
        .map(|i| row(&i.to_string(), i as u32, false))
        .collect()
}

struct Script {
    runs: VecDeque<Run>,
    rows: VecDeque<Vec<ResultRow>>,
    last_run: Option<Run>,
    last_rows: Vec<ResultRow>,
}

/// In-memory [`RunSource`] replaying scripted snapshots per run id. The last
/// scripted snapshot repeats once the script is exhausted.
#[derive(Default)]
pub struct ScriptedSource {
    scripts: Mutex<HashMap<String, Script>>,
    run_errors: Mutex<HashMap<String, FetchError>>,
    trigger_error: Mutex<Option<FetchError>>,
    gates: Mutex<HashMap<String, std::sync::Arc<Notify>>>,
    pub entered: Notify,
    pub get_run_calls: AtomicUsize,
    pub trigger_calls: AtomicUsize,
    advance_per_fetch: Mutex<Option<(ManualClock, Duration)>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, run_id: &str, snapshots: Vec<(Run, Vec<ResultRow>)>) -> Self {
        let (runs, rows): (VecDeque<_>, VecDeque<_>) = snapshots.into_iter().unzip();
        self.scripts.lock().expect("scripts").insert(
            run_id.to_string(),
            Script {
                runs,
                rows,
                last_run: None,
                last_rows: Vec::new(),
            },
        );
        self
    }

    pub fn fail_run(self, run_id: &str, err: FetchError) -> Self {
        self.run_errors
            .lock()
            .expect("errors")
            .insert(run_id.to_string(), err);
        self
    }

    pub fn fail_triggers(self, err: FetchError) -> Self {
        *self.trigger_error.lock().expect("trigger error") = Some(err);
        self
    }

    /// Hold every `get_run` for `run_id` until the returned gate is notified.
    pub fn gate(&self, run_id: &str) -> std::sync::Arc<Notify> {
        let gate = std::sync::Arc::new(Notify::new());
        self.gates
            .lock()
            .expect("gates")
            .insert(run_id.to_string(), gate.clone());
        gate
    }

    pub fn advance_clock_per_fetch(self, clock: ManualClock, step: Duration) -> Self {
        *self.advance_per_fetch.lock().expect("advance") = Some((clock, step));
        self
    }

    pub fn get_run_calls(&self) -> usize {
        self.get_run_calls.load(Ordering::SeqCst)
    }

    pub fn trigger_calls(&self) -> usize {
        self.trigger_calls.load(Ordering::SeqCst)
    }

    fn next_snapshot(&self, run_id: &str) -> Result<(Run, Vec<ResultRow>), FetchError> {
        let mut scripts = self.scripts.lock().expect("scripts");
        let script = scripts
            .get_mut(run_id)
            .ok_or_else(|| FetchError::NotFound(format!("run {run_id}")))?;
        if let Some(run) = script.runs.pop_front() {
            script.last_run = Some(run);
            script.last_rows = script.rows.pop_front().unwrap_or_default();
        }
        let run = script
            .last_run
            .clone()
            .ok_or_else(|| FetchError::NotFound(format!("run {run_id}")))?;
        Ok((run, script.last_rows.clone()))
    }
}

#[async_trait]
impl RunSource for ScriptedSource {
    async fn get_run(&self, run_id: &str) -> Result<Run, FetchError> {
        self.get_run_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.lock().expect("gates").get(run_id).cloned();
        if let Some(gate) = gate {
            self.entered.notify_one();
            gate.notified().await;
        }
        if let Some((clock, step)) = self.advance_per_fetch.lock().expect("advance").as_ref() {
            clock.advance(*step);
        }
        if let Some(err) = self.run_errors.lock().expect("errors").get(run_id) {
            return Err(err.clone());
        }
        self.next_snapshot(run_id).map(|(run, _)| run)
    }

    async fn get_result_rows(&self, run_id: &str) -> Result<Vec<ResultRow>, FetchError> {
        let scripts = self.scripts.lock().expect("scripts");
        Ok(scripts
            .get(run_id)
            .map(|script| script.last_rows.clone())
            .unwrap_or_default())
    }

    async fn trigger_audit(&self, _run_id: &str, _row_id: &str) -> Result<(), FetchError> {
        self.trigger_calls.fetch_add(1, Ordering::SeqCst);
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        match self.trigger_error.lock().expect("trigger error").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn list_runs(&self, _filter: &RunFilter) -> Result<Vec<Run>, FetchError> {
        let scripts = self.scripts.lock().expect("scripts");
        Ok(scripts
            .values()
            .filter_map(|script| script.runs.front().cloned().or_else(|| script.last_run.clone()))
            .collect())
    }
}
