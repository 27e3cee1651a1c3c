mod common;

use chrono::Duration as ChronoDuration;
use common::{row, rows, run, ts, ScriptedSource};
use rw_core::{FetchError, RunFilter, RunStatus, TriggerOutcome};
use rw_engine::{
    AuditEvent, AuditState, EngineConfig, ManualClock, PollPhase, RunView, RunWatcher,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(5),
        ..EngineConfig::default()
    }
}

async fn settle(watcher: &RunWatcher) -> RunView {
    tokio::time::timeout(Duration::from_secs(5), watcher.settled())
        .await
        .expect("settled in time")
        .expect("active run")
}

async fn wait_view(
    rx: &mut watch::Receiver<RunView>,
    pred: impl FnMut(&RunView) -> bool,
) -> RunView {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
        .await
        .expect("view within timeout")
        .expect("poller alive")
        .clone()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processing_then_completed_settles_with_all_rows() {
    let source = Arc::new(ScriptedSource::new().script(
        "run-1",
        vec![
            (run("run-1", RunStatus::Processing, 0), vec![]),
            (run("run-1", RunStatus::Completed, 42), rows(42)),
        ],
    ));
    let mut watcher = RunWatcher::new(fast_config(), source.clone());
    watcher.watch_run("run-1");

    let view = settle(&watcher).await;
    assert_eq!(view.phase, PollPhase::Done);
    assert!(!view.stalled);
    assert_eq!(view.rows.len(), 42);
    assert_eq!(view.run.map(|r| r.result_count), Some(42));
    assert_eq!(source.get_run_calls(), 2);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(source.get_run_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_stuck_in_processing_is_reported_stalled() {
    let clock = ManualClock::new(ts(0));
    let source = Arc::new(
        ScriptedSource::new()
            .script(
                "run-1",
                vec![(run("run-1", RunStatus::Processing, 3), rows(3))],
            )
            .advance_clock_per_fetch(clock.clone(), ChronoDuration::seconds(61)),
    );
    let mut watcher = RunWatcher::with_clock(fast_config(), source.clone(), Arc::new(clock));
    watcher.watch_run("run-1");

    let view = settle(&watcher).await;
    assert!(view.stalled);
    assert_eq!(view.phase, PollPhase::Stalled);
    assert_eq!(view.run.map(|r| r.status), Some(RunStatus::Processing));
    assert_eq!(view.rows.len(), 3);
    assert_eq!(source.get_run_calls(), 6);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(source.get_run_calls(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetch_failure_stops_polling_until_restart() {
    let source = Arc::new(ScriptedSource::new().fail_run(
        "run-1",
        FetchError::Server {
            status: Some(500),
            message: "db down".to_string(),
        },
    ));
    let mut watcher = RunWatcher::new(fast_config(), source.clone());
    watcher.watch_run("run-1");

    let view = settle(&watcher).await;
    assert!(matches!(
        view.error(),
        Some(FetchError::Server { message, .. }) if message == "db down"
    ));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(source.get_run_calls(), 1);

    watcher.restart().expect("restart");
    let view = settle(&watcher).await;
    assert!(view.error().is_some());
    assert_eq!(source.get_run_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn switching_runs_drops_the_in_flight_fetch() {
    let source = Arc::new(
        ScriptedSource::new()
            .script(
                "run-1",
                vec![(run("run-1", RunStatus::Completed, 9), rows(9))],
            )
            .script(
                "run-2",
                vec![(run("run-2", RunStatus::Completed, 3), rows(3))],
            ),
    );
    let gate = source.gate("run-1");
    let mut watcher = RunWatcher::new(fast_config(), source.clone());

    let first_rx = watcher.watch_run("run-1");
    tokio::time::timeout(Duration::from_secs(5), source.entered.notified())
        .await
        .expect("run-1 fetch started");

    watcher.watch_run("run-2");
    let view = settle(&watcher).await;
    assert_eq!(view.run_id, "run-2");
    assert_eq!(view.rows.len(), 3);

    gate.notify_waiters();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let current = watcher.current().expect("watched");
    assert_eq!(current.run_id, "run-2");
    assert_eq!(current.run.map(|r| r.id), Some("run-2".to_string()));
    assert_eq!(current.rows.len(), 3);
    assert!(first_rx.borrow().run.is_none());
    assert_eq!(watcher.watched_run_id().as_deref(), Some("run-2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn completed_run_is_visible_without_subscribers() {
    let source = Arc::new(ScriptedSource::new().script(
        "run-1",
        vec![(run("run-1", RunStatus::Completed, 4), rows(4))],
    ));
    let mut watcher = RunWatcher::new(fast_config(), source.clone());
    drop(watcher.watch_run("run-1"));

    let view = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = watcher.current().expect("watched");
            if view.phase == PollPhase::Done {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("done in time");
    assert_eq!(view.rows.len(), 4);
    assert_eq!(view.polls, 1);
    assert_eq!(settle(&watcher).await.phase, PollPhase::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fetch_failure_settles_without_subscribers() {
    let source = Arc::new(ScriptedSource::new().fail_run(
        "run-1",
        FetchError::Network("connection refused".to_string()),
    ));
    let mut watcher = RunWatcher::new(fast_config(), source.clone());
    drop(watcher.watch_run("run-1"));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let view = settle(&watcher).await;
    assert!(matches!(view.phase, PollPhase::Failed(FetchError::Network(_))));
    assert_eq!(source.get_run_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn row_view_edits_survive_later_polls() {
    let source = Arc::new(ScriptedSource::new().script(
        "run-1",
        vec![(run("run-1", RunStatus::Processing, 2), rows(2))],
    ));
    let mut watcher = RunWatcher::new(fast_config(), source);
    let mut rx = watcher.watch_run("run-1");

    let first = wait_view(&mut rx, |view| view.polls >= 1).await;
    assert!(watcher.toggle_expanded("1"));
    assert!(watcher.set_selected("2", true));
    assert!(!watcher.toggle_expanded("missing"));

    let later = wait_view(&mut rx, |view| view.polls >= first.polls + 2).await;
    assert!(later.rows[0].view.expanded);
    assert!(later.rows[1].view.selected);
    assert_eq!(later.rows.len(), 2);
    watcher.unwatch();
    assert!(watcher.current().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audit_completes_when_polled_rows_carry_data() {
    let clock = ManualClock::new(ts(0));
    let plain = vec![row("7", 1, false), row("8", 2, false)];
    let audited = vec![row("7", 1, true), row("8", 2, false)];
    let source = Arc::new(ScriptedSource::new().script(
        "run-1",
        std::iter::repeat(plain)
            .take(5)
            .chain(std::iter::once(audited))
            .map(|rows| (run("run-1", RunStatus::Processing, 2), rows))
            .collect(),
    ));
    let config = EngineConfig {
        poll_interval: Duration::from_millis(20),
        ..EngineConfig::default()
    };
    let mut watcher = RunWatcher::with_clock(config, source.clone(), Arc::new(clock.clone()));
    watcher.watch_run("run-1");
    let mut events = watcher.audit_events().expect("events");

    assert_eq!(
        watcher.trigger_audit("7").await,
        Ok(TriggerOutcome::Started)
    );
    assert_eq!(watcher.audit_state("7").state, AuditState::Loading);
    clock.advance(ChronoDuration::seconds(20));

    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream") {
                event @ AuditEvent::Completed { .. } => return event,
                _ => continue,
            }
        }
    })
    .await
    .expect("completion in time");
    assert_eq!(completed.row_id(), "7");
    assert_eq!(watcher.audit_state("7").state, AuditState::Idle);
    assert_eq!(watcher.audit_state("8").state, AuditState::Idle);

    let completion = watcher.audit_completion("7").expect("completion");
    assert_eq!(completion.started_at, ts(0));
    assert_eq!(completion.first_data_at, ts(20_000));
    assert_eq!(source.trigger_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audit_on_completed_run_refetches_rows() {
    let source = Arc::new(ScriptedSource::new().script(
        "run-1",
        vec![
            (
                run("run-1", RunStatus::Completed, 2),
                vec![row("7", 1, false), row("8", 2, false)],
            ),
            (
                run("run-1", RunStatus::Completed, 2),
                vec![row("7", 1, true), row("8", 2, false)],
            ),
        ],
    ));
    let mut watcher = RunWatcher::new(fast_config(), source.clone());
    watcher.watch_run("run-1");
    let settled = settle(&watcher).await;
    assert_eq!(settled.phase, PollPhase::Done);
    assert_eq!(source.get_run_calls(), 1);
    let mut events = watcher.audit_events().expect("events");

    assert_eq!(
        watcher.trigger_audit("7").await,
        Ok(TriggerOutcome::Started)
    );
    let completed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream") {
                event @ AuditEvent::Completed { .. } => return event,
                _ => continue,
            }
        }
    })
    .await
    .expect("completion in time");
    assert_eq!(completed.row_id(), "7");
    assert_eq!(watcher.audit_state("7").state, AuditState::Idle);
    assert!(watcher.audit_completion("7").is_some());

    let view = watcher.current().expect("watched");
    assert_eq!(view.phase, PollPhase::Done);
    assert!(view.rows[0].has_audit_data());
    assert_eq!(source.get_run_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audit_without_watched_run_is_rejected() {
    let watcher = RunWatcher::new(fast_config(), Arc::new(ScriptedSource::new()));
    assert_eq!(
        watcher.trigger_audit("1").await,
        Err(rw_engine::WatchError::NoActiveRun)
    );
    assert_eq!(watcher.audit_state("1").state, AuditState::Idle);
}

#[tokio::test]
async fn list_runs_applies_filter() {
    let source = Arc::new(
        ScriptedSource::new()
            .script("a", vec![(run("a", RunStatus::Completed, 1), vec![])])
            .script("b", vec![(run("b", RunStatus::Failed, 0), vec![])])
            .script("c", vec![(run("c", RunStatus::Completed, 4), vec![])]),
    );
    let watcher = RunWatcher::new(fast_config(), source);
    let filter = RunFilter {
        status: Some(RunStatus::Completed),
        query: Some("DENTIST".to_string()),
    };
    let ids: Vec<String> = watcher
        .list_runs(&filter)
        .await
        .expect("runs")
        .into_iter()
        .map(|run| run.id)
        .collect();
    assert_eq!(ids, vec!["a".to_string(), "c".to_string()]);
}
