use rw_core::{Run, RunStatus};
use rw_engine::{AuditEvent, PollPhase, RunView};
use serde_json::{json, Value};

pub fn run_line(run: &Run) -> String {
    let mut line = format!(
        "{:>6}  {:<10}  {:>4} results  {}  {}",
        run.id,
        run.status.as_str(),
        run.result_count,
        run.created_at.format("%Y-%m-%d %H:%M"),
        run.query
    );
    if let Some(message) = run.error_message() {
        line.push_str(&format!("  ({message})"));
    }
    line
}

pub fn view_line(view: &RunView) -> String {
    let status = view
        .run
        .as_ref()
        .map_or("unknown", |run| run.status.as_str());
    let audited = view.rows.iter().filter(|row| row.has_audit_data()).count();
    let mut line = format!(
        "run={} phase={} status={} results={} rows={} audited={} contacts={} polls={}",
        view.run_id,
        view.phase.as_str(),
        status,
        view.run.as_ref().map_or(0, |run| run.result_count),
        view.rows.len(),
        audited,
        contact_count(view),
        view.polls,
    );
    match &view.phase {
        PollPhase::Failed(err) => line.push_str(&format!(" error=\"{err}\"")),
        PollPhase::Done => {
            if let Some(message) = view.run.as_ref().and_then(Run::error_message) {
                line.push_str(&format!(" run_error=\"{message}\""));
            }
        }
        _ => {}
    }
    line
}

pub fn view_json(view: &RunView) -> Value {
    json!({
        "run_id": view.run_id,
        "phase": view.phase.as_str(),
        "stalled": view.stalled,
        "status": view.run.as_ref().map(|run| run.status.as_str()),
        "result_count": view.run.as_ref().map(|run| run.result_count),
        "rows": view.rows.len(),
        "audited": view.rows.iter().filter(|row| row.has_audit_data()).count(),
        "contacts": contact_count(view),
        "polls": view.polls,
        "last_polled_at": view.last_polled_at,
        "error": view.error().map(ToString::to_string),
    })
}

fn contact_count(view: &RunView) -> usize {
    view.rows.iter().filter(|row| row.has_contacts()).count()
}

pub fn audit_line(event: &AuditEvent) -> String {
    match event {
        AuditEvent::Started { row_id, attempt, at } => {
            format!("audit row={row_id} attempt={attempt} started_at={}", at.to_rfc3339())
        }
        AuditEvent::Completed {
            row_id,
            attempt,
            completion,
        } => format!(
            "audit row={row_id} attempt={attempt} completed after {}s",
            (completion.first_data_at - completion.started_at).num_seconds()
        ),
        AuditEvent::Failed {
            row_id,
            attempt,
            failure,
            ..
        } => format!(
            "audit row={row_id} attempt={attempt} failed: {}",
            failure.message()
        ),
    }
}

/// Final run status worth reporting once polling is done.
pub fn is_failed_run(view: &RunView) -> bool {
    view.run
        .as_ref()
        .is_some_and(|run| run.status == RunStatus::Failed)
}
