use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use rw_core::{RunFilter, RunSource, RunStatus, TriggerOutcome};
use rw_engine::{AuditEvent, EngineConfig, PollPhase, RunView, RunWatcher};
use rw_http::{HttpRunSource, HttpSourceConfig, DEFAULT_BASE_URL, DEFAULT_TIMEOUT_SECS};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

mod render;

#[derive(Parser, Debug)]
#[command(name = "runwatch")]
#[command(about = "Follow search runs and the audits triggered on their rows", long_about = None)]
struct Args {
    /// Backend base url, e.g. http://localhost:8000/api/v1
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[arg(long, global = true)]
    token: Option<String>,
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List runs, newest first
    Runs {
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long)]
        query: Option<String>,
    },
    /// Follow one run until it completes, stalls or polling fails
    Watch {
        run_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Trigger an audit for one row and wait for its data
    Audit { run_id: String, row_id: String },
}

#[derive(Debug, Clone)]
struct Config {
    api_url: String,
    token: Option<String>,
    debug: bool,
    log_stdout: bool,
    request_timeout: Duration,
    engine: EngineConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Done,
    Stalled,
    Failed,
    Interrupted,
}

impl Outcome {
    fn code(self) -> u8 {
        match self {
            Outcome::Done => 0,
            Outcome::Failed => 1,
            Outcome::Stalled => 2,
            Outcome::Interrupted => 130,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let config = load_config(&args);
    init_logging(&config);

    match run(config, args.command).await {
        Ok(outcome) => ExitCode::from(outcome.code()),
        Err(err) => {
            error!(event = "runwatch_error", error = %format!("{err:#}"));
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(config: Config, command: Commands) -> Result<Outcome> {
    let source: Arc<dyn RunSource> = Arc::new(
        HttpRunSource::new(HttpSourceConfig {
            base_url: config.api_url.clone(),
            token: config.token.clone(),
            timeout: config.request_timeout,
        })
        .context("failed to configure backend client")?,
    );
    info!(event = "runwatch_start", api_url = %config.api_url);

    match command {
        Commands::Runs { status, query } => {
            list_runs(source, config.engine, RunFilter { status, query }).await
        }
        Commands::Watch { run_id, json } => watch(source, config.engine, &run_id, json).await,
        Commands::Audit { run_id, row_id } => audit(source, config.engine, &run_id, &row_id).await,
    }
}

async fn list_runs(
    source: Arc<dyn RunSource>,
    engine: EngineConfig,
    filter: RunFilter,
) -> Result<Outcome> {
    let watcher = RunWatcher::new(engine, source);
    let runs = watcher
        .list_runs(&filter)
        .await
        .context("failed to list runs")?;
    if runs.is_empty() {
        println!("no runs");
    }
    for run in &runs {
        println!("{}", render::run_line(run));
    }
    Ok(Outcome::Done)
}

async fn watch(
    source: Arc<dyn RunSource>,
    engine: EngineConfig,
    run_id: &str,
    json: bool,
) -> Result<Outcome> {
    let mut watcher = RunWatcher::new(engine, source);
    let mut rx = watcher.watch_run(run_id);
    let mut printed: Option<(u64, &'static str)> = None;

    loop {
        let view = rx.borrow_and_update().clone();
        let key = (view.polls, view.phase.as_str());
        if view.phase != PollPhase::Fetching && printed != Some(key) {
            print_view(&view, json)?;
            printed = Some(key);
        }
        if view.phase.is_settled() {
            return Ok(settled_outcome(&view));
        }

        tokio::select! {
            changed = rx.changed() => {
                if changed.is_err() {
                    bail!("poller for run {run_id} stopped unexpectedly");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(event = "interrupted", run_id = %run_id);
                watcher.unwatch();
                return Ok(Outcome::Interrupted);
            }
        }
    }
}

fn print_view(view: &RunView, json: bool) -> Result<()> {
    if json {
        let line = serde_json::to_string(&render::view_json(view)).context("encode view")?;
        println!("{line}");
    } else {
        println!("{}", render::view_line(view));
    }
    Ok(())
}

fn settled_outcome(view: &RunView) -> Outcome {
    match &view.phase {
        PollPhase::Done if render::is_failed_run(view) => Outcome::Failed,
        PollPhase::Done => Outcome::Done,
        PollPhase::Stalled => Outcome::Stalled,
        _ => Outcome::Failed,
    }
}

async fn audit(
    source: Arc<dyn RunSource>,
    engine: EngineConfig,
    run_id: &str,
    row_id: &str,
) -> Result<Outcome> {
    let mut watcher = RunWatcher::new(engine, source);
    let rx = watcher.watch_run(run_id);
    let mut events = watcher
        .audit_events()
        .ok_or_else(|| anyhow!("no watched run"))?;

    let outcome = watcher
        .trigger_audit(row_id)
        .await
        .context("failed to trigger audit")?;
    if outcome == TriggerOutcome::DuplicateSuppressed {
        bail!("an audit for row {row_id} is already running");
    }

    // A settled run is refetched once on trigger; keep refetching until the
    // audit resolves or the tracker times it out.
    let mut refresh = tokio::time::interval(watcher.config().poll_interval);
    refresh.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) if event.row_id() == row_id => {
                    println!("{}", render::audit_line(&event));
                    match event {
                        AuditEvent::Completed { .. } => return Ok(Outcome::Done),
                        AuditEvent::Failed { .. } => return Ok(Outcome::Failed),
                        AuditEvent::Started { .. } => {}
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(event = "audit_events_lagged", skipped);
                }
                Err(RecvError::Closed) => bail!("audit tracker for run {run_id} stopped"),
            },
            _ = refresh.tick() => {
                let view = rx.borrow().clone();
                if let Some(err) = view.error() {
                    return Err(anyhow::Error::new(err.clone())
                        .context(format!("polling run {run_id} failed")));
                }
                if view.phase.is_settled() {
                    if let Err(err) = watcher.refresh().await {
                        warn!(event = "audit_refresh_failed", run_id = %run_id, error = %err);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(event = "interrupted", run_id = %run_id, row_id = %row_id);
                return Ok(Outcome::Interrupted);
            }
        }
    }
}

fn load_config(args: &Args) -> Config {
    Config {
        api_url: resolve_api_url(args.api_url.as_deref()),
        token: resolve_token(args.token.as_deref()),
        debug: args.debug || env_true("RW_DEBUG"),
        log_stdout: env_true("RW_LOG_STDOUT"),
        request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        engine: EngineConfig::from_env(),
    }
}

fn resolve_api_url(flag: Option<&str>) -> String {
    non_empty(flag.map(str::to_string))
        .or_else(|| non_empty(std::env::var("RW_API_URL").ok()))
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

fn resolve_token(flag: Option<&str>) -> Option<String> {
    non_empty(flag.map(str::to_string)).or_else(|| non_empty(std::env::var("RW_API_TOKEN").ok()))
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn init_logging(config: &Config) {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("RW_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = if config.debug {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let writer = if config.log_stdout {
        BoxMakeWriter::new(std::io::stdout)
    } else {
        BoxMakeWriter::new(std::io::stderr)
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
