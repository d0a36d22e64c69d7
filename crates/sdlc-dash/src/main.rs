use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use sdlc_core::events::Event;
use sdlc_core::{CreateExecutionRequest, Execution, ExecutionType, Run};
use sdlc_sync::reconciler::ExecutionView;
use sdlc_sync::{
    resolve_state_dir, ClientConfig, Dashboard, DashboardTab, FilePreferences, HttpApi,
    PreferenceStore, SdlcApi, SyncTimings, SELECTED_EXECUTION_KEY,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "sdlc-dash.log";

#[derive(Parser, Debug)]
#[command(name = "sdlc-dash")]
#[command(about = "Headless dashboard for the SDLC orchestrator", long_about = None)]
struct Cli {
    /// REST base URL; defaults to SDLC_BASE_URL or http://127.0.0.1:8080
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Push feed URL; derived from the base URL when omitted
    #[arg(long, global = true)]
    events_url: Option<String>,
    /// Directory for preferences and logs
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Follow runs, the active run and one execution until Ctrl-C
    Watch {
        #[arg(long)]
        execution: Option<String>,
    },
    /// List runs, newest first
    Runs,
    /// List executions grouped under their parent
    Executions {
        #[arg(long)]
        run: Option<String>,
    },
    /// Show one execution with its transcript
    Show { id: String },
    /// Start a new execution
    Create(CreateArgs),
    /// Send a message to an execution waiting for input
    Message { id: String, content: String },
    Approve { id: String },
    Cancel { id: String },
    /// Make a run the server's active run
    SelectRun { id: String },
    /// Run the whole pipeline
    RunPipeline,
    /// Read or set the persisted dashboard tab
    Tab { name: Option<String> },
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[arg(long)]
    phase: String,
    #[arg(long)]
    run: Option<String>,
    #[arg(long)]
    issue: Option<String>,
    /// Extra parameter, repeatable
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

struct Config {
    client: ClientConfig,
    state_dir: PathBuf,
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.state_dir);
    info!(
        "sdlc_dash_start: base={} events={}",
        config.client.base_url, config.client.events_url
    );

    match cli.command {
        Command::Watch { execution } => watch(&config, execution).await,
        Command::Runs => {
            let mut runs = api(&config)?.list_runs().await?;
            sdlc_core::sort_runs_newest_first(&mut runs);
            emit(&config, &runs, || runs.iter().map(format_run).collect())
        }
        Command::Executions { run } => {
            let executions = api(&config)?.list_executions(run.as_deref()).await?;
            emit(&config, &executions, || format_tree(&executions))
        }
        Command::Show { id } => {
            let execution = api(&config)?.get_execution(&id).await?;
            emit(&config, &execution, || format_transcript(&execution))
        }
        Command::Create(args) => create(&config, args).await,
        Command::Message { id, content } => {
            let ack = api(&config)?.send_message(&id, &content).await?;
            emit(&config, &ack, || vec![format!("message sent to {id}: {}", ack.status)])
        }
        Command::Approve { id } => {
            let ack = api(&config)?.approve_execution(&id).await?;
            emit(&config, &ack, || vec![format!("approved {id}: {}", ack.status)])
        }
        Command::Cancel { id } => {
            let ack = api(&config)?.cancel_execution(&id).await?;
            emit(&config, &ack, || vec![format!("cancelled {id}: {}", ack.status)])
        }
        Command::SelectRun { id } => {
            let ack = api(&config)?.select_run(&id).await?;
            emit(&config, &ack, || vec![format!("active run is now {id}")])
        }
        Command::RunPipeline => {
            let ack = api(&config)?.run_pipeline().await?;
            emit(&config, &ack, || vec![format!("pipeline: {}", ack.status)])
        }
        Command::Tab { name } => tab(&config, name),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut client = match &cli.base_url {
        Some(base_url) => ClientConfig::new(base_url)?,
        None => ClientConfig::from_env()?,
    };
    if let Some(events_url) = &cli.events_url {
        client = client.with_events_url(events_url)?;
    }
    let state_dir = cli.state_dir.clone().unwrap_or_else(resolve_state_dir);
    Ok(Config {
        client,
        state_dir,
        json: cli.json,
    })
}

fn init_logging(state_dir: &Path) {
    let level = std::env::var("SDLC_LOG_LEVEL")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if log_to_stdout(std::env::var("SDLC_LOG_STDOUT").ok().as_deref()) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        return;
    }
    match open_log_file(state_dir) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(err) => {
            eprintln!("log_file_error: {err}");
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::sink)
                .try_init();
        }
    }
}

fn open_log_file(state_dir: &Path) -> Result<fs::File> {
    fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create {}", state_dir.display()))?;
    let path = state_dir.join(LOG_FILE);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

/// Logs go to the state-dir file unless `SDLC_LOG_STDOUT` is switched on.
fn log_to_stdout(value: Option<&str>) -> bool {
    let Some(value) = value else {
        return false;
    };
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn api(config: &Config) -> Result<HttpApi> {
    Ok(HttpApi::new(config.client.clone())?)
}

fn preferences(config: &Config) -> FilePreferences {
    FilePreferences::in_state_dir(&config.state_dir)
}

fn emit<T: Serialize>(
    config: &Config,
    value: &T,
    text: impl FnOnce() -> Vec<String>,
) -> Result<()> {
    if config.json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        for line in text() {
            println!("{line}");
        }
    }
    Ok(())
}

async fn create(config: &Config, args: CreateArgs) -> Result<()> {
    let request = CreateExecutionRequest {
        run_id: args.run,
        kind: if args.issue.is_some() {
            ExecutionType::Issue
        } else {
            ExecutionType::Phase
        },
        phase: args.phase,
        issue_id: args.issue,
        params: args.params.into_iter().collect(),
    };
    let created = api(config)?.create_execution(&request).await?;
    preferences(config)
        .save(SELECTED_EXECUTION_KEY, &created.id)
        .context("Failed to remember the new execution")?;
    emit(config, &created, || {
        vec![format!("created {} ({}) session {}", created.id, created.status, created.session_id)]
    })
}

fn tab(config: &Config, name: Option<String>) -> Result<()> {
    let prefs = preferences(config);
    let current = match name {
        Some(name) => {
            let tab: DashboardTab = name.parse().map_err(|err: String| anyhow!(err))?;
            tab.save(&prefs)?;
            tab
        }
        None => DashboardTab::load(&prefs),
    };
    emit(config, &current.as_str(), || vec![current.to_string()])
}

async fn watch(config: &Config, execution: Option<String>) -> Result<()> {
    let client: Arc<dyn SdlcApi> = Arc::new(api(config)?);
    let prefs: Arc<dyn PreferenceStore> = Arc::new(preferences(config));
    let mut dashboard = Dashboard::new(
        client,
        config.client.events_url.clone(),
        prefs,
        SyncTimings::default(),
    );
    dashboard.start();
    if execution.is_some() {
        dashboard.select_execution(execution);
    }

    let log = dashboard.channel().log();
    let mut cursor = log.cursor();
    let mut appended = log.subscribe();
    let mut liveness = dashboard.channel().liveness();
    let mut status_rx = dashboard.status().subscribe();
    let mut runs_rx = dashboard.runs().subscribe();
    let mut view_rx = dashboard.reconciler().subscribe();
    let mut printer = ViewPrinter::default();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Ok(()) = liveness.changed() => {
                let connected = *liveness.borrow_and_update();
                println!("channel {}", if connected { "connected" } else { "disconnected" });
            }
            Ok(()) = status_rx.changed() => {
                let summary = status_rx.borrow_and_update().clone();
                if let Some(summary) = summary {
                    println!(
                        "active run {} phase {} ({})",
                        summary.active_run_id().unwrap_or("-"),
                        summary.phase,
                        summary.phase_status
                    );
                }
            }
            Ok(()) = runs_rx.changed() => {
                let count = runs_rx.borrow_and_update().runs.len();
                println!("runs: {count}");
            }
            Ok(()) = view_rx.changed() => {
                let view = view_rx.borrow_and_update().clone();
                for line in printer.update(&view) {
                    println!("{line}");
                }
            }
            Ok(()) = appended.changed() => {
                appended.borrow_and_update();
                let batch = log.read_since(&mut cursor);
                if batch.skipped > 0 {
                    println!("({} events dropped)", batch.skipped);
                }
                let active = dashboard.status().active_run_id();
                for event in batch.events.iter().filter(|event| {
                    active.as_deref().map(|run_id| event.is_for_run(run_id)).unwrap_or(true)
                }) {
                    println!("{}", format_event(event));
                }
            }
        }
    }
    dashboard.stop();
    Ok(())
}

/// Turns successive reconciler views into printable changes.
#[derive(Default)]
struct ViewPrinter {
    execution_id: Option<String>,
    status: Option<String>,
    messages: usize,
    error: Option<String>,
}

impl ViewPrinter {
    fn update(&mut self, view: &ExecutionView) -> Vec<String> {
        let mut lines = Vec::new();
        if view.execution_id != self.execution_id {
            *self = ViewPrinter {
                execution_id: view.execution_id.clone(),
                ..ViewPrinter::default()
            };
            if let Some(execution_id) = &view.execution_id {
                lines.push(format!("selected execution {execution_id}"));
            }
        }
        if let Some(execution) = &view.execution {
            let status = execution.status.to_string();
            if self.status.as_deref() != Some(status.as_str()) {
                lines.push(format!("execution {} {}", execution.id, status));
                self.status = Some(status);
            }
            for message in execution.messages.iter().skip(self.messages) {
                lines.push(format!("  [{:?}] {}", message.role, message.content));
            }
            self.messages = self.messages.max(execution.messages.len());
        }
        if view.error != self.error {
            if let Some(error) = &view.error {
                lines.push(format!("execution fetch failed: {error}"));
            }
            self.error = view.error.clone();
        }
        lines
    }
}

fn format_time(value: &DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M").to_string()
}

fn format_run(run: &Run) -> String {
    format!(
        "{}  {} ({})  issues={}  created {}",
        run.id,
        run.phase,
        run.phase_status,
        run.issue_count,
        format_time(&run.created_at)
    )
}

fn format_execution(execution: &Execution) -> String {
    format!(
        "{}  {}  {}  {}",
        execution.id,
        execution.label(),
        execution.status,
        format_time(&execution.created_at)
    )
}

fn format_tree(executions: &[Execution]) -> Vec<String> {
    let mut by_run: HashMap<&str, Vec<Execution>> = HashMap::new();
    for execution in executions {
        by_run
            .entry(execution.run_id.as_str())
            .or_default()
            .push(execution.clone());
    }
    let mut runs: Vec<&str> = by_run.keys().copied().collect();
    runs.sort();
    let mut lines = Vec::new();
    for run_id in runs {
        lines.push(format!("run {run_id}"));
        for group in sdlc_sync::group_executions(&by_run[run_id]) {
            lines.push(format!("  {}", format_execution(&group.parent)));
            for child in &group.children {
                lines.push(format!("    {}", format_execution(child)));
            }
        }
    }
    lines
}

fn format_transcript(execution: &Execution) -> Vec<String> {
    let mut lines = vec![format_execution(execution)];
    lines.extend(execution.messages.iter().map(|message| {
        format!(
            "  {} [{:?}] {}",
            format_time(&message.timestamp),
            message.role,
            message.content
        )
    }));
    lines
}

fn format_event(event: &Event) -> String {
    match event.execution_id() {
        Some(execution_id) => format!("event {} {execution_id}", event.event_type()),
        None => format!("event {}", event.event_type()),
    }
}
