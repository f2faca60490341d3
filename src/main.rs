use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use conductor::events::{EngineEvent, Subscription};
use conductor::plan::{Plan, PlanReport};
use conductor::state::StateStore;
use conductor::{Engine, EngineConfig, Error, Result, TaskStatus};

/// Conductor - dependency-aware task orchestration across heterogeneous agents
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)\n    CONDUCTOR_LOG_JSON=1  Emit logs as JSON on stderr\n    RUST_LOG              Override the log filter")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (default: ~/.conductor/conductor.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Check a plan file for shape errors and cycles
    Validate {
        plan: PathBuf,
    },

    /// Run a plan against simulated agents
    Run {
        plan: PathBuf,

        /// Print events and the final report as JSON lines
        #[arg(long)]
        json: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },

    /// Summarize the snapshot in the configured state file
    Status,

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    conductor::log::init_with_debug(cli.debug);

    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Validate { plan } => run_validate(&plan),
        Command::Run {
            plan,
            json,
            timeout_secs,
        } => run_plan(config, &plan, json, Duration::from_secs(timeout_secs)),
        Command::Status => run_status(&config),
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) if !path.exists() => Err(Error::Validation(format!(
            "Config file not found: {}",
            path.display()
        ))),
        Some(path) => EngineConfig::load_from(path),
        None => EngineConfig::load(),
    }
}

fn run_validate(path: &Path) -> Result<ExitCode> {
    let plan = Plan::load(path)?;
    let compiled = plan.compile()?;

    println!(
        "{}: {} tasks, {} agents",
        plan.name.as_deref().unwrap_or("plan"),
        compiled.specs.len(),
        plan.agents.len()
    );
    println!("Order:");
    for (i, key) in compiled.order.iter().enumerate() {
        println!("  {:>3}. {}", i + 1, key);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_plan(config: EngineConfig, path: &Path, json: bool, deadline: Duration) -> Result<ExitCode> {
    let plan = Plan::load(path)?;
    plan.compile()?;
    info!(plan = %path.display(), "running plan");

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let engine = Engine::new(config)?;
        let stop = CancellationToken::new();
        let printer = tokio::spawn(print_events(engine.subscribe(), json, stop.clone()));

        engine.start();
        let report = plan.run(&engine, deadline).await;
        engine.shutdown().await?;

        stop.cancel();
        if let Err(e) = printer.await {
            debug!(error = %e, "event printer ended abnormally");
        }
        report
    })?;

    print_report(&report, json)?;
    if report.settled && report.all_completed() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

async fn print_events(mut events: Subscription, json: bool, stop: CancellationToken) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => print_event(&event, json),
                None => break,
            },
        }
    }
    for event in events.drain() {
        print_event(&event, json);
    }
}

fn print_event(event: &EngineEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => debug!(error = %e, "unserializable event"),
        }
        return;
    }

    let subject = match (event.task_id, event.workflow_id) {
        (Some(task_id), _) => task_id.short(),
        (None, Some(workflow_id)) => workflow_id.short(),
        (None, None) => "-".to_string(),
    };
    match &event.detail {
        Some(detail) => println!(
            "{} {:<18} {} {} ({})",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.kind.to_string(),
            subject,
            event.status,
            detail
        ),
        None => println!(
            "{} {:<18} {} {}",
            event.timestamp.format("%H:%M:%S%.3f"),
            event.kind.to_string(),
            subject,
            event.status
        ),
    }
}

fn print_report(report: &PlanReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(report)?);
        return Ok(());
    }

    println!();
    println!("Plan: {}", report.name.as_deref().unwrap_or("unnamed"));
    for task in &report.tasks {
        let line = format!(
            "  {:<20} {:<10} attempts={}",
            task.key,
            format_status(task.status),
            task.attempts
        );
        match &task.error {
            Some(error) => println!("{}  {}", line, error),
            None => println!("{}", line),
        }
    }
    let m = &report.metrics;
    println!();
    println!(
        "  completed={} failed={} cancelled={} success_rate={:.2} avg_completion={:?}",
        m.completed_tasks,
        m.failed_tasks,
        m.cancelled_tasks,
        m.success_rate,
        m.average_completion_time
    );
    if !report.settled {
        println!("  timed out with {} tasks still ready or running", m.ready_tasks + m.running_tasks);
    }
    Ok(())
}

fn run_status(config: &EngineConfig) -> Result<ExitCode> {
    let Some(path) = config.state_file() else {
        println!("No state_path configured.");
        return Ok(ExitCode::SUCCESS);
    };
    let Some(snapshot) = StateStore::new(&path).load_sync()? else {
        println!("No snapshot at {}", path.display());
        return Ok(ExitCode::SUCCESS);
    };

    println!("Snapshot: {}", path.display());
    println!("  taken_at:  {}", snapshot.taken_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  workflows: {}", snapshot.workflows.len());
    println!("  agents:    {}", snapshot.agents.len());
    println!("  tasks:     {}", snapshot.tasks.len());
    for status in [
        TaskStatus::Pending,
        TaskStatus::Ready,
        TaskStatus::Assigned,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ] {
        let count = snapshot.count(status);
        if count > 0 {
            println!("    {:<10} {}", status, count);
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn format_status(status: TaskStatus) -> String {
    match status {
        TaskStatus::Completed => format!("\x1b[32m{}\x1b[0m", status),
        TaskStatus::Failed => format!("\x1b[31m{}\x1b[0m", status),
        TaskStatus::Cancelled => format!("\x1b[35m{}\x1b[0m", status),
        TaskStatus::Running | TaskStatus::Assigned => format!("\x1b[33m{}\x1b[0m", status),
        TaskStatus::Pending | TaskStatus::Ready => format!("\x1b[90m{}\x1b[0m", status),
    }
}
