//! CLI binary for running and inspecting codeloom sessions.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use codeloom_pipeline::{
    load_checkpoint, load_task_checkpoint, resume_session, run_session, AgentCommand, Collaborators, EngineConfig,
    ExecutionRunner, FileContextProvider, FsArtifactStore, PipelineEvent, PipelineExecutor,
    SessionFilter, SessionManager, SessionOutcome, SessionReport, SessionStatus, ShellTestRunner,
    UncheckedRunner,
};
use codeloom_types::TaskStatus;

#[derive(Parser)]
#[command(name = "codeloom", version, about = "Plan, generate, test and accumulate code in isolated sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Directory holding session workspaces and the session registry
    #[arg(long, global = true, default_value = "workspaces")]
    root: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a new session, or resume an earlier one
    Run {
        /// Requirements text, or a path to a file containing them
        requirements: Option<String>,

        /// Session label; the id is derived from it
        #[arg(short, long, default_value = "session")]
        label: String,

        /// Resume the latest session with this label
        #[arg(long, conflicts_with = "session")]
        resume: bool,

        /// Resume the session with this id
        #[arg(long)]
        session: Option<String>,

        /// Agent command used for planning and generation (JSON on stdin/stdout)
        #[arg(long)]
        agent_cmd: Option<String>,

        /// Shell command validating each file; exit status zero passes
        #[arg(long)]
        test_cmd: Option<String>,

        /// Shell command checking each file's syntax before the test command
        #[arg(long, requires = "test_cmd")]
        syntax_cmd: Option<String>,

        /// Timeout in seconds for each agent or test command
        #[arg(long, default_value = "300")]
        timeout_secs: u64,

        /// Engine configuration file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Failed attempts allowed per task. Fixed when a session opens, so it
        /// cannot be combined with resuming.
        #[arg(long, conflicts_with_all = ["resume", "session"])]
        max_attempts: Option<usize>,

        /// Maximum stage invocations before the session fails. Prevents runaway loops.
        #[arg(long)]
        max_steps: Option<usize>,
    },

    /// List sessions in the registry, newest first
    List {
        #[arg(short, long)]
        label: Option<String>,

        /// active, complete, failed or abandoned
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one session and its latest checkpoint
    Show {
        id: String,

        /// Show the checkpoint written when this task finished instead
        #[arg(long)]
        task: Option<usize>,

        /// Print the checkpoint as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove finished sessions older than N days, including their workspaces
    Cleanup {
        #[arg(long)]
        days: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let manager = SessionManager::new(&cli.root);
    match cli.command {
        Commands::Run {
            requirements,
            label,
            resume,
            session,
            agent_cmd,
            test_cmd,
            syntax_cmd,
            timeout_secs,
            config,
            max_attempts,
            max_steps,
        } => {
            let config = load_config(config.as_deref(), max_attempts, max_steps)?;
            let collaborators = build_collaborators(
                agent_cmd.as_deref(),
                test_cmd.as_deref(),
                syntax_cmd.as_deref(),
                Duration::from_secs(timeout_secs),
            )?;
            let target = match (session, resume) {
                (Some(id), _) => RunTarget::Resume(id),
                (None, true) => match manager.latest(&label).await? {
                    Some(record) => RunTarget::Resume(record.id),
                    None => anyhow::bail!("No session with label '{}' to resume", label),
                },
                (None, false) => {
                    let Some(requirements) = requirements else {
                        anyhow::bail!("Requirements are required unless resuming");
                    };
                    RunTarget::New {
                        requirements: read_requirements(&requirements)?,
                        label,
                    }
                }
            };
            cmd_run(&manager, &collaborators, config, target).await?;
        }
        Commands::List { label, status } => {
            let status = status.map(|s| s.parse::<SessionStatus>()).transpose()?;
            cmd_list(&manager, SessionFilter { label, status }).await?;
        }
        Commands::Show { id, task, json } => {
            cmd_show(&manager, &id, task, json).await?;
        }
        Commands::Cleanup { days } => {
            let removed = manager.cleanup(chrono::Duration::days(i64::from(days))).await?;
            println!("Removed {} session(s)", removed.len());
            for id in removed {
                println!("  {}", id);
            }
        }
    }

    Ok(())
}

enum RunTarget {
    New { requirements: String, label: String },
    Resume(String),
}

fn load_config(
    path: Option<&Path>,
    max_attempts: Option<usize>,
    max_steps: Option<usize>,
) -> anyhow::Result<EngineConfig> {
    let mut config = match path {
        Some(p) => EngineConfig::load(p)?,
        None => EngineConfig::default(),
    };
    if let Some(n) = max_attempts {
        config.max_attempts = n;
    }
    if let Some(n) = max_steps {
        config.iteration_budget = n;
    }
    config.validate()?;
    Ok(config)
}

fn build_collaborators(
    agent_cmd: Option<&str>,
    test_cmd: Option<&str>,
    syntax_cmd: Option<&str>,
    timeout: Duration,
) -> anyhow::Result<Collaborators> {
    let Some(agent) = agent_cmd.and_then(AgentCommand::from_command_line) else {
        anyhow::bail!("--agent-cmd is required: it plans tasks and generates code");
    };
    let agent = Arc::new(agent.with_timeout(timeout));
    let runner: Arc<dyn ExecutionRunner> = match test_cmd {
        Some(cmd) => {
            let mut runner = ShellTestRunner::new(cmd).with_timeout(timeout);
            if let Some(syntax) = syntax_cmd {
                runner = runner.with_syntax_check(syntax);
            }
            Arc::new(runner)
        }
        None => {
            tracing::warn!("No --test-cmd given; every fragment will be accepted unchecked");
            Arc::new(UncheckedRunner)
        }
    };
    Ok(Collaborators {
        planner: agent.clone(),
        context: Arc::new(FileContextProvider),
        generator: agent.clone(),
        runner,
        tests: agent,
        store: Arc::new(FsArtifactStore),
    })
}

/// Requirements are read from a file when the argument names one.
fn read_requirements(arg: &str) -> anyhow::Result<String> {
    let path = Path::new(arg);
    if path.is_file() {
        Ok(std::fs::read_to_string(path)?)
    } else {
        Ok(arg.to_string())
    }
}

async fn cmd_run(
    manager: &SessionManager,
    collaborators: &Collaborators,
    config: EngineConfig,
    target: RunTarget,
) -> anyhow::Result<()> {
    let token = CancellationToken::new();
    let executor = PipelineExecutor::with_collaborators(collaborators, config)
        .with_cancellation(token.clone());

    let ctrl_c = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted; stopping after the current stage");
            ctrl_c.cancel();
        }
    });

    let mut events = executor.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::TaskAdvanced { task, status, .. } => {
                    println!("  task {} {}", task, status);
                }
                PipelineEvent::AttemptFailed { task, attempt, kind, .. } => {
                    println!("  task {} attempt {} failed ({})", task, attempt, kind);
                }
                _ => {}
            }
        }
    });

    let report = match target {
        RunTarget::New { requirements, label } => {
            let (handle, report) = run_session(manager, &executor, &label, &requirements).await?;
            println!("Session: {}", handle.id);
            println!("Workspace: {}", handle.workspace.display());
            report
        }
        RunTarget::Resume(id) => {
            println!("Resuming session: {}", id);
            resume_session(manager, &executor, &id).await?
        }
    };
    drop(executor);
    let _ = printer.await;

    print_report(&report);
    if !report.is_saved() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    println!();
    match &report.outcome {
        SessionOutcome::Saved => println!("Session saved"),
        SessionOutcome::Failed(f) => {
            let stage = f.last_stage.map_or_else(|| "none".to_string(), |s| s.to_string());
            println!("Session failed in phase {} (last stage: {})", f.phase.as_str(), stage);
            println!("Error: {}", f.error);
        }
        SessionOutcome::Cancelled { .. } => println!("Session cancelled; resume it with --session"),
    }
    println!(
        "Tasks: {} passed, {} abandoned, {} total",
        report.passed_tasks(),
        report.abandoned_tasks(),
        report.state.tasks.len()
    );
    println!("Stage invocations: {}", report.invocations);
    for path in &report.state.saved_artifacts {
        println!("  wrote {}", path);
    }
}

async fn cmd_list(manager: &SessionManager, filter: SessionFilter) -> anyhow::Result<()> {
    let records = manager.list(&filter).await?;
    if records.is_empty() {
        println!("No sessions");
        return Ok(());
    }
    for record in records {
        println!(
            "{:<40} {:<10} {}",
            record.id,
            record.status.as_str(),
            record.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_show(
    manager: &SessionManager,
    id: &str,
    task: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let record = manager.get(id).await?;
    let checkpoint = match task {
        Some(index) => load_task_checkpoint(&record.workspace, index).await?,
        None => load_checkpoint(&record.workspace).await?,
    };
    if json {
        match checkpoint {
            Some(cp) => println!("{}", serde_json::to_string_pretty(&cp)?),
            None => println!("null"),
        }
        return Ok(());
    }

    println!("Session: {}", record.id);
    println!("Label: {}", record.label);
    println!("Status: {}", record.status.as_str());
    println!("Created: {}", record.created_at.to_rfc3339());
    if let Some(done) = record.completed_at {
        println!("Completed: {}", done.to_rfc3339());
    }
    println!("Workspace: {}", record.workspace.display());

    let Some(cp) = checkpoint else {
        match task {
            Some(index) => println!("\nNo checkpoint for task {}", index),
            None => println!("\nNo checkpoint yet"),
        }
        return Ok(());
    };
    let which = if task.is_some() { "Task" } else { "Latest" };
    println!("\n{} checkpoint: task {} ({}) at {}", which, cp.task, cp.tag, cp.timestamp);
    println!("Phase: {}", cp.state.phase.as_str());
    for task in &cp.state.tasks {
        let mark = match task.status {
            TaskStatus::Passed => "x",
            TaskStatus::Abandoned => "!",
            TaskStatus::Pending => " ",
        };
        println!("  [{}] {} {}: {}", mark, task.index, task.target_file, task.description);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_attempts_cannot_change_a_resumed_session() {
        let resumed = Cli::try_parse_from([
            "codeloom", "run", "--resume", "--label", "calc", "--max-attempts", "5",
        ]);
        assert!(resumed.is_err());

        let by_id = Cli::try_parse_from([
            "codeloom", "run", "--session", "calc_1", "--max-attempts", "5",
        ]);
        assert!(by_id.is_err());

        let fresh = Cli::try_parse_from(["codeloom", "run", "build it", "--max-attempts", "5"]);
        assert!(fresh.is_ok());
    }

    #[test]
    fn show_accepts_a_task_index() {
        let cli = Cli::try_parse_from(["codeloom", "show", "calc_1", "--task", "2"]).unwrap();
        assert!(matches!(cli.command, Commands::Show { task: Some(2), json: false, .. }));
    }

    #[test]
    fn syntax_check_needs_a_test_command() {
        let cli = Cli::try_parse_from(["codeloom", "run", "x", "--syntax-cmd", "python -m py_compile"]);
        assert!(cli.is_err());
    }
}
