//! Conductor CLI - drive the task orchestration engine from the shell.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use conductor_core::{
    ChainConfig, ChainStep, Execution, ExecutionStatus, Payload, ScheduleConfig, SchedulePolicy,
    StepCondition, Task, TaskPriority, TaskSpec, TaskType,
};
use conductor_execution::{handler_fn, HandlerError, HandlerRegistry};
use conductor_runtime::{Orchestrator, OrchestratorConfig};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Task orchestration engine", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a short scripted session against simulated handlers
    Demo {
        /// Print every event as JSON when done
        #[arg(long)]
        events: bool,
    },
    /// Show which follow-up tasks an execution outcome would produce
    React {
        /// Error text of the execution
        #[arg(long)]
        error: Option<String>,
        /// Source code that was run
        #[arg(long, default_value = "")]
        code: String,
        /// Language of the code
        #[arg(long, default_value = "python")]
        language: String,
        /// Execution status (success, error, timeout)
        #[arg(long, default_value = "error")]
        status: String,
        /// Captured output
        #[arg(long)]
        output: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => OrchestratorConfig::from_file(path)?,
        None => OrchestratorConfig::default(),
    };

    match cli.command {
        Commands::Demo { events } => demo(config, events).await?,
        Commands::React {
            error,
            code,
            language,
            status,
            output,
        } => {
            let execution = build_execution(code, language, &status, error, output)?;
            let orchestrator = Orchestrator::new(config, HandlerRegistry::new());
            let reactions = orchestrator.react(&execution).await;
            if reactions.is_empty() {
                println!("No reactions.");
            }
            for reaction in &reactions {
                println!("{}", serde_json::to_string_pretty(reaction)?);
                if let Some(task_id) = reaction.task_id {
                    if let Some(task) = orchestrator.queue().get(task_id).await {
                        println!("{}", serde_json::to_string_pretty(&task)?);
                    }
                }
            }
        }
        Commands::Config => {
            println!("{}", config.to_json()?);
        }
    }

    Ok(())
}

fn build_execution(
    code: String,
    language: String,
    status: &str,
    error: Option<String>,
    output: Option<String>,
) -> Result<Execution> {
    let mut execution = Execution::new(code, language);
    execution.status = match status {
        "success" => ExecutionStatus::Success,
        "error" => ExecutionStatus::Error,
        "timeout" => ExecutionStatus::Timeout,
        other => bail!("unknown execution status '{other}' (expected success, error or timeout)"),
    };
    execution.error = error;
    execution.output = output;
    Ok(execution)
}

/// Handlers that pretend to do the work.
fn simulated_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with(
            TaskType::WebSearch,
            handler_fn(|task: Task| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let mut out = Payload::new();
                out.insert("results".into(), format!("3 hits for '{}'", task.description).into());
                Ok(out)
            }),
        )
        .with(
            TaskType::CodeExecution,
            handler_fn(|task: Task| async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                if task.input.get("simulate_failure").is_some() {
                    return Err(HandlerError::failed("process exited with status 1"));
                }
                let mut out = Payload::new();
                out.insert("stdout".into(), "ok".into());
                Ok(out)
            }),
        )
        .with_fallback(handler_fn(|task: Task| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let mut out = Payload::new();
            out.insert("handled".into(), task.task_type.as_str().into());
            Ok(out)
        }))
}

async fn demo(config: OrchestratorConfig, print_events: bool) -> Result<()> {
    let orchestrator = Orchestrator::new(config, simulated_handlers());
    orchestrator.start().await;

    // Dependent tasks
    let search = orchestrator
        .enqueue(TaskSpec::new(TaskType::WebSearch, "rust async runtimes").with_priority(TaskPriority::High))
        .await?;
    let decide = orchestrator
        .enqueue(TaskSpec::new(TaskType::Decision, "pick a runtime").depends_on(search))
        .await?;
    let decided = orchestrator
        .queue()
        .wait_for(decide, Duration::from_secs(10))
        .await
        .context("decision task did not finish")?;
    info!("Decision task finished as {}", decided.status);

    // Recurring monitor
    let monitor = orchestrator
        .schedule(
            ScheduleConfig::new(
                "heartbeat",
                SchedulePolicy::interval(Duration::from_millis(200)),
                TaskSpec::new(TaskType::Monitoring, "heartbeat"),
            )
            .max_runs(3),
        )
        .await?;

    // Chain with a retry and a failure branch
    let (chain_id, results) = orchestrator
        .run_chain(
            ChainConfig::new("build and report")
                .step(
                    ChainStep::new(
                        "compile",
                        TaskSpec::new(TaskType::CodeExecution, "compile")
                            .with_input("simulate_failure", true),
                    )
                    .retry(1)
                    .on_failure("diagnose"),
                )
                .step(ChainStep::new("publish", TaskSpec::new(TaskType::Custom, "publish")))
                .step(
                    ChainStep::new("diagnose", TaskSpec::new(TaskType::Decision, "diagnose build"))
                        .when(StepCondition::IfFailure),
                ),
        )
        .await?;
    for result in &results {
        println!(
            "chain {} step {:<10} {:?} after {} attempt(s)",
            chain_id, result.step_id, result.status, result.attempts
        );
    }

    // Reaction to a failed execution
    let execution = Execution::new("import numpy as np", "python")
        .failed("ModuleNotFoundError: No module named 'numpy'");
    for reaction in orchestrator.react(&execution).await {
        println!("reaction {} -> {}", reaction.rule, reaction.action.name());
    }

    tokio::time::sleep(Duration::from_millis(800)).await;
    if let Some(scheduled) = orchestrator.scheduler().get(monitor).await {
        println!("heartbeat ran {} time(s), now {}", scheduled.run_count, scheduled.status);
    }

    orchestrator.stop().await;

    let snapshot = orchestrator.queue().state().await;
    println!(
        "queue: {} pending, {} running, {} completed, {} failed",
        snapshot.pending.len(),
        snapshot.running.len(),
        snapshot.completed.len(),
        snapshot.failed.len()
    );

    if print_events {
        for event in orchestrator.events().history() {
            println!("{}", serde_json::to_string(&event)?);
        }
    }
    Ok(())
}
