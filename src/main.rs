mod cli;
mod ui;

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{info, warn};

use cli::{Cli, Command, PlannedTask, RunArgs};
use codeloop::config::CodeloopConfig;
use codeloop::coordinator::JobCoordinator;
use codeloop::language::Language;
use codeloop::sandbox;
use codeloop::state_machine::{AuditRecord, JobSnapshot, JobStatus, TaskSpec};
use codeloop::store::{FileJobStore, JobStore};
use codeloop::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => CodeloopConfig::load_from(path),
        None => CodeloopConfig::load(),
    }
    .context("failed to load configuration")?;
    if let Some(model) = &cli.model {
        config.generation.model = model.clone();
    }
    logging::init(&config.logging, cli.verbose);

    match cli.command {
        Command::Run(args) => run(&config, &args).await,
        Command::Status { job_id } => status(&config, &job_id).await,
        Command::Doctor => doctor(&config).await,
    }
}

async fn run(config: &CodeloopConfig, args: &RunArgs) -> Result<()> {
    let tasks = args.tasks()?;
    let coordinator = JobCoordinator::from_config(config)
        .await
        .context("failed to start the pipeline")?;

    let recovered = coordinator.recover_interrupted().await?;
    if recovered > 0 {
        warn!(recovered, "marked jobs from a previous run as interrupted");
    }

    let mut failed = Vec::new();
    for PlannedTask { language, task } in tasks {
        let result = follow(&coordinator, &args.user, language, task).await;
        match result {
            Ok((job_id, JobStatus::Done)) => info!(job_id = %job_id, "job done"),
            Ok((job_id, status)) => failed.push(format!("{job_id} ({status})")),
            Err(e) => {
                coordinator.shutdown().await;
                return Err(e);
            }
        }
    }
    coordinator.shutdown().await;

    if !failed.is_empty() {
        bail!("jobs did not pass: {}", failed.join(", "));
    }
    Ok(())
}

/// Submits one task and follows it to a terminal status.
async fn follow(
    coordinator: &JobCoordinator,
    user: &str,
    language: Language,
    task: TaskSpec,
) -> Result<(String, JobStatus)> {
    let description = task.description.clone();
    let job_id = coordinator
        .submit(user, language, task)
        .await
        .context("submission refused")?;
    info!(job_id = %job_id, %language, "job submitted");

    let mut progress = ui::JobProgress::start(&description);
    let waiter = coordinator.wait(&job_id);
    tokio::pin!(waiter);
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let snapshot = loop {
        tokio::select! {
            snapshot = &mut waiter => break snapshot?,
            _ = tokio::signal::ctrl_c() => {
                if coordinator.cancel(&job_id) {
                    progress.note("cancelling job");
                }
            }
            _ = ticker.tick() => {
                if let Ok(snapshot) = coordinator.status(&job_id).await {
                    progress.update(&snapshot);
                }
            }
        }
    };
    progress.complete(&snapshot);

    let job = coordinator.store().read_job(&job_id).await?;
    progress.print_audit(&AuditRecord::from_job(&job));
    if let Some(artifact) = &job.artifact {
        ui::print_source(&artifact.source);
    }
    Ok((job_id.clone(), snapshot.status))
}

async fn status(config: &CodeloopConfig, job_id: &str) -> Result<()> {
    let store = FileJobStore::open(&config.store.dir)
        .await
        .with_context(|| format!("failed to open {}", config.store.dir.display()))?;
    let job = store
        .read_job(job_id)
        .await
        .with_context(|| format!("failed to read job {job_id}"))?;

    println!(
        "{}",
        serde_json::to_string_pretty(&JobSnapshot::from(&job))?
    );
    if job.status.is_terminal() {
        ui::print_audit(&AuditRecord::from_job(&job));
    }
    Ok(())
}

async fn doctor(config: &CodeloopConfig) -> Result<()> {
    let sandbox = sandbox::from_config(&config.sandbox).context("failed to reach the sandbox backend")?;
    let health = sandbox.health().await;
    ui::print_health(&health, !config.generation.api_key.is_empty());

    if !health.available || health.runtimes.values().any(|present| !present) {
        bail!("sandbox is not ready");
    }
    Ok(())
}
