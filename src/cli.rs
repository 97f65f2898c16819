//! Command-line interface for codeloop, built on clap.
//!
//! [`Cli`] carries the global flags (`--config`, `--model`, `--verbose`) and one
//! [`Command`]: `run`, `status` or `doctor`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use codeloop::language::Language;
use codeloop::state_machine::TaskSpec;
use codeloop::task_file;

/// Generate code with an LLM, run it in a sandbox, review it, retry until it passes.
#[derive(Debug, Parser)]
#[command(name = "codeloop", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to $CODELOOP_CONFIG or ./codeloop.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the generation model for this session.
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Enable debug logging for codeloop.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one job end to end and print its audit record.
    Run(RunArgs),

    /// Show a persisted job.
    Status {
        /// Job id printed by `run`.
        job_id: String,
    },

    /// Check the sandbox backend and the per-language runtimes.
    Doctor,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// What the program should do.
    pub description: Option<String>,

    /// Task file: JSON, TOML, or plain text (`.txt`, may hold numbered
    /// questions). Flags override its fields.
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Target language. Overrides the task file; python when neither names one.
    #[arg(long, short)]
    pub language: Option<Language>,

    /// User the job is accounted to.
    #[arg(long, default_value = "local")]
    pub user: String,

    /// Extra requirements appended to the description.
    #[arg(long)]
    pub requirements: Option<String>,

    /// Text fed to the program's stdin.
    #[arg(long)]
    pub stdin: Option<String>,

    /// Expected stdout, compared after whitespace normalization.
    #[arg(long)]
    pub expected_output: Option<String>,

    #[arg(long)]
    pub expected_exit_code: Option<i64>,

    /// Attempt ceiling for this job.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Wall-clock limit per execution, in milliseconds.
    #[arg(long)]
    pub timeout_ms: Option<u64>,
}

/// One job to submit, in file order.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedTask {
    pub language: Language,
    pub task: TaskSpec,
}

impl RunArgs {
    /// Builds the tasks from `--file` (if any) and the flags.
    pub fn tasks(&self) -> Result<Vec<PlannedTask>> {
        let entries = match &self.file {
            Some(path) => read_task_file(path)?,
            None => vec![(None, TaskSpec::default())],
        };
        if entries.len() > 1 && self.description.is_some() {
            bail!("a description cannot be combined with a multi-question task file");
        }
        entries
            .into_iter()
            .map(|(language, task)| {
                Ok(PlannedTask {
                    language: self.language.or(language).unwrap_or(Language::Python),
                    task: self.apply_flags(task)?,
                })
            })
            .collect()
    }

    fn apply_flags(&self, mut task: TaskSpec) -> Result<TaskSpec> {
        if let Some(description) = &self.description {
            task.description = description.clone();
        }
        if task.description.trim().is_empty() {
            bail!("a description is required (positional argument or --file)");
        }
        if self.requirements.is_some() {
            task.requirements = self.requirements.clone();
        }
        if self.stdin.is_some() {
            task.stdin = self.stdin.clone();
        }
        if self.expected_output.is_some() {
            task.expected_output = self.expected_output.clone();
        }
        if self.expected_exit_code.is_some() {
            task.expected_exit_code = self.expected_exit_code;
        }
        if self.max_attempts.is_some() {
            task.max_attempts = self.max_attempts;
        }
        if self.timeout_ms.is_some() {
            task.limits.timeout_ms = self.timeout_ms;
        }
        Ok(task)
    }
}

fn read_task_file(path: &Path) -> Result<Vec<(Option<Language>, TaskSpec)>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parse_error = || format!("failed to parse {}", path.display());
    let entries = match path.extension().and_then(|ext| ext.to_str()) {
        Some("txt") => task_file::parse(&contents)
            .with_context(parse_error)?
            .into_iter()
            .map(|entry| (entry.language, entry.task))
            .collect(),
        Some("toml") => vec![(None, toml::from_str(&contents).with_context(parse_error)?)],
        _ => vec![(None, serde_json::from_str(&contents).with_context(parse_error)?)],
    };
    Ok(entries)
}
