//! Terminal output: a progress spinner for `run`, styled summaries for
//! `status` and `doctor`.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use codeloop::sandbox::SandboxHealth;
use codeloop::state_machine::{AuditRecord, JobSnapshot, JobStatus};

/// Spinner that follows one job while it runs.
///
/// Failed attempts are printed above the spinner in yellow; the final
/// outcome is green for `done` and red otherwise.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    // Last iteration seen, to print each failed attempt once.
    seen_iteration: u32,
}

impl JobProgress {
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        pb.set_message(format!("QUEUED: {}", first_line(description)));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            seen_iteration: 0,
        }
    }

    /// Refreshes the spinner from a status poll.
    pub fn update(&mut self, snapshot: &JobSnapshot) {
        if snapshot.iteration > self.seen_iteration {
            if self.seen_iteration > 0
                && let Some(category) = snapshot.last_failure
            {
                self.pb.println(format!(
                    "  {} Attempt {}/{} failed: {category}",
                    self.yellow.apply_to("↻"),
                    self.seen_iteration,
                    snapshot.max_attempts
                ));
            }
            self.seen_iteration = snapshot.iteration;
        }
        let phase = snapshot
            .phase
            .map(|phase| phase.to_string())
            .unwrap_or_else(|| snapshot.status.to_string().to_uppercase());
        self.pb.set_message(format!(
            "{phase} (attempt {}/{})",
            snapshot.iteration.max(1),
            snapshot.max_attempts
        ));
    }

    pub fn note(&self, message: &str) {
        self.pb.println(format!("  {} {message}", self.yellow.apply_to("!")));
    }

    pub fn complete(&self, snapshot: &JobSnapshot) {
        self.pb.finish_and_clear();
        match (&snapshot.status, &snapshot.error) {
            (JobStatus::Done, _) => println!(
                "  {} Job {} passed on attempt {}",
                self.green.apply_to("✓"),
                snapshot.job_id,
                snapshot.iteration
            ),
            (status, Some(error)) => println!(
                "  {} Job {} {status}: {} ({})",
                self.red.apply_to("✗"),
                snapshot.job_id,
                error.category,
                error.message
            ),
            (status, None) => println!(
                "  {} Job {} {status}",
                self.red.apply_to("✗"),
                snapshot.job_id
            ),
        }
    }

    pub fn print_audit(&self, record: &AuditRecord) {
        print_audit(record);
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Done => Style::new().green().bold(),
        JobStatus::Error => Style::new().red().bold(),
        _ => Style::new().yellow(),
    }
}

/// Prints the audit record as pretty JSON under a styled header.
pub fn print_audit(record: &AuditRecord) {
    println!();
    println!("{}", status_style(record.status).apply_to("─── Audit Record ───"));
    println!(
        "{}",
        serde_json::to_string_pretty(record).unwrap_or_default()
    );
}

/// Prints the passing program.
pub fn print_source(source: &str) {
    println!();
    println!("{}", Style::new().cyan().apply_to("─── Source ───"));
    println!("{source}");
}

pub fn print_health(health: &SandboxHealth, api_key_set: bool) {
    let ok = Style::new().green().bold();
    let bad = Style::new().red().bold();
    let mark = |present: bool| {
        if present {
            ok.apply_to("✓")
        } else {
            bad.apply_to("✗")
        }
    };

    println!(
        "  {} sandbox backend: {}",
        mark(health.available),
        health.backend
    );
    if let Some(detail) = &health.detail {
        println!("      {detail}");
    }
    for (language, present) in &health.runtimes {
        println!("  {} {language} runtime", mark(*present));
    }
    println!("  {} ANTHROPIC_API_KEY", mark(api_key_set));
}
