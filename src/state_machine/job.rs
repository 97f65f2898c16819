use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::state::LoopState;
use crate::agent::Feedback;
use crate::language::Language;
use crate::sandbox::{ExecutionResult, LimitOverrides};

/// Externally visible lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Error,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error | JobStatus::Cancelled)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What the user asked for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<String>,
    /// Fed to the candidate's stdin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_exit_code: Option<i64>,
    /// Overrides the configured retry ceiling for this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub limits: LimitOverrides,
}

impl TaskSpec {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_expected_output(mut self, expected: impl Into<String>) -> Self {
        self.expected_output = Some(expected.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Why a candidate failed review. Used verbatim as the feedback category
/// sent to the next generation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    WrongOutput,
    CompileError,
    RuntimeError,
    Timeout,
    IncompleteSpecMatch,
    /// Not the candidate's fault; never consumes an attempt.
    SandboxUnavailable,
}

impl FailureCategory {
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, FailureCategory::SandboxUnavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::WrongOutput => "wrong_output",
            FailureCategory::CompileError => "compile_error",
            FailureCategory::RuntimeError => "runtime_error",
            FailureCategory::Timeout => "timeout",
            FailureCategory::IncompleteSpecMatch => "incomplete_spec_match",
            FailureCategory::SandboxUnavailable => "sandbox_unavailable",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub category: FailureCategory,
    pub detail: String,
}

/// Pass/fail decision for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl ReviewVerdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            failure: None,
        }
    }

    pub fn fail(category: FailureCategory, detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            failure: Some(FailureReason {
                category,
                detail: detail.into(),
            }),
        }
    }

    pub fn category(&self) -> Option<FailureCategory> {
        self.failure.as_ref().map(|f| f.category)
    }
}

/// One generate/execute/review pass. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based, strictly increasing within a job.
    pub sequence: u32,
    pub source: String,
    pub result: ExecutionResult,
    pub verdict: ReviewVerdict,
    /// Feedback handed to the next generation request, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<Feedback>,
    pub recorded_at: DateTime<Utc>,
}

/// Final source and execution of a job that passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub source: String,
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorCategory {
    /// Every attempt failed review.
    MaxRetriesExceeded,
    /// The platform could not complete the job.
    Infrastructure,
    /// The process stopped while the job was active.
    Interrupted,
}

impl std::fmt::Display for JobErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobErrorCategory::MaxRetriesExceeded => write!(f, "max_retries_exceeded"),
            JobErrorCategory::Infrastructure => write!(f, "infrastructure"),
            JobErrorCategory::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Terminal error classification of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub category: JobErrorCategory,
    /// The last candidate failure, so "your code failed" stays visible even
    /// when the job ended for another reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureReason>,
    pub message: String,
}

/// Exponential backoff used for infrastructure retries and LLM call retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries before giving up.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        2u64.checked_pow(attempt.saturating_sub(1))
            .map_or(u64::MAX, |factor| self.base_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobStateError {
    #[error("job status cannot move from {from} to {to}")]
    InvalidStatus { from: JobStatus, to: JobStatus },

    #[error("attempt {got} recorded out of order, expected {expected}")]
    OutOfOrderAttempt { expected: u32, got: u32 },

    #[error("attempt {sequence} exceeds the retry ceiling of {max_attempts}")]
    CeilingExceeded { sequence: u32, max_attempts: u32 },
}

/// One submitted code-generation-and-verification request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub user_id: String,
    pub language: Language,
    pub task: TaskSpec,
    pub status: JobStatus,
    /// Sequence number of the current attempt; 0 before the first one.
    pub iteration: u32,
    pub max_attempts: u32,
    /// Infrastructure failures absorbed so far; never counted as attempts.
    pub infra_failures: u32,
    pub attempts: Vec<Attempt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a queued job. The task's own ceiling wins over `default_max_attempts`.
    pub fn new(user_id: String, language: Language, task: TaskSpec, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        let max_attempts = task.max_attempts.unwrap_or(default_max_attempts).max(1);
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            language,
            task,
            status: JobStatus::Queued,
            iteration: 0,
            max_attempts,
            infra_failures: 0,
            attempts: Vec::new(),
            artifact: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the status forward. Terminal statuses are final and nothing goes
    /// back to `Queued`.
    pub fn set_status(&mut self, to: JobStatus) -> Result<(), JobStateError> {
        if self.status == to {
            return Ok(());
        }
        if self.status.is_terminal() || to == JobStatus::Queued {
            return Err(JobStateError::InvalidStatus {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    /// Appends an attempt; sequence numbers must be consecutive and within the ceiling.
    pub fn push_attempt(&mut self, attempt: Attempt) -> Result<(), JobStateError> {
        let expected = self.attempts.len() as u32 + 1;
        if attempt.sequence != expected {
            return Err(JobStateError::OutOfOrderAttempt {
                expected,
                got: attempt.sequence,
            });
        }
        if attempt.sequence > self.max_attempts {
            return Err(JobStateError::CeilingExceeded {
                sequence: attempt.sequence,
                max_attempts: self.max_attempts,
            });
        }
        self.attempts.push(attempt);
        self.touch();
        Ok(())
    }

    /// The most recent candidate failure, if any attempt failed.
    pub fn last_failure(&self) -> Option<&FailureReason> {
        self.attempts
            .iter()
            .rev()
            .find_map(|attempt| attempt.verdict.failure.as_ref())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Read-only view returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub job_id: String,
    pub user_id: String,
    pub language: Language,
    pub status: JobStatus,
    pub iteration: u32,
    pub max_attempts: u32,
    pub attempts: usize,
    pub infra_failures: u32,
    /// Loop state of a running job, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<LoopState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Category of the most recent failing attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureCategory>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Job> for JobSnapshot {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            user_id: job.user_id.clone(),
            language: job.language,
            status: job.status,
            iteration: job.iteration,
            max_attempts: job.max_attempts,
            attempts: job.attempts.len(),
            infra_failures: job.infra_failures,
            phase: None,
            error: job.error.clone(),
            last_failure: job.last_failure().map(|f| f.category),
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Per-attempt line of an [`AuditRecord`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptSummary {
    pub sequence: u32,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<FailureCategory>,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
}

/// Structured audit record produced at job completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: String,
    pub user_id: String,
    pub language: Language,
    pub status: JobStatus,
    pub attempts: Vec<AttemptSummary>,
    pub iteration: u32,
    pub max_attempts: u32,
    pub infra_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    /// Generate an audit record from a finished job.
    pub fn from_job(job: &Job) -> Self {
        let duration = job.updated_at - job.created_at;
        Self {
            job_id: job.id.clone(),
            user_id: job.user_id.clone(),
            language: job.language,
            status: job.status,
            attempts: job
                .attempts
                .iter()
                .map(|a| AttemptSummary {
                    sequence: a.sequence,
                    passed: a.verdict.passed,
                    category: a.verdict.category(),
                    exit_code: a.result.exit_code,
                    duration_ms: a.result.duration_ms,
                })
                .collect(),
            iteration: job.iteration,
            max_attempts: job.max_attempts,
            infra_failures: job.infra_failures,
            error: job.error.clone(),
            started_at: job.created_at,
            completed_at: job.updated_at,
            duration_ms: duration.num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CapturedOutput, ExecutionOutcome};

    fn make_job(max_attempts: u32) -> Job {
        Job::new(
            "alice".into(),
            Language::Python,
            TaskSpec::new("print the sum of two numbers"),
            max_attempts,
        )
    }

    fn attempt(sequence: u32, verdict: ReviewVerdict) -> Attempt {
        Attempt {
            sequence,
            source: "print(1)".into(),
            result: ExecutionResult {
                exit_code: Some(0),
                stdout: CapturedOutput::from_text("1\n"),
                stderr: CapturedOutput::default(),
                duration_ms: 12,
                outcome: ExecutionOutcome::Exited,
                detail: None,
            },
            verdict,
            feedback: None,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn job_creation_defaults() {
        let job = make_job(3);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.iteration, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.attempts.is_empty());
        assert!(job.artifact.is_none());
    }

    #[test]
    fn task_ceiling_overrides_default() {
        let job = Job::new(
            "bob".into(),
            Language::Go,
            TaskSpec::new("hello").with_max_attempts(5),
            3,
        );
        assert_eq!(job.max_attempts, 5);

        let zero = Job::new("bob".into(), Language::Go, TaskSpec::new("x"), 0);
        assert_eq!(zero.max_attempts, 1);
    }

    #[test]
    fn terminal_status_is_final() {
        let mut job = make_job(3);
        job.set_status(JobStatus::Running).unwrap();
        job.set_status(JobStatus::Done).unwrap();
        let err = job.set_status(JobStatus::Running).unwrap_err();
        assert_eq!(
            err,
            JobStateError::InvalidStatus {
                from: JobStatus::Done,
                to: JobStatus::Running
            }
        );
        assert!(job.set_status(JobStatus::Cancelled).is_err());
    }

    #[test]
    fn status_never_returns_to_queued() {
        let mut job = make_job(3);
        job.set_status(JobStatus::Running).unwrap();
        assert!(job.set_status(JobStatus::Queued).is_err());
    }

    #[test]
    fn attempts_must_be_consecutive_and_bounded() {
        let mut job = make_job(2);
        assert_eq!(
            job.push_attempt(attempt(2, ReviewVerdict::pass())),
            Err(JobStateError::OutOfOrderAttempt { expected: 1, got: 2 })
        );
        job.push_attempt(attempt(1, ReviewVerdict::fail(FailureCategory::WrongOutput, "got 3")))
            .unwrap();
        job.push_attempt(attempt(2, ReviewVerdict::pass())).unwrap();
        assert_eq!(
            job.push_attempt(attempt(3, ReviewVerdict::pass())),
            Err(JobStateError::CeilingExceeded {
                sequence: 3,
                max_attempts: 2
            })
        );
    }

    #[test]
    fn last_failure_skips_passing_attempts() {
        let mut job = make_job(3);
        job.push_attempt(attempt(1, ReviewVerdict::fail(FailureCategory::RuntimeError, "boom")))
            .unwrap();
        job.push_attempt(attempt(2, ReviewVerdict::pass())).unwrap();
        assert_eq!(
            job.last_failure().map(|f| f.category),
            Some(FailureCategory::RuntimeError)
        );
        let snapshot = JobSnapshot::from(&job);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.last_failure, Some(FailureCategory::RuntimeError));
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 1000,
        };
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(2), 2000);
        assert_eq!(config.delay_for_attempt(3), 4000);
        assert_eq!(config.delay_for_attempt(4), 8000);
        assert_eq!(config.delay_for_attempt(200), u64::MAX);
    }

    #[test]
    fn audit_record_from_job() {
        let mut job = make_job(3);
        job.push_attempt(attempt(1, ReviewVerdict::fail(FailureCategory::Timeout, "slow")))
            .unwrap();
        let record = AuditRecord::from_job(&job);
        assert_eq!(record.job_id, job.id);
        assert_eq!(record.attempts.len(), 1);
        assert_eq!(record.attempts[0].category, Some(FailureCategory::Timeout));
        assert_eq!(record.max_attempts, 3);
    }

    #[test]
    fn failure_category_serializes_verbatim() {
        for (category, name) in [
            (FailureCategory::WrongOutput, "wrong_output"),
            (FailureCategory::CompileError, "compile_error"),
            (FailureCategory::RuntimeError, "runtime_error"),
            (FailureCategory::Timeout, "timeout"),
            (FailureCategory::IncompleteSpecMatch, "incomplete_spec_match"),
        ] {
            assert_eq!(serde_json::to_string(&category).unwrap(), format!("\"{name}\""));
            assert_eq!(category.to_string(), name);
            assert!(!category.is_infrastructure());
        }
        assert!(FailureCategory::SandboxUnavailable.is_infrastructure());
    }
}
