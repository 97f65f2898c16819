//! Drives one job through the generate → execute → review loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::agent::{Feedback, FeedbackLimits, Generator, Reviewer};
use crate::error::StoreError;
use crate::sandbox::{ExecutionRequest, ExecutionResult, Sandbox};
use crate::state_machine::{
    Artifact, Attempt, Job, JobStateError, LoopEvent, LoopMachine, LoopState, RetryConfig,
    ReviewVerdict, Transition,
};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("failed to record attempt: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Job(#[from] JobStateError),

    #[error("{event:?} is not valid in state {state}")]
    InvalidTransition { state: LoopState, event: LoopEvent },

    #[error("no candidate available in state {0}")]
    MissingCandidate(LoopState),
}

/// Receives loop progress. `record` must make the attempt durable before it
/// returns; the next attempt does not start until it has.
#[async_trait]
pub trait AttemptSink: Send + Sync {
    async fn record(&self, job: &Job, attempt: &Attempt) -> Result<(), StoreError>;

    /// Called on entry to every state.
    fn entered(&self, _state: LoopState, _iteration: u32) {}
}

pub struct RetryController {
    generator: Arc<dyn Generator>,
    sandbox: Arc<dyn Sandbox>,
    reviewer: Arc<dyn Reviewer>,
    infra_backoff: RetryConfig,
    feedback_limits: FeedbackLimits,
}

impl RetryController {
    pub fn new(
        generator: Arc<dyn Generator>,
        sandbox: Arc<dyn Sandbox>,
        reviewer: Arc<dyn Reviewer>,
        infra_backoff: RetryConfig,
        feedback_limits: FeedbackLimits,
    ) -> Self {
        Self {
            generator,
            sandbox,
            reviewer,
            infra_backoff,
            feedback_limits,
        }
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    /// Runs the loop to a terminal state (`Passed`, `Exhausted` or `InfraError`).
    ///
    /// The job's counters, attempts and artifact are updated in place. Only
    /// a failure to persist an attempt (or a broken invariant) returns `Err`.
    pub async fn run(&self, job: &mut Job, sink: &dyn AttemptSink) -> Result<LoopState, ControllerError> {
        let mut machine = LoopMachine::new(job.max_attempts, self.infra_backoff.max_retries);
        let mut feedback: Option<Feedback> = None;
        let mut source: Option<String> = None;
        let mut result: Option<ExecutionResult> = None;

        self.apply(&mut machine, LoopEvent::Start, job)?;

        loop {
            job.iteration = machine.iteration();
            job.infra_failures = machine.infra_failures();
            let state = machine.state();
            sink.entered(state, machine.iteration());

            let event = match state {
                LoopState::Generating => {
                    match self
                        .generator
                        .generate(&job.task, job.language, feedback.as_ref())
                        .await
                    {
                        Ok(code) => {
                            source = Some(code);
                            LoopEvent::Generated
                        }
                        Err(e) => {
                            warn!(job_id = %job.id, attempt = machine.iteration(), error = %e, "generation failed");
                            LoopEvent::InfraFailure
                        }
                    }
                }
                LoopState::Executing => {
                    let code = source.clone().ok_or(ControllerError::MissingCandidate(state))?;
                    result = Some(self.execute(job, code).await);
                    LoopEvent::Executed
                }
                LoopState::Reviewing => {
                    let (Some(code), Some(executed)) = (source.as_deref(), result.as_ref()) else {
                        return Err(ControllerError::MissingCandidate(state));
                    };
                    match self
                        .reviewer
                        .review(&job.task, job.language, code, executed)
                        .await
                    {
                        Ok(verdict) => match verdict.category() {
                            Some(category) if category.is_infrastructure() => {
                                warn!(
                                    job_id = %job.id,
                                    attempt = machine.iteration(),
                                    detail = executed.detail.as_deref().unwrap_or_default(),
                                    "sandbox unavailable"
                                );
                                LoopEvent::Failed(category)
                            }
                            _ => {
                                let attempt = self.attempt(machine.iteration(), code, executed, verdict);
                                feedback = attempt.feedback.clone();
                                let event = match attempt.verdict.category() {
                                    None => LoopEvent::Passed,
                                    Some(category) => LoopEvent::Failed(category),
                                };
                                job.push_attempt(attempt.clone())?;
                                sink.record(job, &attempt).await?;
                                if event == LoopEvent::Passed {
                                    job.artifact = Some(Artifact {
                                        source: attempt.source,
                                        result: attempt.result,
                                    });
                                }
                                event
                            }
                        },
                        Err(e) => {
                            warn!(job_id = %job.id, attempt = machine.iteration(), error = %e, "review failed");
                            LoopEvent::InfraFailure
                        }
                    }
                }
                LoopState::RetryPending => LoopEvent::Continue,
                LoopState::Passed | LoopState::Exhausted | LoopState::InfraError => {
                    return Ok(state);
                }
                LoopState::Pending => LoopEvent::Start,
            };

            self.apply(&mut machine, event, job)?;
            if let Some(delay) = self.pending_delay(&machine, event) {
                sleep(delay).await;
            }
        }
    }

    fn apply(&self, machine: &mut LoopMachine, event: LoopEvent, job: &Job) -> Result<(), ControllerError> {
        match machine.next(event) {
            Transition::Next(next) => {
                info!(job_id = %job.id, attempt = machine.iteration(), state = %next, "loop transition");
            }
            Transition::Retry { iteration, category } => {
                info!(
                    job_id = %job.id,
                    attempt = iteration,
                    max_attempts = job.max_attempts,
                    %category,
                    "attempt failed, retrying"
                );
            }
            Transition::InfraRetry { state, failures } => {
                warn!(
                    job_id = %job.id,
                    attempt = machine.iteration(),
                    failures,
                    max_infra_retries = self.infra_backoff.max_retries,
                    retry_in = %state,
                    "infrastructure failure, retrying"
                );
            }
            Transition::Complete(terminal) => {
                info!(job_id = %job.id, attempt = machine.iteration(), state = %terminal, "loop finished");
            }
            Transition::Invalid { state, event } => {
                return Err(ControllerError::InvalidTransition { state, event });
            }
        }
        Ok(())
    }

    // Backoff only applies after an infrastructure retry.
    fn pending_delay(&self, machine: &LoopMachine, event: LoopEvent) -> Option<Duration> {
        let infra = match event {
            LoopEvent::InfraFailure => true,
            LoopEvent::Failed(category) => category.is_infrastructure(),
            _ => false,
        };
        (infra && !machine.state().is_terminal()).then(|| {
            Duration::from_millis(self.infra_backoff.delay_for_attempt(machine.infra_failures()))
        })
    }

    async fn execute(&self, job: &Job, source: String) -> ExecutionResult {
        let request = ExecutionRequest {
            language: job.language,
            source,
            stdin: job.task.stdin.clone(),
            limits: job.task.limits.clone(),
        };
        match self.sandbox.execute(request).await {
            Ok(result) => result,
            Err(e) => ExecutionResult::unavailable(e.to_string()),
        }
    }

    fn attempt(&self, sequence: u32, source: &str, result: &ExecutionResult, verdict: ReviewVerdict) -> Attempt {
        let feedback = Feedback::from_failure(sequence, &verdict, result, &self.feedback_limits);
        Attempt {
            sequence,
            source: source.to_string(),
            result: result.clone(),
            verdict,
            feedback,
            recorded_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::agent::ReviewAgent;
    use crate::language::Language;
    use crate::sandbox::ExecutionOutcome;
    use crate::state_machine::{FailureCategory, TaskSpec};
    use crate::testing::{ScriptedGenerator, ScriptedSandbox, exited};

    #[derive(Default)]
    struct RecordingSink {
        recorded: Mutex<Vec<u32>>,
        states: Mutex<Vec<LoopState>>,
    }

    #[async_trait]
    impl AttemptSink for RecordingSink {
        async fn record(&self, job: &Job, attempt: &Attempt) -> Result<(), StoreError> {
            assert_eq!(job.attempts.last().map(|a| a.sequence), Some(attempt.sequence));
            self.recorded.lock().push(attempt.sequence);
            Ok(())
        }

        fn entered(&self, state: LoopState, _iteration: u32) {
            self.states.lock().push(state);
        }
    }

    fn controller(generator: ScriptedGenerator, sandbox: ScriptedSandbox, max_infra: u32) -> RetryController {
        RetryController::new(
            Arc::new(generator),
            Arc::new(sandbox),
            Arc::new(ReviewAgent::new()),
            RetryConfig {
                max_retries: max_infra,
                base_delay_ms: 10,
            },
            FeedbackLimits::default(),
        )
    }

    fn job(max_attempts: u32) -> Job {
        Job::new(
            "alice".into(),
            Language::Python,
            TaskSpec::new("print 7").with_expected_output("7"),
            max_attempts,
        )
    }

    #[tokio::test]
    async fn first_attempt_passes() {
        let generator = ScriptedGenerator::new(vec![Ok("print(7)")]);
        let sandbox = ScriptedSandbox::new(vec![exited(0, "7\n", "")]);
        let sink = RecordingSink::default();
        let mut job = job(3);

        let state = controller(generator, sandbox, 2).run(&mut job, &sink).await.unwrap();

        assert_eq!(state, LoopState::Passed);
        assert_eq!(job.iteration, 1);
        assert_eq!(*sink.recorded.lock(), vec![1]);
        assert_eq!(job.artifact.as_ref().unwrap().source, "print(7)");
        assert_eq!(
            *sink.states.lock(),
            vec![LoopState::Generating, LoopState::Executing, LoopState::Reviewing, LoopState::Passed]
        );
    }

    #[tokio::test]
    async fn feedback_from_failed_attempt_reaches_next_generation() {
        let generator = ScriptedGenerator::new(vec![Ok("print(8)"), Ok("print(7)")]);
        let seen = generator.feedback_log();
        let sandbox = ScriptedSandbox::new(vec![exited(0, "8\n", ""), exited(0, "7\n", "")]);
        let mut job = job(3);

        let state = controller(generator, sandbox, 2)
            .run(&mut job, &RecordingSink::default())
            .await
            .unwrap();

        assert_eq!(state, LoopState::Passed);
        assert_eq!(job.iteration, 2);
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].is_none());
        let feedback = seen[1].as_ref().unwrap();
        assert_eq!(feedback.attempt, 1);
        assert_eq!(feedback.category, FailureCategory::WrongOutput);
        assert_eq!(job.attempts[0].feedback.as_ref(), Some(feedback));
    }

    #[tokio::test]
    async fn exhausts_at_the_ceiling() {
        let generator = ScriptedGenerator::new(vec![Ok("print(8)"); 3]);
        let sandbox = ScriptedSandbox::new(vec![exited(0, "8\n", ""); 3]);
        let mut job = job(3);

        let state = controller(generator, sandbox, 2)
            .run(&mut job, &RecordingSink::default())
            .await
            .unwrap();

        assert_eq!(state, LoopState::Exhausted);
        assert_eq!(job.iteration, 3);
        assert_eq!(job.attempts.len(), 3);
        assert!(job.artifact.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sandbox_outage_does_not_consume_an_attempt() {
        let generator = ScriptedGenerator::new(vec![Ok("print(7)")]);
        let sandbox = ScriptedSandbox::new(vec![
            ExecutionResult::unavailable("no capacity"),
            exited(0, "7\n", ""),
        ]);
        let calls = sandbox.calls();
        let sink = RecordingSink::default();
        let mut job = job(3);

        let state = controller(generator, sandbox, 2).run(&mut job, &sink).await.unwrap();

        assert_eq!(state, LoopState::Passed);
        assert_eq!(job.iteration, 1);
        assert_eq!(job.infra_failures, 1);
        assert_eq!(*calls.lock(), 2);
        assert_eq!(*sink.recorded.lock(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_generation_outage_is_infra_error() {
        let generator = ScriptedGenerator::new(vec![Err(()), Err(()), Err(())]);
        let sandbox = ScriptedSandbox::new(vec![]);
        let mut job = job(3);

        let state = controller(generator, sandbox, 2)
            .run(&mut job, &RecordingSink::default())
            .await
            .unwrap();

        assert_eq!(state, LoopState::InfraError);
        assert_eq!(job.iteration, 1);
        assert!(job.attempts.is_empty());
    }

    #[tokio::test]
    async fn sandbox_errors_become_unavailable_results() {
        let generator = ScriptedGenerator::new(vec![Ok("print(7)")]);
        let sandbox = ScriptedSandbox::new(vec![]).unsupported();
        let mut job = job(1);

        let state = controller(generator, sandbox, 0)
            .run(&mut job, &RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(state, LoopState::InfraError);
        assert!(job.attempts.is_empty());
    }

    #[tokio::test]
    async fn timeout_is_a_candidate_failure() {
        let generator = ScriptedGenerator::new(vec![Ok("while True: pass")]);
        let timed_out = ExecutionResult {
            exit_code: None,
            outcome: ExecutionOutcome::TimedOut,
            ..exited(0, "", "")
        };
        let sandbox = ScriptedSandbox::new(vec![timed_out]);
        let mut job = job(1);

        let state = controller(generator, sandbox, 2)
            .run(&mut job, &RecordingSink::default())
            .await
            .unwrap();
        assert_eq!(state, LoopState::Exhausted);
        assert_eq!(job.last_failure().unwrap().category, FailureCategory::Timeout);
    }
}
