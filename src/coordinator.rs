//! Owns the externally visible job lifecycle around one retry-loop run.
//!
//! `submit` is synchronous about refusals: a rejected submission never
//! creates a job record. Accepted jobs run on their own task, each with a
//! child [`CancellationToken`] so `cancel` and `shutdown` can drop the
//! in-flight generation or execution. The [`AdmissionTicket`] is owned by that
//! task and released when it ends, whatever the exit path.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, error, info, info_span, warn};

use crate::admission::{AdmissionController, AdmissionTicket, QuotaPolicy, quota_from_config};
use crate::agent::{LlmGenerator, LlmJudge, ReviewAgent, Reviewer};
use crate::anthropic::AnthropicClient;
use crate::config::CodeloopConfig;
use crate::controller::{AttemptSink, RetryController};
use crate::error::{CodeloopError, StoreError, SubmitError};
use crate::language::Language;
use crate::sandbox;
use crate::state_machine::{
    Attempt, Job, JobError, JobErrorCategory, JobSnapshot, JobStatus, LoopState, TaskSpec,
};
use crate::store::{FileJobStore, JobStore};

/// Live progress of an active job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Progress {
    status: JobStatus,
    phase: Option<LoopState>,
    iteration: u32,
}

struct ActiveJob {
    token: CancellationToken,
    progress: watch::Receiver<Progress>,
}

struct Shared {
    controller: RetryController,
    store: Arc<dyn JobStore>,
    admission: AdmissionController,
    quota: Arc<dyn QuotaPolicy>,
    default_max_attempts: u32,
    active: Mutex<HashMap<String, ActiveJob>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct JobCoordinator {
    shared: Arc<Shared>,
}

impl JobCoordinator {
    pub fn new(
        controller: RetryController,
        store: Arc<dyn JobStore>,
        admission: AdmissionController,
        quota: Arc<dyn QuotaPolicy>,
        default_max_attempts: u32,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                controller,
                store,
                admission,
                quota,
                default_max_attempts,
                active: Mutex::new(HashMap::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Wires the full pipeline (sandbox backend, LLM agents, file store) from config.
    pub async fn from_config(config: &CodeloopConfig) -> Result<Self, CodeloopError> {
        config
            .validate()
            .map_err(|e| CodeloopError::Config(e.to_string()))?;
        if config.generation.api_key.is_empty() {
            return Err(CodeloopError::Config(
                "generation.api_key is empty; set ANTHROPIC_API_KEY".into(),
            ));
        }

        let sandbox = sandbox::from_config(&config.sandbox)?;
        let client = || match &config.generation.base_url {
            Some(url) => AnthropicClient::with_base_url(config.generation.api_key.clone(), url.clone()),
            None => AnthropicClient::new(config.generation.api_key.clone()),
        };
        let generator = Arc::new(LlmGenerator::new(client()?, &config.generation));
        let reviewer: Arc<dyn Reviewer> = if config.review.semantic_judge {
            Arc::new(ReviewAgent::with_judge(Arc::new(LlmJudge::new(
                client()?,
                config.review.model.clone(),
            ))))
        } else {
            Arc::new(ReviewAgent::new())
        };

        let controller = RetryController::new(
            generator,
            sandbox,
            reviewer,
            config.retry.infra_backoff(),
            config.feedback.clone(),
        );
        let store = Arc::new(FileJobStore::open(&config.store.dir).await?);

        Ok(Self::new(
            controller,
            store,
            AdmissionController::new(&config.admission),
            quota_from_config(&config.quota),
            config.retry.max_attempts,
        ))
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.shared.store
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.shared.admission
    }

    /// Accepts a job or refuses it synchronously. Refused submissions leave no record.
    pub async fn submit(
        &self,
        user_id: &str,
        language: Language,
        task: TaskSpec,
    ) -> Result<String, SubmitError> {
        let shared = &self.shared;
        if shared.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        validate_task(&task)?;
        if !shared.controller.sandbox().supports(language) {
            return Err(SubmitError::UnsupportedLanguage(language));
        }

        let ticket = tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => return Err(SubmitError::ShuttingDown),
            ticket = shared.admission.acquire(user_id) => ticket?,
        };
        // A quota refusal drops the ticket on the way out.
        shared.quota.try_consume(user_id)?;

        let job = Job::new(user_id.to_string(), language, task, shared.default_max_attempts);
        shared.store.create_job(&job).await?;
        let job_id = job.id.clone();
        info!(job_id = %job_id, user = user_id, %language, max_attempts = job.max_attempts, "job queued");

        let token = shared.shutdown.child_token();
        let (progress_tx, progress_rx) = watch::channel(Progress {
            status: JobStatus::Queued,
            phase: None,
            iteration: 0,
        });
        shared.active.lock().insert(
            job_id.clone(),
            ActiveJob {
                token: token.clone(),
                progress: progress_rx,
            },
        );

        let span = info_span!("job", job_id = %job_id, user = user_id, %language);
        shared.tracker.spawn(
            run_job(self.shared.clone(), job, ticket, token, progress_tx).instrument(span),
        );
        Ok(job_id)
    }

    /// Current view of a job. Active jobs include their live loop phase.
    pub async fn status(&self, job_id: &str) -> Result<JobSnapshot, StoreError> {
        let job = self.shared.store.read_job(job_id).await?;
        let mut snapshot = JobSnapshot::from(&job);
        let live = self
            .shared
            .active
            .lock()
            .get(job_id)
            .map(|active| *active.progress.borrow());
        if let Some(progress) = live
            && !snapshot.status.is_terminal()
        {
            snapshot.phase = progress.phase;
            snapshot.iteration = snapshot.iteration.max(progress.iteration);
        }
        Ok(snapshot)
    }

    /// Requests cancellation. Returns false when the job is unknown or already finished.
    pub fn cancel(&self, job_id: &str) -> bool {
        let active = self.shared.active.lock();
        match active.get(job_id) {
            Some(job)
                if !job.token.is_cancelled() && !job.progress.borrow().status.is_terminal() =>
            {
                info!(job_id, "cancellation requested");
                job.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Waits until the job reaches a terminal status.
    pub async fn wait(&self, job_id: &str) -> Result<JobSnapshot, StoreError> {
        let progress = self
            .shared
            .active
            .lock()
            .get(job_id)
            .map(|active| active.progress.clone());
        if let Some(mut progress) = progress {
            // An error means the task is gone; the store has the final word.
            let _ = progress.wait_for(|p| p.status.is_terminal()).await;
        }
        self.status(job_id).await
    }

    /// Cancels every active job and waits for their tasks to finish.
    pub async fn shutdown(&self) {
        info!("coordinator shutting down");
        self.shared.shutdown.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
    }

    /// Marks jobs left queued or running by a previous process as
    /// `error/interrupted`. Their recorded attempts are kept.
    pub async fn recover_interrupted(&self) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for mut job in self.shared.store.list_jobs().await? {
            if job.status.is_terminal() || self.shared.active.lock().contains_key(&job.id) {
                continue;
            }
            job.error = Some(JobError {
                category: JobErrorCategory::Interrupted,
                last_failure: job.last_failure().cloned(),
                message: format!("process stopped while the job was {}", job.status),
            });
            job.set_status(JobStatus::Error)
                .map_err(|source| StoreError::InvalidUpdate {
                    job_id: job.id.clone(),
                    source,
                })?;
            self.shared.store.update_status(&job).await?;
            warn!(job_id = %job.id, attempts = job.attempts.len(), "interrupted job marked as error");
            recovered += 1;
        }
        Ok(recovered)
    }
}

fn validate_task(task: &TaskSpec) -> Result<(), SubmitError> {
    let invalid = |msg: &str| Err(SubmitError::InvalidTask(msg.to_string()));
    if task.description.trim().is_empty() {
        return invalid("description must not be empty");
    }
    if task.max_attempts == Some(0) {
        return invalid("max_attempts must be at least 1");
    }
    let limits = &task.limits;
    if limits.timeout_ms == Some(0)
        || limits.memory_mb == Some(0)
        || limits.pids == Some(0)
        || limits.output_limit_bytes == Some(0)
    {
        return invalid("resource limits must be positive");
    }
    if limits.cpus.is_some_and(|cpus| cpus.is_nan() || cpus <= 0.0) {
        return invalid("cpus must be positive");
    }
    Ok(())
}

/// Persists attempts as they complete and publishes loop progress.
struct StoreSink<'a> {
    store: &'a dyn JobStore,
    progress: &'a watch::Sender<Progress>,
}

#[async_trait]
impl AttemptSink for StoreSink<'_> {
    async fn record(&self, job: &Job, attempt: &Attempt) -> Result<(), StoreError> {
        self.store.append_attempt(&job.id, attempt).await?;
        self.store.update_status(job).await
    }

    fn entered(&self, state: LoopState, iteration: u32) {
        self.progress.send_modify(|p| {
            p.phase = Some(state);
            p.iteration = iteration;
        });
    }
}

async fn run_job(
    shared: Arc<Shared>,
    mut job: Job,
    ticket: AdmissionTicket,
    token: CancellationToken,
    progress: watch::Sender<Progress>,
) {
    let store = shared.store.as_ref();

    if token.is_cancelled() {
        info!("cancelled before start");
    } else if let Err(e) = job.set_status(JobStatus::Running) {
        error!(error = %e, "job could not start");
    } else {
        progress.send_modify(|p| p.status = JobStatus::Running);
        if let Err(e) = store.update_status(&job).await {
            warn!(error = %e, "failed to persist running status");
        }
    }

    let outcome = if job.status == JobStatus::Running {
        let sink = StoreSink {
            store,
            progress: &progress,
        };
        let run = AssertUnwindSafe(shared.controller.run(&mut job, &sink)).catch_unwind();
        tokio::select! {
            biased;
            _ = token.cancelled() => None,
            outcome = run => Some(outcome),
        }
    } else {
        None
    };

    let status = match outcome {
        None => {
            info!(iteration = job.iteration, "job cancelled");
            JobStatus::Cancelled
        }
        Some(Ok(Ok(LoopState::Passed))) => {
            info!(iteration = job.iteration, "job done");
            JobStatus::Done
        }
        Some(Ok(Ok(LoopState::Exhausted))) => {
            job.error = Some(JobError {
                category: JobErrorCategory::MaxRetriesExceeded,
                last_failure: job.last_failure().cloned(),
                message: format!("all {} attempts failed review", job.max_attempts),
            });
            JobStatus::Error
        }
        Some(Ok(Ok(state))) => {
            job.error = Some(JobError {
                category: JobErrorCategory::Infrastructure,
                last_failure: job.last_failure().cloned(),
                message: format!(
                    "platform could not complete the job after {} infrastructure failure(s) (loop state {state})",
                    job.infra_failures
                ),
            });
            JobStatus::Error
        }
        Some(Ok(Err(e))) => {
            error!(error = %e, "retry loop aborted");
            job.error = Some(JobError {
                category: JobErrorCategory::Infrastructure,
                last_failure: job.last_failure().cloned(),
                message: e.to_string(),
            });
            JobStatus::Error
        }
        Some(Err(panic)) => {
            let message = panic_message(panic.as_ref());
            error!(panic = %message, "retry loop panicked");
            job.error = Some(JobError {
                category: JobErrorCategory::Infrastructure,
                last_failure: job.last_failure().cloned(),
                message: format!("retry loop panicked: {message}"),
            });
            JobStatus::Error
        }
    };

    if let Err(e) = job.set_status(status) {
        error!(error = %e, "invalid terminal transition");
    }
    if let Some(err) = &job.error {
        warn!(category = %err.category, attempts = job.attempts.len(), message = %err.message, "job failed");
    }
    if let Err(e) = store.update_status(&job).await {
        error!(error = %e, "failed to persist terminal status");
    }

    progress.send_modify(|p| {
        p.status = job.status;
        p.iteration = job.iteration;
    });
    shared.active.lock().remove(&job.id);
    drop(ticket);
}

fn panic_message<'a>(panic: &'a (dyn Any + Send + 'static)) -> &'a str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
