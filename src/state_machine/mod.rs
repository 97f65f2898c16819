mod job;
mod state;

pub use job::{
    Artifact, Attempt, AttemptSummary, AuditRecord, FailureCategory, FailureReason, Job,
    JobError, JobErrorCategory, JobSnapshot, JobStateError, JobStatus, RetryConfig,
    ReviewVerdict, TaskSpec,
};
pub use state::{LoopEvent, LoopMachine, LoopState, Transition};
