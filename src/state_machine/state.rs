use std::fmt;

use serde::{Deserialize, Serialize};

use super::job::FailureCategory;

/// States of one generate → execute → review loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Pending,
    Generating,
    Executing,
    Reviewing,
    RetryPending,
    Passed,
    Exhausted,
    InfraError,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoopState::Passed | LoopState::Exhausted | LoopState::InfraError
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Pending => write!(f, "PENDING"),
            LoopState::Generating => write!(f, "GENERATING"),
            LoopState::Executing => write!(f, "EXECUTING"),
            LoopState::Reviewing => write!(f, "REVIEWING"),
            LoopState::RetryPending => write!(f, "RETRY_PENDING"),
            LoopState::Passed => write!(f, "PASSED"),
            LoopState::Exhausted => write!(f, "EXHAUSTED"),
            LoopState::InfraError => write!(f, "INFRA_ERROR"),
        }
    }
}

/// What happened in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEvent {
    Start,
    /// The generator returned a candidate.
    Generated,
    /// The sandbox returned a result (any outcome).
    Executed,
    Passed,
    Failed(FailureCategory),
    /// A collaborator (generator, reviewer) could not be reached.
    InfraFailure,
    /// Leave `RetryPending` for the next attempt.
    Continue,
}

/// The result of evaluating a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Advance to the next state.
    Next(LoopState),
    /// The candidate failed and another attempt is allowed. `iteration` is
    /// the attempt that just failed.
    Retry {
        iteration: u32,
        category: FailureCategory,
    },
    /// An infrastructure failure is retried by re-entering `state`.
    InfraRetry { state: LoopState, failures: u32 },
    /// The loop reached a terminal state.
    Complete(LoopState),
    /// The event makes no sense in the current state; nothing changed.
    Invalid { state: LoopState, event: LoopEvent },
}

/// Pure transition function of the retry loop.
///
/// Candidate failures consume iterations; infrastructure failures consume the
/// separate `max_infra_retries` budget and never touch the iteration count.
#[derive(Debug, Clone)]
pub struct LoopMachine {
    state: LoopState,
    iteration: u32,
    max_attempts: u32,
    infra_failures: u32,
    max_infra_retries: u32,
}

impl LoopMachine {
    pub fn new(max_attempts: u32, max_infra_retries: u32) -> Self {
        Self {
            state: LoopState::Pending,
            iteration: 0,
            max_attempts: max_attempts.max(1),
            infra_failures: 0,
            max_infra_retries,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    pub fn infra_failures(&self) -> u32 {
        self.infra_failures
    }

    pub fn next(&mut self, event: LoopEvent) -> Transition {
        use LoopEvent as E;
        use LoopState as S;

        match (self.state, event) {
            (S::Pending, E::Start) => {
                self.iteration = 1;
                self.advance(S::Generating)
            }
            (S::Generating, E::Generated) => self.advance(S::Executing),
            (S::Generating, E::InfraFailure) => self.infra_failure(S::Generating),
            (S::Executing, E::Executed) => self.advance(S::Reviewing),
            (S::Reviewing, E::Passed) => self.complete(S::Passed),
            // The sandbox could not run the candidate: same source, run it again.
            (S::Reviewing, E::Failed(category)) if category.is_infrastructure() => {
                self.infra_failure(S::Executing)
            }
            (S::Reviewing, E::Failed(category)) => {
                if self.iteration < self.max_attempts {
                    self.state = S::RetryPending;
                    Transition::Retry {
                        iteration: self.iteration,
                        category,
                    }
                } else {
                    self.complete(S::Exhausted)
                }
            }
            (S::Reviewing, E::InfraFailure) => self.infra_failure(S::Reviewing),
            (S::RetryPending, E::Continue) => {
                self.iteration += 1;
                self.advance(S::Generating)
            }
            (state, event) => Transition::Invalid { state, event },
        }
    }

    fn advance(&mut self, to: LoopState) -> Transition {
        self.state = to;
        Transition::Next(to)
    }

    fn complete(&mut self, to: LoopState) -> Transition {
        self.state = to;
        Transition::Complete(to)
    }

    fn infra_failure(&mut self, retry_in: LoopState) -> Transition {
        self.infra_failures += 1;
        if self.infra_failures <= self.max_infra_retries {
            self.state = retry_in;
            Transition::InfraRetry {
                state: retry_in,
                failures: self.infra_failures,
            }
        } else {
            self.complete(LoopState::InfraError)
        }
    }
}
