//! Hand-written collaborator fakes shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::agent::{Feedback, GenerationError, Generator};
use crate::language::Language;
use crate::sandbox::{
    CapturedOutput, ExecutionOutcome, ExecutionRequest, ExecutionResult, Sandbox, SandboxError,
    SandboxHealth,
};
use crate::state_machine::TaskSpec;

pub fn exited(code: i64, stdout: &str, stderr: &str) -> ExecutionResult {
    ExecutionResult {
        exit_code: Some(code),
        stdout: CapturedOutput::from_text(stdout),
        stderr: CapturedOutput::from_text(stderr),
        duration_ms: 3,
        outcome: ExecutionOutcome::Exited,
        detail: None,
    }
}

/// Returns scripted sources in order; `Err(())` is a generation outage.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<&'static str, ()>>>,
    feedback: Arc<Mutex<Vec<Option<Feedback>>>>,
}

impl ScriptedGenerator {
    pub fn new(script: Vec<Result<&'static str, ()>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            feedback: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Feedback passed to every `generate` call, in order.
    pub fn feedback_log(&self) -> Arc<Mutex<Vec<Option<Feedback>>>> {
        self.feedback.clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(
        &self,
        _task: &TaskSpec,
        _language: Language,
        feedback: Option<&Feedback>,
    ) -> Result<String, GenerationError> {
        self.feedback.lock().push(feedback.cloned());
        match self.script.lock().pop_front() {
            Some(Ok(source)) => Ok(source.to_string()),
            Some(Err(())) | None => Err(GenerationError::NoArtifact),
        }
    }
}

/// Returns scripted execution results in order.
pub struct ScriptedSandbox {
    script: Mutex<VecDeque<ExecutionResult>>,
    calls: Arc<Mutex<u32>>,
    unsupported: bool,
}

impl ScriptedSandbox {
    pub fn new(script: Vec<ExecutionResult>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Arc::new(Mutex::new(0)),
            unsupported: false,
        }
    }

    /// Every execution fails with `UnsupportedLanguage`.
    pub fn unsupported(mut self) -> Self {
        self.unsupported = true;
        self
    }

    pub fn calls(&self) -> Arc<Mutex<u32>> {
        self.calls.clone()
    }
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    fn supports(&self, _language: Language) -> bool {
        true
    }

    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        *self.calls.lock() += 1;
        if self.unsupported {
            return Err(SandboxError::UnsupportedLanguage(request.language));
        }
        Ok(self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| ExecutionResult::unavailable("script exhausted")))
    }

    async fn health(&self) -> SandboxHealth {
        fake_health("scripted")
    }
}

/// Blocks every execution until the future is dropped, then flags the teardown.
#[derive(Default)]
pub struct BlockingSandbox {
    pub started: Arc<Notify>,
    pub torn_down: Arc<AtomicBool>,
}

struct TeardownFlag(Arc<AtomicBool>);

impl Drop for TeardownFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Sandbox for BlockingSandbox {
    fn supports(&self, _language: Language) -> bool {
        true
    }

    async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionResult, SandboxError> {
        let _flag = TeardownFlag(self.torn_down.clone());
        self.started.notify_one();
        std::future::pending().await
    }

    async fn health(&self) -> SandboxHealth {
        fake_health("blocking")
    }
}

fn fake_health(backend: &'static str) -> SandboxHealth {
    SandboxHealth {
        backend,
        available: true,
        detail: None,
        runtimes: BTreeMap::new(),
    }
}
