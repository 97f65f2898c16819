use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use super::feedback::clip;
use crate::anthropic::{AnthropicError, MessageSender, MessagesRequest};
use crate::language::Language;
use crate::sandbox::{ExecutionOutcome, ExecutionResult};
use crate::state_machine::{FailureCategory, ReviewVerdict, TaskSpec};

/// How much of the program's output the judge gets to see.
const JUDGE_OUTPUT_BYTES: usize = 4096;
const JUDGE_MAX_TOKENS: u32 = 512;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("review capability unavailable: {0}")]
    Unavailable(#[from] AnthropicError),

    #[error("review capability returned an unreadable verdict: {0}")]
    Malformed(String),
}

/// Decides pass/fail for one executed candidate.
#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(
        &self,
        task: &TaskSpec,
        language: Language,
        source: &str,
        result: &ExecutionResult,
    ) -> Result<ReviewVerdict, ReviewError>;
}

/// Outcome of a semantic correctness judgment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Judgment {
    pub pass: bool,
    #[serde(default)]
    pub reason: String,
}

/// Judges correctness when the task has no fixed expected output.
#[async_trait]
pub trait SemanticJudge: Send + Sync {
    async fn judge(
        &self,
        task: &TaskSpec,
        language: Language,
        source: &str,
        result: &ExecutionResult,
    ) -> Result<Judgment, ReviewError>;
}

/// Deterministic checks first (timeout, exit code, expected output), then an
/// optional semantic judge for open-ended tasks.
#[derive(Default)]
pub struct ReviewAgent {
    judge: Option<Arc<dyn SemanticJudge>>,
}

impl ReviewAgent {
    pub fn new() -> Self {
        Self { judge: None }
    }

    pub fn with_judge(judge: Arc<dyn SemanticJudge>) -> Self {
        Self { judge: Some(judge) }
    }
}

#[async_trait]
impl Reviewer for ReviewAgent {
    async fn review(
        &self,
        task: &TaskSpec,
        language: Language,
        source: &str,
        result: &ExecutionResult,
    ) -> Result<ReviewVerdict, ReviewError> {
        match result.outcome {
            ExecutionOutcome::TimedOut => {
                return Ok(ReviewVerdict::fail(
                    FailureCategory::Timeout,
                    format!("program did not finish within the time limit ({} ms elapsed)", result.duration_ms),
                ));
            }
            ExecutionOutcome::SandboxUnavailable => {
                return Ok(ReviewVerdict::fail(
                    FailureCategory::SandboxUnavailable,
                    result.detail.clone().unwrap_or_else(|| "sandbox unavailable".into()),
                ));
            }
            ExecutionOutcome::Exited => {}
        }

        if let Some(verdict) = check_exit(task, language, result) {
            return Ok(verdict);
        }

        if let Some(expected) = task.expected_output.as_deref() {
            return Ok(compare_output(expected, result));
        }

        let Some(judge) = &self.judge else {
            return Ok(ReviewVerdict::pass());
        };
        let judgment = judge.judge(task, language, source, result).await?;
        debug!(%language, pass = judgment.pass, "semantic judgment");
        if judgment.pass {
            Ok(ReviewVerdict::pass())
        } else {
            Ok(ReviewVerdict::fail(
                FailureCategory::IncompleteSpecMatch,
                judgment.reason,
            ))
        }
    }
}

fn check_exit(task: &TaskSpec, language: Language, result: &ExecutionResult) -> Option<ReviewVerdict> {
    let expected = task.expected_exit_code.unwrap_or(0);
    let actual = result.exit_code?;
    if actual == expected {
        return None;
    }

    let stderr = &result.stderr.text;
    let category = if language.runtime().looks_like_compile_error(stderr) {
        FailureCategory::CompileError
    } else {
        FailureCategory::RuntimeError
    };
    let mut detail = format!("exited with status {actual}, expected {expected}");
    if let Some(line) = first_meaningful_line(stderr) {
        detail.push_str(": ");
        detail.push_str(line);
    }
    Some(ReviewVerdict::fail(category, detail))
}

fn first_meaningful_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).find(|line| !line.is_empty())
}

fn compare_output(expected: &str, result: &ExecutionResult) -> ReviewVerdict {
    let want = normalize(expected);
    let got = normalize(&result.stdout.text);
    if want == got {
        return ReviewVerdict::pass();
    }

    let mut detail = match first_difference(&want, &got) {
        Some((line, want_line, got_line)) => {
            format!("output differs at line {line}: expected {want_line:?}, got {got_line:?}")
        }
        None => "output differs from the expected output".to_string(),
    };
    if result.stdout.truncated {
        detail.push_str(&format!(
            " (stdout was truncated after {} of {} bytes)",
            result.stdout.text.len(),
            result.stdout.total_bytes
        ));
    }
    ReviewVerdict::fail(FailureCategory::WrongOutput, detail)
}

/// Ignores trailing whitespace per line, trailing blank lines and CRLF.
fn normalize(text: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}

fn first_difference<'a>(want: &[&'a str], got: &[&'a str]) -> Option<(usize, &'a str, &'a str)> {
    let len = want.len().max(got.len());
    (0..len).find_map(|i| {
        let w = want.get(i).copied().unwrap_or("<end of output>");
        let g = got.get(i).copied().unwrap_or("<end of output>");
        (w != g).then_some((i + 1, w, g))
    })
}

/// Semantic judge backed by an LLM Messages endpoint.
pub struct LlmJudge<C> {
    client: C,
    model: String,
}

impl<C: MessageSender> LlmJudge<C> {
    pub fn new(client: C, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

#[async_trait]
impl<C: MessageSender> SemanticJudge for LlmJudge<C> {
    async fn judge(
        &self,
        task: &TaskSpec,
        language: Language,
        source: &str,
        result: &ExecutionResult,
    ) -> Result<Judgment, ReviewError> {
        let prompt = format!(
            "Decide whether this {language} program correctly and completely solves the task.\n\n\
             TASK:\n{task}\n\nSOURCE:\n{source}\n\nSTDOUT:\n{stdout}\n\nSTDERR:\n{stderr}\n\n\
             Reply with a single JSON object: {{\"pass\": true|false, \"reason\": \"...\"}}",
            task = task.description.trim(),
            stdout = clip(&result.stdout.text, JUDGE_OUTPUT_BYTES),
            stderr = clip(&result.stderr.text, JUDGE_OUTPUT_BYTES),
        );
        let request = MessagesRequest {
            temperature: Some(0.0),
            ..MessagesRequest::user(self.model.clone(), JUDGE_MAX_TOKENS, prompt)
        };
        let reply = self.client.send_message(&request).await?.text();
        parse_judgment(&reply)
    }
}

fn parse_judgment(reply: &str) -> Result<Judgment, ReviewError> {
    let start = reply.find('{');
    let end = reply.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if start < end => &reply[start..=end],
        _ => return Err(ReviewError::Malformed(clip(reply, 200))),
    };
    serde_json::from_str(json).map_err(|e| ReviewError::Malformed(e.to_string()))
}
