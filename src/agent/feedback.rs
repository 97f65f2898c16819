use serde::{Deserialize, Serialize};

use crate::sandbox::{CapturedOutput, ExecutionResult};
use crate::state_machine::{FailureCategory, ReviewVerdict};

const ELLIPSIS: &str = "…[truncated]";

/// Size ceilings for feedback carried into the next generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackLimits {
    #[serde(default = "default_max_detail_bytes")]
    pub max_detail_bytes: usize,
    #[serde(default = "default_max_excerpt_bytes")]
    pub max_excerpt_bytes: usize,
}

fn default_max_detail_bytes() -> usize {
    2048
}

fn default_max_excerpt_bytes() -> usize {
    1024
}

impl Default for FeedbackLimits {
    fn default() -> Self {
        Self {
            max_detail_bytes: default_max_detail_bytes(),
            max_excerpt_bytes: default_max_excerpt_bytes(),
        }
    }
}

/// What the previous attempt got wrong, bounded in size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub attempt: u32,
    pub category: FailureCategory,
    pub detail: String,
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout_excerpt: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr_excerpt: String,
}

impl Feedback {
    /// Builds feedback from a failing verdict; `None` when the verdict passed.
    pub fn from_failure(
        attempt: u32,
        verdict: &ReviewVerdict,
        result: &ExecutionResult,
        limits: &FeedbackLimits,
    ) -> Option<Self> {
        let failure = verdict.failure.as_ref()?;
        Some(Self {
            attempt,
            category: failure.category,
            detail: clip(&failure.detail, limits.max_detail_bytes),
            exit_code: result.exit_code,
            stdout_excerpt: excerpt(&result.stdout, limits.max_excerpt_bytes),
            stderr_excerpt: excerpt(&result.stderr, limits.max_excerpt_bytes),
        })
    }
}

fn excerpt(output: &CapturedOutput, max: usize) -> String {
    let text = clip(&output.text, max);
    if output.truncated && !text.ends_with(ELLIPSIS) {
        format!("{text}{ELLIPSIS}")
    } else {
        text
    }
}

/// Cuts `text` to at most `max` bytes on a char boundary, marking the cut.
pub(crate) fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{ELLIPSIS}", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ExecutionOutcome;

    fn result(stdout: &str, stderr: &str) -> ExecutionResult {
        ExecutionResult {
            exit_code: Some(1),
            stdout: CapturedOutput::from_text(stdout),
            stderr: CapturedOutput::from_text(stderr),
            duration_ms: 5,
            outcome: ExecutionOutcome::Exited,
            detail: None,
        }
    }

    #[test]
    fn passing_verdict_has_no_feedback() {
        let feedback = Feedback::from_failure(
            1,
            &ReviewVerdict::pass(),
            &result("", ""),
            &FeedbackLimits::default(),
        );
        assert!(feedback.is_none());
    }

    #[test]
    fn feedback_is_bounded() {
        let limits = FeedbackLimits {
            max_detail_bytes: 10,
            max_excerpt_bytes: 4,
        };
        let verdict = ReviewVerdict::fail(FailureCategory::RuntimeError, "a".repeat(100));
        let feedback =
            Feedback::from_failure(2, &verdict, &result("stdout!", "Traceback"), &limits).unwrap();
        assert_eq!(feedback.attempt, 2);
        assert_eq!(feedback.category, FailureCategory::RuntimeError);
        assert_eq!(feedback.detail, format!("{}{ELLIPSIS}", "a".repeat(10)));
        assert_eq!(feedback.stdout_excerpt, format!("stdo{ELLIPSIS}"));
        assert_eq!(feedback.stderr_excerpt, format!("Trac{ELLIPSIS}"));
        assert_eq!(feedback.exit_code, Some(1));
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("héllo", 2), format!("h{ELLIPSIS}"));
        assert_eq!(clip("short", 10), "short");
    }

    #[test]
    fn truncated_capture_is_marked_even_when_short() {
        let mut stdout = CapturedOutput::from_text("abc");
        stdout.truncated = true;
        assert_eq!(excerpt(&stdout, 100), format!("abc{ELLIPSIS}"));
    }
}
