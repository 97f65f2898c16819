//! The two LLM-facing agents of the loop: one writes candidates, the other
//! judges them.

mod feedback;
mod generator;
mod prompt;
mod reviewer;

pub use feedback::{Feedback, FeedbackLimits};
pub use generator::{GenerationError, Generator, LlmGenerator};
pub use prompt::{extract_code, generation_prompt};
pub use reviewer::{Judgment, LlmJudge, ReviewAgent, ReviewError, Reviewer, SemanticJudge};
