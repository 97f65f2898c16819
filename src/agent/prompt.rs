//! Prompt assembly and code extraction for the generation call.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use super::feedback::Feedback;
use crate::language::Language;
use crate::state_machine::{FailureCategory, TaskSpec};

pub const SYSTEM_PROMPT: &str = "You are an expert programmer. You write complete, \
runnable programs that read from standard input and write to standard output. \
Reply with the source code only.";

static FENCED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)(?:```|~~~)[ \t]*([A-Za-z0-9_+#-]*)[ \t]*\r?\n(.*?)\r?\n[ \t]*(?:```|~~~)")
        .expect("valid regex")
});

/// Builds the user message for one generation request.
pub fn generation_prompt(task: &TaskSpec, language: Language, feedback: Option<&Feedback>) -> String {
    let name = language.as_str().to_uppercase();
    let mut prompt = format!(
        "Write a complete {name} program for the following task.\n\nTASK:\n{}\n",
        task.description.trim()
    );

    if let Some(requirements) = task.requirements.as_deref().filter(|r| !r.trim().is_empty()) {
        let _ = write!(prompt, "\nREQUIREMENTS:\n{}\n", requirements.trim());
    }
    if let Some(stdin) = task.stdin.as_deref() {
        let _ = write!(prompt, "\nThe program receives this on standard input:\n{stdin}\n");
    }
    if let Some(expected) = task.expected_output.as_deref() {
        let _ = write!(prompt, "\nIt must print exactly:\n{expected}\n");
    }
    if let Some(code) = task.expected_exit_code {
        let _ = write!(prompt, "\nIt must exit with status {code}.\n");
    }
    if let Some(hint) = language_hint(language) {
        let _ = write!(prompt, "\n{hint}\n");
    }

    if let Some(feedback) = feedback {
        let _ = write!(
            prompt,
            "\nATTEMPT {} FAILED ({}): {}\n",
            feedback.attempt,
            describe(feedback.category),
            feedback.detail
        );
        if let Some(code) = feedback.exit_code {
            let _ = writeln!(prompt, "Exit status: {code}");
        }
        if !feedback.stdout_excerpt.is_empty() {
            let _ = write!(prompt, "Stdout:\n{}\n", feedback.stdout_excerpt);
        }
        if !feedback.stderr_excerpt.is_empty() {
            let _ = write!(prompt, "Stderr:\n{}\n", feedback.stderr_excerpt);
        }
        prompt.push_str("Fix these issues in the new version.\n");
    }

    let _ = write!(
        prompt,
        "\nRespond with the complete {name} source only, with no explanation before or after it."
    );
    prompt
}

fn language_hint(language: Language) -> Option<&'static str> {
    match language {
        Language::Java => Some("The entry point must be `public class Main` with a `main` method."),
        Language::Go => Some("Use `package main` and only the standard library."),
        Language::Python | Language::Javascript => Some("Use only the standard library."),
        Language::C | Language::Cpp => None,
    }
}

fn describe(category: FailureCategory) -> &'static str {
    match category {
        FailureCategory::WrongOutput => "wrong output",
        FailureCategory::CompileError => "compile error",
        FailureCategory::RuntimeError => "runtime error",
        FailureCategory::Timeout => "timed out",
        FailureCategory::IncompleteSpecMatch => "does not fully meet the task",
        FailureCategory::SandboxUnavailable => "sandbox unavailable",
    }
}

/// Pulls source code out of a model reply.
///
/// Prefers a fenced block tagged with the target language, then any fenced
/// block, then the whole reply. Returns an empty string for a blank reply.
pub fn extract_code(reply: &str, language: Language) -> String {
    let blocks: Vec<(String, &str)> = FENCED
        .captures_iter(reply)
        .filter_map(|caps| {
            let tag = caps.get(1).map_or("", |m| m.as_str()).to_lowercase();
            caps.get(2).map(|body| (tag, body.as_str()))
        })
        .collect();

    let tagged = blocks
        .iter()
        .find(|(tag, _)| tag.parse::<Language>().is_ok_and(|l| l == language));
    if let Some((_, body)) = tagged.or_else(|| blocks.first()) {
        return body.trim().to_string();
    }

    // An opening fence without a closing one, e.g. a reply cut at max_tokens.
    let trimmed = reply.trim();
    if let Some(rest) = trimmed.strip_prefix("```").or_else(|| trimmed.strip_prefix("~~~")) {
        let body = rest.split_once('\n').map_or("", |(_, body)| body);
        return body.trim_end_matches('`').trim().to_string();
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::feedback::Feedback;

    #[test]
    fn first_prompt_has_task_and_no_feedback() {
        let task = TaskSpec::new("sum two integers")
            .with_stdin("3 4")
            .with_expected_output("7");
        let prompt = generation_prompt(&task, Language::Python, None);
        assert!(prompt.contains("PYTHON"));
        assert!(prompt.contains("sum two integers"));
        assert!(prompt.contains("3 4"));
        assert!(prompt.contains("print exactly:\n7"));
        assert!(!prompt.contains("FAILED"));
    }

    #[test]
    fn retry_prompt_carries_category_and_detail() {
        let feedback = Feedback {
            attempt: 1,
            category: FailureCategory::CompileError,
            detail: "expected ';'".into(),
            exit_code: Some(1),
            stdout_excerpt: String::new(),
            stderr_excerpt: "main.c:3: error".into(),
        };
        let prompt = generation_prompt(&TaskSpec::new("hello"), Language::C, Some(&feedback));
        assert!(prompt.contains("ATTEMPT 1 FAILED (compile error): expected ';'"));
        assert!(prompt.contains("Stderr:\nmain.c:3: error"));
        assert!(!prompt.contains("Stdout:"));
    }

    #[test]
    fn java_prompt_requires_main_class() {
        let prompt = generation_prompt(&TaskSpec::new("hello"), Language::Java, None);
        assert!(prompt.contains("public class Main"));
    }

    #[test]
    fn extracts_language_tagged_block_first() {
        let reply = "Here:\n```text\nnot code\n```\nand\n```python\nprint(1)\n```\n";
        assert_eq!(extract_code(reply, Language::Python), "print(1)");
    }

    #[test]
    fn falls_back_to_any_block_then_raw_reply() {
        let reply = "```\nconsole.log(1)\n```";
        assert_eq!(extract_code(reply, Language::Javascript), "console.log(1)");
        assert_eq!(extract_code("  print(2)\n", Language::Python), "print(2)");
        assert_eq!(extract_code("~~~go\npackage main\n~~~", Language::Go), "package main");
    }

    #[test]
    fn unterminated_fence_is_stripped() {
        let reply = "```cpp\nint main() { return 0; }\n";
        assert_eq!(extract_code(reply, Language::Cpp), "int main() { return 0; }");
    }

    #[test]
    fn blank_reply_is_empty() {
        assert_eq!(extract_code("   \n", Language::Python), "");
        assert_eq!(extract_code("```python\n\n```", Language::Python), "");
    }
}
