use std::sync::LazyLock;

use regex::Regex;

use super::{CommandPlan, Language, LanguageRuntime};

static COMPILE_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(SyntaxError|IndentationError|TabError)\b").expect("valid regex")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct Python;

impl LanguageRuntime for Python {
    fn language(&self) -> Language {
        Language::Python
    }

    fn source_file(&self) -> &'static str {
        "main.py"
    }

    fn image(&self) -> &'static str {
        "python:3.11-slim"
    }

    fn commands(&self, _build_dir: &str) -> CommandPlan {
        CommandPlan {
            compile: None,
            run: "python3 -B main.py".to_string(),
        }
    }

    fn compile_error_pattern(&self) -> &'static Regex {
        &COMPILE_ERROR
    }
}
